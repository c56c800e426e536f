use std::fmt::{self, Write};
use std::time::Duration;

use crate::graph::{TaskGraph, escape};
use crate::task::{NodeInfo, NodeState};

use super::RunReport;

impl RunReport {
    /// Renders the executed graph as a Mermaid flowchart.
    ///
    /// Nodes that ran are coloured by duration (green for the fastest, red for
    /// the slowest), skipped nodes are light blue and failed nodes get a red
    /// border.
    pub fn render_mermaid(&self, graph: &TaskGraph) -> String {
        let mut output = String::new();
        let _ = self.write_mermaid(graph, &mut output);
        output
    }

    /// Renders a waterfall chart of the nodes that ran, as SVG.
    pub fn render_waterfall(&self) -> String {
        let mut output = String::new();
        let _ = self.write_waterfall(&mut output);
        output
    }

    fn write_mermaid(&self, graph: &TaskGraph, f: &mut String) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let ran = self.results.values().filter(|info| info.ran);
        let (min, max) = ran.fold((f64::MAX, f64::MIN), |(min, max), info| {
            let secs = info.duration.as_secs_f64();
            (min.min(secs), max.max(secs))
        });
        let (min, max) = match min > max {
            true => (0.0, 1.0),
            false if (max - min).abs() < f64::EPSILON => (min, min + 1.0),
            false => (min, max),
        };

        for (index, node) in graph.nodes() {
            let name = escape(node.name());

            let (label, colour) = match self.results.get(&index) {
                Some(info) if info.ran => (
                    format!("{:.2?}", info.duration),
                    heat((info.duration.as_secs_f64() - min) / (max - min)),
                ),
                Some(NodeInfo {
                    state: NodeState::Skipped(reason),
                    ..
                }) => (format!("{reason:?}"), "#ADD8E6".to_string()),
                _ => ("Pending".to_string(), "#FFFFFF".to_string()),
            };

            writeln!(f, "    {index}[\"{name}\\n{label}\"]")?;
            write!(f, "    style {index} fill:{colour}")?;
            if self.failures.contains(&index) {
                write!(f, ",stroke:#FF0000,stroke-width:3px")?;
            }
            writeln!(f)?;
        }

        for (source, target, kind) in graph.edges() {
            writeln!(f, "    {source} -- \"{kind:?}\" --> {target}")?;
        }

        Ok(())
    }

    fn write_waterfall(&self, f: &mut String) -> fmt::Result {
        let mut ran: Vec<&NodeInfo> = self.results.values().filter(|info| info.ran).collect();

        if ran.is_empty() {
            f.push_str(concat!(
                r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg">"#,
                r#"<text x="10" y="30" font-family="sans-serif">No tasks ran</text></svg>"#,
            ));
            return Ok(());
        }

        ran.sort_by_key(|info| info.start);

        let end = ran
            .iter()
            .map(|info| info.start + info.duration)
            .max()
            .unwrap_or(Duration::ZERO);
        let total_micros = end.as_micros().max(1) as f64;

        let row_height = 30;
        let label_width = 300;
        let chart_width = 800;
        let padding = 10;
        let header_height = 30;
        let text_space = 80;

        let width = label_width + chart_width + (padding * 3) + text_space;
        let height = header_height + (ran.len() as u32 * row_height) + padding;

        write!(
            f,
            r#"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg">
    <style>
        .task-row:nth-child(even) {{ fill: #f9f9f9; }}
        .task-row:nth-child(odd) {{ fill: #ffffff; }}
        text {{
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Helvetica, sans-serif;
            font-size: 12px;
        }}
        .bar {{ fill: #3b82f6; rx: 4; }}
        .bar.failed {{ fill: #ef4444; }}
        .label {{ fill: #333; }}
        .time {{ fill: #666; font-size: 11px; }}
        .grid-line {{ stroke: #e5e7eb; stroke-width: 1; }}
        .axis-label {{ fill: #9ca3af; font-size: 10px; }}
    </style>
    <rect width="100%" height="100%" fill="white" />
"#
        )?;

        for i in 0..=5 {
            let pct = i as f64 / 5.0;
            let x = label_width as f64 + padding as f64 + (chart_width as f64 * pct);
            let label = micros(total_micros * pct);

            writeln!(
                f,
                r#"    <line x1="{x}" y1="{header_height}" x2="{x}" y2="{height}"
        class="grid-line" />
    <text x="{x}" y="{y}" text-anchor="middle" class="axis-label">{label}</text>"#,
                y = header_height - 5,
            )?;
        }

        for (i, info) in ran.iter().enumerate() {
            let y = header_height + (i as u32 * row_height);
            let name = info.name.replace('&', "&amp;").replace('<', "&lt;");

            let offset = info.start.as_micros() as f64;
            let duration = info.duration.as_micros() as f64;
            let bar_x =
                label_width as f64 + padding as f64 + (offset / total_micros * chart_width as f64);
            let bar_width = (duration / total_micros * chart_width as f64).max(1.0);
            let class = match info.state {
                NodeState::Failed => "bar failed",
                _ => "bar",
            };

            writeln!(
                f,
                r#"    <rect x="0" y="{y}" width="{width}" height="{row_height}" class="task-row" />
    <text x="{padding}" y="{mid}" class="label" dominant-baseline="middle">{name}</text>
    <rect x="{bar_x}" y="{bar_y}" width="{bar_width}" height="{bar_height}" class="{class}">
        <title>{name}: {dur:.2?}</title>
    </rect>
    <text x="{text_x}" y="{mid}" class="time" dominant-baseline="middle">{label}</text>"#,
                mid = y + row_height / 2,
                bar_y = y + 5,
                bar_height = row_height - 10,
                dur = info.duration,
                text_x = bar_x + bar_width + 5.0,
                label = micros(duration),
            )?;
        }

        f.push_str("</svg>");
        Ok(())
    }
}

fn micros(value: f64) -> String {
    match value < 1000.0 {
        true => format!("{value:.0}µs"),
        false => format!("{:.2}ms", value / 1000.0),
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn heat(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let (r, g) = match t < 0.5 {
        true => ((255.0 * t * 2.0) as u8, 255),
        false => (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8),
    };

    format!("#{r:02X}{g:02X}00")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskContext;
    use crate::executor::{Executor, ExecutorConfig};
    use crate::graph::{EdgeKind, TaskNode};
    use crate::task::{FnTask, TaskOutput};

    #[test]
    fn test_heat() {
        assert_eq!(heat(0.0), "#00FF00");
        assert_eq!(heat(0.5), "#FFFF00");
        assert_eq!(heat(1.0), "#FF0000");
    }

    #[test]
    fn test_render() {
        let mut graph = TaskGraph::new("render");
        graph
            .add_node(TaskNode::leaf(FnTask::conditional("check", |_| {
                Ok(TaskOutput::failure("nope"))
            })))
            .unwrap();
        graph
            .add_node(TaskNode::leaf(FnTask::new("refine", |_| Ok(TaskOutput::success()))))
            .unwrap();
        graph.add_edge(0, 1, EdgeKind::OnSuccess).unwrap();

        let executor = Executor::new(ExecutorConfig::default().with_threads(1)).unwrap();
        let report = executor.run(&graph, &TaskContext::new()).unwrap();

        let mermaid = report.render_mermaid(&graph);
        assert!(mermaid.starts_with("graph LR\n"));
        assert!(mermaid.contains(r#"1["refine\nUnsatisfiable"]"#));
        assert!(mermaid.contains("style 1 fill:#ADD8E6"));
        assert!(mermaid.contains(r#"0 -- "OnSuccess" --> 1"#));

        let svg = report.render_waterfall();
        assert!(svg.contains(">check<"));
        assert!(!svg.contains(">refine<"));
        assert!(svg.ends_with("</svg>"));
    }

    #[test]
    fn test_render_failures_and_empty_runs() {
        let mut graph = TaskGraph::new("failing");
        graph
            .add_node(TaskNode::leaf(FnTask::new("plan", |_| Ok(TaskOutput::failure("no path")))))
            .unwrap();

        let executor = Executor::new(ExecutorConfig::default().with_threads(1)).unwrap();
        let report = executor.run(&graph, &TaskContext::new()).unwrap();

        let mermaid = report.render_mermaid(&graph);
        assert!(mermaid.contains(",stroke:#FF0000,stroke-width:3px\n"));
        assert!(report.render_waterfall().contains(r#"class="bar failed""#));

        let empty = TaskGraph::new("empty");
        let report = executor.run(&empty, &TaskContext::new()).unwrap();
        assert!(report.render_waterfall().contains("No tasks ran"));
        assert_eq!(report.render_mermaid(&empty), "graph LR\n");
    }
}

use std::borrow::Cow;

use crate::error::{InputError, KumikiError};
use crate::graph::{EdgeKind, TaskGraph, TaskNode};
use crate::program::{Anchor, CompositeInstruction, Instruction, PlanInput};

use super::GraphGenerator;

/// Builds a graph for a program of alternating raster and transition
/// segments: `[R0, T0, R1, T1, ..., Rn]`.
///
/// Every segment becomes one composite node wrapping the graph of its
/// sub-generator. Rasters are independent roots. Each transition waits for
/// the two rasters next to it, and resolves its start and end poses from
/// them only when it runs.
pub struct RasterGenerator {
    name: Cow<'static, str>,
    raster: Box<dyn GraphGenerator>,
    transition: Box<dyn GraphGenerator>,
}

impl RasterGenerator {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        raster: impl GraphGenerator + 'static,
        transition: impl GraphGenerator + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            raster: Box::new(raster),
            transition: Box::new(transition),
        }
    }

    /// Checks the whole program before anything is built.
    pub fn check_input<'a>(
        &self,
        input: &'a PlanInput,
    ) -> Result<&'a CompositeInstruction, InputError> {
        let program = input.composite().ok_or(InputError::NotComposite)?;

        if !input.has_declared_start() && !input.start.is_set() {
            return Err(InputError::MissingStart);
        }

        if program.is_empty() {
            return Err(InputError::Empty);
        }

        if let Some(index) = program.children.iter().position(|c| !c.is_composite()) {
            return Err(InputError::MalformedSegment { index });
        }

        if program.len() % 2 == 0 {
            return Err(InputError::DanglingTransition { len: program.len() });
        }

        Ok(program)
    }

    /// The last pose before segment `idx`: the closest earlier segment with a
    /// waypoint, else the program start. Never fails on a checked program.
    fn raster_start(input: &PlanInput, program: &CompositeInstruction, idx: usize) -> Anchor {
        program.children[..idx]
            .iter()
            .rev()
            .find_map(Instruction::last_waypoint)
            .map(|waypoint| Anchor::Waypoint(waypoint.clone()))
            .unwrap_or_else(|| input.declared_start())
    }

    fn segment_graph(
        generator: &dyn GraphGenerator,
        input: &PlanInput,
        idx: usize,
        start: Anchor,
        end: Anchor,
    ) -> Result<TaskGraph, KumikiError> {
        let child = input
            .child(idx, start, end)
            .ok_or(InputError::MalformedSegment { index: idx })?;

        generator.generate(&child).map_err(|e| {
            InputError::Segment {
                index: idx,
                source: Box::new(e),
            }
            .into()
        })
    }
}

impl GraphGenerator for RasterGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&self, input: &PlanInput) -> Result<TaskGraph, KumikiError> {
        let program = self.check_input(input)?;

        // Build every segment before touching the graph, so a failing
        // sub-generator leaves nothing behind.
        let mut nodes = Vec::with_capacity(program.len());

        for (idx, segment) in program.children.iter().enumerate() {
            let description = segment.as_composite().map_or("", |c| c.description.as_str());

            let node = match idx % 2 {
                0 => {
                    let start = Self::raster_start(input, program, idx);
                    let raster = self.raster.as_ref();
                    let graph = Self::segment_graph(raster, input, idx, start, Anchor::Unset)?;
                    TaskNode::composite(format!("Raster #{}: {description}", idx / 2), graph)
                }
                _ => {
                    let start = Anchor::Segment(idx - 1);
                    let end = Anchor::Segment(idx + 1);
                    let transition = self.transition.as_ref();
                    let graph = Self::segment_graph(transition, input, idx, start, end)?;
                    TaskNode::composite(format!("Transition #{}: {description}", idx / 2), graph)
                }
            };

            nodes.push(node.with_description(description));
        }

        let mut graph = TaskGraph::new(self.name.clone());
        for node in nodes {
            graph.add_node(node)?;
        }

        // Node indices match segment positions.
        for idx in (1..program.len()).step_by(2) {
            graph.add_edge(idx - 1, idx, EdgeKind::Unconditional)?;
            graph.add_edge(idx + 1, idx, EdgeKind::Unconditional)?;
        }

        tracing::debug!(
            "{}: {} rasters, {} transitions",
            self.name,
            program.len().div_ceil(2),
            program.len() / 2
        );

        Ok(graph)
    }
}

use std::borrow::Cow;
use std::sync::Arc;

use crate::error::KumikiError;
use crate::graph::{EdgeKind, TaskGraph, TaskNode};
use crate::program::PlanInput;
use crate::task::Task;

use super::GraphGenerator;

/// Creates the task for one step, given the segment it will work on.
pub type TaskFactory = Arc<dyn Fn(&PlanInput) -> Box<dyn Task> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Step,
    Check,
    Fallback,
}

/// A linear pipeline of steps, generated fresh for every segment.
///
/// ```text
/// step --> check --success--> step --> ...
///            \
///             --failure--> fallback --> fallback
/// ```
///
/// A check is a conditional step: the following step only runs if it passes.
/// Fallbacks hang off the last check and only run if it fails.
#[derive(Clone)]
pub struct SequenceGenerator {
    name: Cow<'static, str>,
    steps: Vec<(Role, TaskFactory)>,
}

impl SequenceGenerator {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step<F, T>(self, factory: F) -> Self
    where
        F: Fn(&PlanInput) -> T + Send + Sync + 'static,
        T: Task + 'static,
    {
        self.push(Role::Step, factory)
    }

    pub fn check<F, T>(self, factory: F) -> Self
    where
        F: Fn(&PlanInput) -> T + Send + Sync + 'static,
        T: Task + 'static,
    {
        self.push(Role::Check, factory)
    }

    pub fn on_failure<F, T>(self, factory: F) -> Self
    where
        F: Fn(&PlanInput) -> T + Send + Sync + 'static,
        T: Task + 'static,
    {
        self.push(Role::Fallback, factory)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn push<F, T>(mut self, role: Role, factory: F) -> Self
    where
        F: Fn(&PlanInput) -> T + Send + Sync + 'static,
        T: Task + 'static,
    {
        let factory: TaskFactory =
            Arc::new(move |input: &PlanInput| -> Box<dyn Task> { Box::new(factory(input)) });
        self.steps.push((role, factory));
        self
    }
}

impl GraphGenerator for SequenceGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&self, input: &PlanInput) -> Result<TaskGraph, KumikiError> {
        let name = match input.index {
            Some(index) => format!("{} #{index}", self.name),
            None => self.name.to_string(),
        };
        let mut graph = TaskGraph::new(name);

        // Previous node of the main chain, and whether it was conditional.
        let mut previous: Option<(usize, bool)> = None;
        let mut last_check = None;

        for (role, factory) in self.steps.iter().filter(|(role, _)| *role != Role::Fallback) {
            let node = TaskNode::boxed(factory(input));
            let conditional = *role == Role::Check || node.is_conditional();
            let index = graph.add_node(node.with_conditional(conditional))?;

            if let Some((from, was_conditional)) = previous {
                let kind = match was_conditional {
                    true => EdgeKind::OnSuccess,
                    false => EdgeKind::Unconditional,
                };
                graph.add_edge(from, index, kind)?;
            }

            if conditional {
                last_check = Some(index);
            }
            previous = Some((index, conditional));
        }

        // The first fallback branches off the last check, the rest follow it.
        let mut branch = last_check
            .or(previous.map(|(index, _)| index))
            .map(|index| (index, EdgeKind::OnFailure));

        for (_, factory) in self.steps.iter().filter(|(role, _)| *role == Role::Fallback) {
            let index = graph.add_node(TaskNode::boxed(factory(input)))?;

            if let Some((from, kind)) = branch {
                graph.add_edge(from, index, kind)?;
            }
            branch = Some((index, EdgeKind::Unconditional));
        }

        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskContext;
    use crate::executor::{Executor, ExecutorConfig};
    use crate::program::{Anchor, CompositeInstruction, Waypoint};
    use crate::task::{FnTask, NodeState, SkipReason, TaskOutput};

    struct Fixed {
        name: &'static str,
        succeed: bool,
    }

    impl Task for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn run(&self, _: &TaskContext) -> crate::task::TaskResult<TaskOutput> {
            Ok(match self.succeed {
                true => TaskOutput::success(),
                false => TaskOutput::failure("rejected"),
            })
        }
    }

    fn ok(name: &'static str) -> impl Fn(&PlanInput) -> Fixed + Send + Sync + 'static {
        move |_: &PlanInput| Fixed { name, succeed: true }
    }

    fn fails(name: &'static str) -> impl Fn(&PlanInput) -> Fixed + Send + Sync + 'static {
        move |_: &PlanInput| Fixed {
            name,
            succeed: false,
        }
    }

    fn input() -> PlanInput {
        let program = CompositeInstruction::new("program")
            .with_start(Waypoint::new([0.0]))
            .with_child(CompositeInstruction::new("raster").with_child(Waypoint::new([1.0])));

        PlanInput::new(program)
            .child(0, Anchor::Unset, Anchor::Unset)
            .unwrap()
    }

    #[test]
    fn test_wiring() {
        let generator = SequenceGenerator::new("freespace")
            .step(ok("seed"))
            .check(fails("input check"))
            .step(ok("plan"))
            .on_failure(ok("report"))
            .on_failure(ok("cleanup"));

        let graph = generator.generate(&input()).unwrap();

        assert_eq!(graph.name(), "freespace #0");
        assert_eq!(graph.node_count(), 5);
        assert_eq!(
            graph.edges(),
            vec![
                (0, 1, EdgeKind::Unconditional),
                (1, 2, EdgeKind::OnSuccess),
                (1, 3, EdgeKind::OnFailure),
                (3, 4, EdgeKind::Unconditional),
            ]
        );
        assert!(graph.node(1).unwrap().is_conditional());
        assert!(!graph.node(2).unwrap().is_conditional());
    }

    #[test]
    fn test_failed_check_takes_fallback() {
        let generator = SequenceGenerator::new("freespace")
            .check(fails("input check"))
            .step(ok("plan"))
            .on_failure(ok("fallback"));

        let graph = generator.generate(&input()).unwrap();
        let executor = Executor::new(ExecutorConfig::default().with_threads(2)).unwrap();
        let report = executor.run(&graph, &TaskContext::new()).unwrap();

        assert!(report.is_success());
        assert_eq!(
            graph.states(),
            vec![
                NodeState::Failed,
                NodeState::Skipped(SkipReason::Unsatisfiable),
                NodeState::Succeeded
            ]
        );
    }

    #[test]
    fn test_factories_see_segment() {
        let generator = SequenceGenerator::new("named").step(|input: &PlanInput| {
            FnTask::new(format!("plan {}", input.description()), |_| Ok(TaskOutput::success()))
        });

        let graph = generator.generate(&input()).unwrap();
        assert_eq!(graph.node(0).unwrap().name(), "plan raster");

        // Every call builds a fresh graph.
        let again = generator.generate(&input()).unwrap();
        assert!(!again.is_started());
    }

    #[test]
    fn test_empty_sequence() {
        let graph = SequenceGenerator::new("empty").generate(&input()).unwrap();
        assert!(graph.is_empty());
    }
}

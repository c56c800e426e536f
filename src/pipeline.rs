use std::sync::Arc;

use crate::context::{AbortHandle, TaskContext};
use crate::error::KumikiError;
use crate::executor::{Executor, RunReport};
use crate::generator::GraphGenerator;
use crate::graph::TaskGraph;
use crate::program::PlanInput;

/// Generator, executor and run context bundled behind one caller-facing API.
///
/// ```text
/// generate(input) -> run(on_success, on_failure) -> reset -> run ... -> clear
/// ```
pub struct Pipeline<G> {
    generator: G,
    executor: Executor,
    context: Arc<TaskContext>,
    graph: Option<TaskGraph>,
}

impl<G> Pipeline<G>
where
    G: GraphGenerator,
{
    pub fn new(generator: G, executor: Executor) -> Self {
        Self {
            generator,
            executor,
            context: Arc::new(TaskContext::new()),
            graph: None,
        }
    }

    pub fn name(&self) -> &str {
        self.generator.name()
    }

    /// Drops the previous graph and builds a new one for `input`.
    pub fn generate(&mut self, input: &PlanInput) -> Result<&TaskGraph, KumikiError> {
        self.clear();

        let graph = self.generator.generate(input)?;
        tracing::info!("{}: generated {} nodes", self.name(), graph.node_count());

        Ok(self.graph.insert(graph))
    }

    /// Runs the generated graph. Exactly one of the callbacks is invoked.
    pub fn run<S, F>(&self, on_success: S, on_failure: F) -> Result<RunReport, KumikiError>
    where
        S: FnOnce(&RunReport),
        F: FnOnce(&RunReport),
    {
        let graph = self.graph.as_ref().ok_or(KumikiError::NotGenerated)?;
        let report = self
            .executor
            .run_with_callbacks(graph, &self.context, on_success, on_failure)?;

        Ok(report)
    }

    pub fn abort(&self) {
        self.context.abort();
    }

    /// For aborting from another thread while `run` blocks.
    pub fn abort_handle(&self) -> AbortHandle {
        self.context.abort_handle()
    }

    /// Makes the same graph runnable again. Ports are kept.
    pub fn reset(&mut self) {
        if let Some(graph) = &mut self.graph {
            graph.reset();
        }
        self.context.reset();
    }

    /// Back to the state before `generate`.
    pub fn clear(&mut self) {
        self.graph = None;
        self.context.clear();
    }

    pub fn graph(&self) -> Option<&TaskGraph> {
        self.graph.as_ref()
    }

    pub fn context(&self) -> &Arc<TaskContext> {
        &self.context
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GraphError, InputError};
    use crate::executor::{ExecutorConfig, RunOutcome};
    use crate::generator::{RasterGenerator, SequenceGenerator};
    use crate::program::{CompositeInstruction, Waypoint};
    use crate::task::{FnTask, NodeState, SkipReason, TaskOutput};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Mutex;

    fn program(count: usize) -> PlanInput {
        let program = (0..count).fold(
            CompositeInstruction::new("program").with_start(Waypoint::new([0.0])),
            |program, i| {
                let segment = CompositeInstruction::new(format!("segment {i}"));
                program.with_child(segment.with_child(Waypoint::new([i as f64])))
            },
        );

        PlanInput::new(program)
    }

    fn counting(counter: Arc<AtomicUsize>) -> SequenceGenerator {
        SequenceGenerator::new("count").step(move |_: &PlanInput| {
            let counter = counter.clone();
            FnTask::new("count", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(TaskOutput::success())
            })
        })
    }

    fn executor() -> Executor {
        Executor::new(ExecutorConfig::default().with_threads(2)).unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (raster, transition) = (counting(counter.clone()), counting(counter.clone()));
        let generator = RasterGenerator::new("raster only", raster, transition);
        let mut pipeline = Pipeline::new(generator, executor());

        assert_eq!(pipeline.name(), "raster only");
        assert!(matches!(
            pipeline.run(|_| {}, |_| {}),
            Err(KumikiError::NotGenerated)
        ));

        assert_eq!(pipeline.generate(&program(5)).unwrap().node_count(), 5);

        let report = pipeline.run(|_| {}, |_| {}).unwrap();
        assert!(report.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 5);

        assert!(matches!(
            pipeline.run(|_| {}, |_| {}),
            Err(KumikiError::Graph(GraphError::AlreadyExecuted))
        ));

        pipeline.reset();
        let again = pipeline.run(|_| {}, |_| {}).unwrap();
        assert_eq!(again.outcome, report.outcome);
        assert_eq!(counter.load(Ordering::SeqCst), 10);

        pipeline.clear();
        assert!(pipeline.graph().is_none());
        assert!(pipeline.context().results().is_empty());
    }

    #[test]
    fn test_generate_replaces_graph() {
        let counter = Arc::new(AtomicUsize::new(0));
        let generator =
            RasterGenerator::new("raster only", counting(counter.clone()), counting(counter));
        let mut pipeline = Pipeline::new(generator, executor());

        pipeline.generate(&program(5)).unwrap();
        pipeline.run(|_| {}, |_| {}).unwrap();

        assert_eq!(pipeline.generate(&program(3)).unwrap().node_count(), 3);
        assert!(pipeline.context().results().is_empty());

        let err = pipeline.generate(&program(2)).unwrap_err();
        assert!(matches!(
            err,
            KumikiError::Input(InputError::DanglingTransition { len: 2 })
        ));
        assert!(pipeline.graph().is_none());
    }

    #[test]
    fn test_abort_from_another_thread() {
        let (started_tx, started_rx) = channel();
        let (release_tx, release_rx) = channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let release_rx = Arc::new(Mutex::new(release_rx));

        // Raster 0 blocks until released; the other rasters wait for it
        // through a single-threaded pool.
        let raster = SequenceGenerator::new("raster").step(move |input: &PlanInput| {
            let first = input.index == Some(0);
            let started_tx = started_tx.lock().unwrap().clone();
            let release_rx = release_rx.clone();
            FnTask::new("plan", move |_| {
                if first {
                    started_tx.send(()).ok();
                    release_rx.lock().unwrap().recv().ok();
                }
                Ok(TaskOutput::success())
            })
        });

        let transition = SequenceGenerator::new("transition");
        let generator = RasterGenerator::new("raster only", raster, transition);
        let executor = Executor::new(ExecutorConfig::default().with_threads(1)).unwrap();
        let mut pipeline = Pipeline::new(generator, executor);
        pipeline.generate(&program(5)).unwrap();

        let handle = pipeline.abort_handle();
        let failed = AtomicUsize::new(0);

        let report = std::thread::scope(|s| {
            s.spawn(move || {
                started_rx.recv().ok();
                handle.abort();
                release_tx.send(()).ok();
            });

            pipeline
                .run(|_| {}, |_| {
                    failed.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        });

        assert!(report.is_aborted());
        assert_eq!(report.outcome, RunOutcome::Aborted);
        assert_eq!(failed.into_inner(), 1);
        assert_eq!(report.state(0), Some(NodeState::Succeeded));
        assert!(
            report
                .skipped
                .iter()
                .all(|i| report.state(*i) == Some(NodeState::Skipped(SkipReason::Aborted)))
        );
        assert!(!report.skipped.is_empty());

        // Results stay inspectable after an abort.
        assert_eq!(pipeline.context().results().len(), 5);
    }
}

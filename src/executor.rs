//! Running task graphs.
//!
//! The [`Executor`] owns a bounded `rayon` thread pool and runs one
//! [`TaskGraph`] against one [`TaskContext`] at a time. Scheduling is
//! event-driven: the thread calling [`Executor::run`] acts as the scheduler,
//! worker threads run node bodies and send their [`NodeInfo`] back over a
//! channel.
//!
//! The algorithm works as follows:
//! 1. Every node starts `Pending` with a count of unfinished inbound edges.
//! 2. Roots (no inbound edges) are dispatched straight away.
//! 3. When a node finishes, each outgoing edge is checked against the node's
//!    outcome. An edge whose condition fails marks the target as blocked.
//! 4. Once all inbound edges of a target are resolved, the target is either
//!    dispatched, or skipped if it was blocked.
//! 5. Before dispatching, the abort flag is checked: an aborted run skips
//!    every node that has not started yet, and waits for running ones.
//! 6. The loop ends when every node has reached a final state.
//!
//! Composite nodes call back into the same executor for their child graph,
//! from a pool thread. While such a thread waits for its children it keeps
//! executing pending pool jobs, so nesting never deadlocks on pool capacity
//! and the total concurrency never exceeds the pool size.
mod diagnostics;

use std::collections::{BTreeMap, VecDeque};
use std::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError, channel};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rayon::{ThreadPool, ThreadPoolBuilder, Yield};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::context::{AbortHandle, TaskContext};
use crate::error::{GraphError, KumikiError};
use crate::graph::{NodeKind, TaskGraph, TaskNode};
use crate::task::{NodeInfo, NodeState, SkipReason, Task, TaskOutput};

/// How long a pool thread waiting on a nested graph sleeps when there is no
/// pool work it could help with.
const IDLE_WAIT: Duration = Duration::from_millis(2);

/// What happens to the rest of the run after a run-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Report the failure and let independent branches finish.
    #[default]
    Continue,
    /// Report the failure and raise the abort flag.
    AbortOnFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker pool size; `None` uses the available hardware parallelism.
    pub threads: Option<usize>,
    pub failure_policy: FailurePolicy,
    /// Prefix for worker thread names.
    pub thread_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            threads: None,
            failure_policy: FailurePolicy::default(),
            thread_prefix: "kumiki".into(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_prefix = prefix.into();
        self
    }

    pub fn resolved_threads(&self) -> usize {
        self.threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(1)
            })
            .max(1)
    }
}

/// The single terminal signal of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Succeeded,
    /// The first run-level failure.
    Failed {
        index: usize,
        name: String,
        message: String,
    },
    /// No node failed, but some were skipped because of the abort flag.
    Aborted,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }
}

/// Everything that is known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub graph: String,
    pub outcome: RunOutcome,
    /// Every run-level failure, in completion order. The first one is the
    /// one named by the outcome.
    pub failures: Vec<usize>,
    /// Every skipped node, in completion order.
    pub skipped: Vec<usize>,
    pub results: BTreeMap<usize, NodeInfo>,
    pub duration: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn is_aborted(&self) -> bool {
        self.outcome == RunOutcome::Aborted
    }

    /// Number of nodes whose body was entered.
    pub fn executed(&self) -> usize {
        self.results.values().filter(|info| info.ran).count()
    }

    pub fn state(&self, index: usize) -> Option<NodeState> {
        self.results.get(&index).map(|info| info.state)
    }

    /// Serialize the report to JSON. Payloads are left out.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Runs task graphs on a bounded worker pool.
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct Executor {
    config: ExecutorConfig,
    pool: Arc<ThreadPool>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Result<Self, KumikiError> {
        let prefix = config.thread_prefix.clone();
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.resolved_threads())
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()?;

        Ok(Self {
            config,
            pool: Arc::new(pool),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs the graph to completion and returns the report.
    ///
    /// The returned report is the single terminal signal of the run. The only
    /// error is trying to run a graph twice without resetting it.
    pub fn run(&self, graph: &TaskGraph, context: &TaskContext) -> Result<RunReport, GraphError> {
        let report = self.run_graph(graph, context)?;

        match &report.outcome {
            RunOutcome::Succeeded => {
                tracing::info!("{} finished in {:.2?}", graph.name(), report.duration)
            }
            RunOutcome::Failed { name, .. } => {
                tracing::error!("{} failed: first failure in {name}", graph.name())
            }
            RunOutcome::Aborted => tracing::warn!("{} aborted", graph.name()),
        }

        Ok(report)
    }

    /// Runs the graph and invokes exactly one of the callbacks.
    pub fn run_with_callbacks<S, F>(
        &self,
        graph: &TaskGraph,
        context: &TaskContext,
        on_success: S,
        on_failure: F,
    ) -> Result<RunReport, GraphError>
    where
        S: FnOnce(&RunReport),
        F: FnOnce(&RunReport),
    {
        let report = self.run(graph, context)?;

        match report.is_success() {
            true => on_success(&report),
            false => on_failure(&report),
        }

        Ok(report)
    }

    /// Runs the graph on a background thread.
    pub fn spawn(&self, graph: TaskGraph, context: Arc<TaskContext>) -> RunHandle {
        let executor = self.clone();
        let abort = context.abort_handle();
        let (sender, receiver) = channel();

        let thread = std::thread::spawn(move || {
            let result = executor.run(&graph, &context);
            let _ = sender.send((graph, result));
        });

        RunHandle {
            receiver,
            abort,
            thread,
        }
    }

    fn run_graph(&self, graph: &TaskGraph, context: &TaskContext) -> Result<RunReport, GraphError> {
        graph.begin()?;

        let total = graph.node_count();
        let run_start = Instant::now();

        let span = tracing::span!(Level::INFO, "run_graph", graph = graph.name(), nodes = total);
        if let Ok(style) = crate::utils::get_style_run() {
            span.pb_set_style(&style);
        }
        span.pb_set_length(total as u64);
        span.pb_set_message(graph.name());
        let _enter = span.enter();

        // Unfinished inbound edges per node, and whether any resolved edge
        // already ruled the node out.
        let mut remaining: Vec<usize> = (0..total).map(|i| graph.predecessors(i).len()).collect();
        let mut blocked = vec![false; total];

        let mut failures = Vec::new();
        let mut skipped = Vec::new();
        let mut first_failure = None;
        let mut aborted = false;

        let (sender, receiver) = channel::<NodeInfo>();

        self.pool.in_place_scope(|scope| {
            let executor = self;

            // Nodes that reached a final state without running.
            let mut settled: VecDeque<NodeInfo> = VecDeque::new();

            let dispatch = move |index: usize, settled: &mut VecDeque<NodeInfo>| {
                let Some(node) = graph.node(index) else {
                    return;
                };

                if context.is_aborted() {
                    tracing::debug!("skipping {} (aborted)", node.name());
                    settled.push_back(NodeInfo::skipped(index, node.name(), SkipReason::Aborted));
                    return;
                }

                tracing::debug!("dispatching {}", node.name());
                graph.set_state(index, NodeState::Ready);

                let sender = sender.clone();
                scope.spawn(move |_| {
                    graph.set_state(index, NodeState::Running);
                    let info = executor.execute_node(index, node, context, run_start);
                    let _ = sender.send(info);
                });
            };

            for root in graph.roots() {
                dispatch(root, &mut settled);
            }

            let mut completed = 0;
            while completed < total {
                let info = match settled.pop_front() {
                    Some(info) => info,
                    None => match wait(&receiver) {
                        Some(info) => info,
                        None => break,
                    },
                };

                completed += 1;
                span.pb_inc(1);

                let index = info.index;
                let state = info.state;
                graph.set_state(index, state);

                match state {
                    NodeState::Failed => match graph.node(index) {
                        Some(node) if node.is_conditional() => {
                            tracing::debug!("{} took the failure branch", info.name);
                        }
                        _ => {
                            failures.push(index);

                            if first_failure.is_none() {
                                tracing::error!("{} failed: {}", info.name, info.message);
                                first_failure = Some(RunOutcome::Failed {
                                    index,
                                    name: info.name.clone(),
                                    message: info.message.clone(),
                                });

                                if executor.config.failure_policy == FailurePolicy::AbortOnFailure {
                                    context.abort();
                                }
                            } else {
                                tracing::warn!("{} failed: {}", info.name, info.message);
                            }
                        }
                    },
                    NodeState::Skipped(reason) => {
                        aborted |= reason == SkipReason::Aborted;
                        skipped.push(index);
                    }
                    _ => {}
                }

                for (successor, kind) in graph.successors(index) {
                    if !kind.is_satisfied_by(state) {
                        blocked[successor] = true;
                    }

                    remaining[successor] -= 1;
                    if remaining[successor] > 0 {
                        continue;
                    }

                    match graph.node(successor) {
                        Some(node) if blocked[successor] => {
                            tracing::debug!("skipping {} (condition not met)", node.name());
                            settled.push_back(NodeInfo::skipped(
                                successor,
                                node.name(),
                                SkipReason::Unsatisfiable,
                            ));
                        }
                        _ => dispatch(successor, &mut settled),
                    }
                }

                context.record(info);
            }
        });

        let outcome = match first_failure {
            Some(failure) => failure,
            None if aborted => RunOutcome::Aborted,
            None => RunOutcome::Succeeded,
        };

        Ok(RunReport {
            graph: graph.name().to_string(),
            outcome,
            failures,
            skipped,
            results: context.results(),
            duration: run_start.elapsed(),
        })
    }

    fn execute_node(
        &self,
        index: usize,
        node: &TaskNode,
        context: &TaskContext,
        run_start: Instant,
    ) -> NodeInfo {
        let span = tracing::span!(Level::INFO, "task", name = node.name());
        if let Ok(style) = crate::utils::get_style_task() {
            span.pb_set_style(&style);
        }
        span.pb_set_message(&format!("Running {}", node.name()));
        let _enter = span.enter();

        let start = Instant::now();

        let mut info = match node.kind() {
            NodeKind::Leaf(task) => run_leaf(index, node.name(), task.as_ref(), context),
            NodeKind::Composite(child) => self.run_composite(index, node.name(), child, context),
        };

        info.start = start.duration_since(run_start);
        info.duration = start.elapsed();
        info
    }

    fn run_composite(
        &self,
        index: usize,
        name: &str,
        child: &TaskGraph,
        context: &TaskContext,
    ) -> NodeInfo {
        if context.is_aborted() {
            return NodeInfo::skipped(index, name, SkipReason::Aborted);
        }

        let scoped = context.scoped();
        let report = match self.run_graph(child, &scoped) {
            Ok(report) => report,
            Err(e) => return NodeInfo::from_output(index, name, TaskOutput::failure(e.to_string())),
        };

        let mut info = match &report.outcome {
            RunOutcome::Succeeded => NodeInfo::from_output(index, name, TaskOutput::success()),
            RunOutcome::Failed {
                name: failed,
                message,
                ..
            } => NodeInfo::from_output(
                index,
                name,
                TaskOutput::failure(format!("{failed}: {message}")),
            ),
            RunOutcome::Aborted => {
                let mut info = NodeInfo::skipped(index, name, SkipReason::Aborted);
                info.ran = true;
                info
            }
        };

        info.children = report.results;
        info
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("threads", &self.threads())
            .finish()
    }
}

fn run_leaf(index: usize, name: &str, task: &dyn Task, context: &TaskContext) -> NodeInfo {
    if context.is_aborted() {
        return NodeInfo::skipped(index, name, SkipReason::Aborted);
    }

    // Task bodies only get shared access to the context, whose state is
    // internally synchronized and stays consistent if a body panics.
    match catch_unwind(AssertUnwindSafe(|| task.run(context))) {
        Ok(Ok(output)) => NodeInfo::from_output(index, name, output),
        Ok(Err(e)) => NodeInfo::from_output(index, name, TaskOutput::failure(format!("{e:#}"))),
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            NodeInfo::from_output(index, name, TaskOutput::failure(msg))
        }
    }
}

/// Waits for the next finished node. On a pool thread, pending pool jobs are
/// executed while waiting.
fn wait<T>(receiver: &Receiver<T>) -> Option<T> {
    loop {
        match receiver.try_recv() {
            Ok(value) => return Some(value),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }

        match rayon::yield_now() {
            None => return receiver.recv().ok(),
            Some(Yield::Executed) => {}
            Some(Yield::Idle) => match receiver.recv_timeout(IDLE_WAIT) {
                Ok(value) => return Some(value),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return None,
            },
        }
    }
}

/// A run in progress on a background thread.
pub struct RunHandle {
    receiver: Receiver<(TaskGraph, Result<RunReport, GraphError>)>,
    abort: AbortHandle,
    thread: JoinHandle<()>,
}

impl RunHandle {
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Blocks until the run ends, handing the graph back with its report.
    pub fn wait(self) -> Result<(TaskGraph, RunReport), KumikiError> {
        let received = self.receiver.recv();
        let _ = self.thread.join();

        let (graph, result) = received.map_err(|_| KumikiError::WorkerLost)?;
        Ok((graph, result?))
    }
}

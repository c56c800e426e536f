//! The leaf task contract and the per-node result record.
//!
//! A [`Task`] is the atomic unit of real work: a trajectory optimizer, a
//! collision check, an interpolator. The engine does not care what happens
//! inside. It only needs a name, a flag saying whether the outcome is a branch
//! selector, and a `run` method returning a [`TaskOutput`].
//!
//! Whatever a task returns, or however it fails, the executor records a
//! [`NodeInfo`] for the node. Errors and panics never escape past the node
//! boundary; they become a `Failed` record carrying the diagnostic message.
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::context::TaskContext;
use crate::core::Dynamic;

/// Result from a single executed task body.
pub type TaskResult<T> = anyhow::Result<T, anyhow::Error>;

/// The contract every leaf task implements.
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Conditional tasks produce an outcome used to pick `OnSuccess` or
    /// `OnFailure` successors. Their failures are not run-level failures.
    fn is_conditional(&self) -> bool {
        false
    }

    fn run(&self, context: &TaskContext) -> TaskResult<TaskOutput>;
}

/// What a task body hands back to the executor.
#[derive(Clone, Default)]
pub struct TaskOutput {
    pub succeeded: bool,
    pub message: String,
    pub payload: Option<Dynamic>,
}

impl TaskOutput {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach any domain data (e.g. contact results) to the node record.
    pub fn with_payload<T>(mut self, payload: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.payload = Some(Arc::new(payload));
        self
    }
}

impl Debug for TaskOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOutput")
            .field("succeeded", &self.succeeded)
            .field("message", &self.message)
            .field("payload", &self.payload.as_ref().map(|_| "*"))
            .finish()
    }
}

/// A leaf task built from a closure.
pub struct FnTask<F> {
    name: Cow<'static, str>,
    conditional: bool,
    callback: F,
}

impl<F> FnTask<F>
where
    F: Fn(&TaskContext) -> TaskResult<TaskOutput> + Send + Sync,
{
    pub fn new(name: impl Into<Cow<'static, str>>, callback: F) -> Self {
        Self {
            name: name.into(),
            conditional: false,
            callback,
        }
    }

    pub fn conditional(name: impl Into<Cow<'static, str>>, callback: F) -> Self {
        Self {
            name: name.into(),
            conditional: true,
            callback,
        }
    }
}

impl<F> Task for FnTask<F>
where
    F: Fn(&TaskContext) -> TaskResult<TaskOutput> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn is_conditional(&self) -> bool {
        self.conditional
    }

    fn run(&self, context: &TaskContext) -> TaskResult<TaskOutput> {
        (self.callback)(context)
    }
}

/// Why a node never got to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SkipReason {
    /// A conditional inbound edge can no longer be satisfied.
    Unsatisfiable,
    /// The context abort flag was raised before the node started.
    Aborted,
}

/// Lifecycle of a node within one run.
///
/// `Pending -> Ready -> Running -> {Succeeded, Failed}`, or straight to
/// `Skipped` from `Pending`/`Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum NodeState {
    #[default]
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped(SkipReason),
}

impl NodeState {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Skipped(_)
        )
    }

    /// Outcome as seen by outgoing edges. Skipped counts as failed.
    pub fn is_success(self) -> bool {
        self == NodeState::Succeeded
    }
}

/// Per-node result record, written once when the node reaches a final state.
#[derive(Clone, Serialize)]
pub struct NodeInfo {
    /// Index of the node in its owning graph.
    pub index: usize,
    pub name: String,
    pub state: NodeState,
    /// Whether the node body was entered at all.
    pub ran: bool,
    pub message: String,
    /// Offset from the start of the run.
    pub start: Duration,
    pub duration: Duration,
    #[serde(skip)]
    pub payload: Option<Dynamic>,
    /// Results of a composite node's child graph, keyed by child-local index.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<usize, NodeInfo>,
}

impl NodeInfo {
    pub(crate) fn new(index: usize, name: impl Into<String>, state: NodeState) -> Self {
        Self {
            index,
            name: name.into(),
            state,
            ran: false,
            message: String::new(),
            start: Duration::ZERO,
            duration: Duration::ZERO,
            payload: None,
            children: BTreeMap::new(),
        }
    }

    pub(crate) fn skipped(index: usize, name: impl Into<String>, reason: SkipReason) -> Self {
        let mut info = Self::new(index, name, NodeState::Skipped(reason));
        info.message = match reason {
            SkipReason::Unsatisfiable => "inbound condition cannot be satisfied".into(),
            SkipReason::Aborted => "run aborted before the node started".into(),
        };
        info
    }

    pub(crate) fn from_output(index: usize, name: impl Into<String>, output: TaskOutput) -> Self {
        let state = match output.succeeded {
            true => NodeState::Succeeded,
            false => NodeState::Failed,
        };

        let mut info = Self::new(index, name, state);
        info.ran = true;
        info.message = output.message;
        info.payload = output.payload;
        info
    }

    pub fn succeeded(&self) -> bool {
        self.state.is_success()
    }

    /// Downcast the attached payload, if any.
    pub fn payload<T: 'static>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref::<T>()
    }
}

impl Debug for NodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeInfo")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("ran", &self.ran)
            .field("message", &self.message)
            .field("duration", &self.duration)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_into_info() {
        let output = TaskOutput::failure("in collision").with_payload(3usize);
        let info = NodeInfo::from_output(4, "contact check", output);

        assert_eq!(info.state, NodeState::Failed);
        assert!(info.ran);
        assert!(!info.succeeded());
        assert_eq!(info.message, "in collision");
        assert_eq!(info.payload::<usize>(), Some(&3));
        assert_eq!(info.payload::<String>(), None);
    }

    #[test]
    fn test_skipped_counts_as_failed() {
        let info = NodeInfo::skipped(0, "x", SkipReason::Unsatisfiable);
        assert!(info.state.is_final());
        assert!(!info.state.is_success());
        assert!(!info.ran);
    }

    #[test]
    fn test_fn_task_flags() {
        let plain = FnTask::new("plain", |_| Ok(TaskOutput::success()));
        let check = FnTask::conditional("check", |_| Ok(TaskOutput::failure("nope")));

        assert_eq!(plain.name(), "plain");
        assert!(!plain.is_conditional());
        assert!(check.is_conditional());
        assert!(!check.run(&TaskContext::new()).unwrap().succeeded);
    }
}

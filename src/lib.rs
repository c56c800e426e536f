#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod context;
mod core;
mod error;
pub mod executor;
pub mod generator;
mod graph;
mod pipeline;
mod program;
mod task;
mod utils;

pub use crate::context::{AbortHandle, TaskContext};
pub use crate::core::Dynamic;
pub use crate::error::*;
pub use crate::executor::{
    Executor, ExecutorConfig, FailurePolicy, RunHandle, RunOutcome, RunReport,
};
pub use crate::generator::{GraphGenerator, RasterGenerator, SequenceGenerator, TaskFactory};
pub use crate::graph::{EdgeKind, NodeKind, TaskGraph, TaskNode};
pub use crate::pipeline::Pipeline;
pub use crate::program::{Anchor, CompositeInstruction, Instruction, PlanInput, Waypoint};
pub use crate::task::{FnTask, NodeInfo, NodeState, SkipReason, Task, TaskOutput, TaskResult};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

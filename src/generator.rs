//! Turning programs into task graphs.
//!
//! Top-level generators and the sub-generators they delegate segments to share
//! one trait, so generators compose recursively: a raster segment can itself
//! be split by another [`RasterGenerator`].
mod raster;
mod sequence;

pub use raster::RasterGenerator;
pub use sequence::{SequenceGenerator, TaskFactory};

use crate::error::KumikiError;
use crate::graph::TaskGraph;
use crate::program::PlanInput;

pub trait GraphGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Builds a fresh graph for `input`. Either the whole graph is returned or
    /// nothing is.
    fn generate(&self, input: &PlanInput) -> Result<TaskGraph, KumikiError>;
}

impl<G> GraphGenerator for Box<G>
where
    G: GraphGenerator + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn generate(&self, input: &PlanInput) -> Result<TaskGraph, KumikiError> {
        (**self).generate(input)
    }
}

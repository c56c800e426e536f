use std::any::Any;
use std::sync::Arc;

/// A type-erased, thread-safe container.
///
/// Ports and task payloads are stored this way so the engine never needs to
/// know about the motion data flowing through it.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

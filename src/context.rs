use std::any::type_name;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::core::Dynamic;
use crate::error::PortError;
use crate::task::NodeInfo;
use crate::utils::{lock, read, write};

type Ports = HashMap<String, Dynamic>;

/// Mutable store shared by every node of one graph execution.
///
/// It holds three things:
/// * **ports**: named values exchanged between nodes that are not directly
///   connected, and between the caller and the graph,
/// * the **abort flag**, which only ever goes from clear to set within a run,
/// * the **results** of the graph currently being executed, keyed by node
///   index.
///
/// All mutation is internally synchronized, so worker threads never need any
/// external locking. A port write swaps in a fully built `Arc`, which makes
/// every write atomic with respect to readers.
///
/// Composite nodes run their child graph against a [`scoped`](Self::scoped)
/// context: ports and the abort flag are shared with the parent, the result
/// map is fresh so child indices never collide with the parent's.
pub struct TaskContext {
    ports: Arc<RwLock<Ports>>,
    aborted: Arc<AtomicBool>,
    results: Mutex<BTreeMap<usize, NodeInfo>>,
}

impl TaskContext {
    pub fn new() -> Self {
        Self {
            ports: Arc::default(),
            aborted: Arc::new(AtomicBool::new(false)),
            results: Mutex::default(),
        }
    }

    /// Child context for a nested graph.
    pub fn scoped(&self) -> Self {
        Self {
            ports: Arc::clone(&self.ports),
            aborted: Arc::clone(&self.aborted),
            results: Mutex::default(),
        }
    }

    /// Reads a port and downcasts it to `T`.
    pub fn get_port<T>(&self, name: &str) -> Result<Arc<T>, PortError>
    where
        T: Send + Sync + 'static,
    {
        self.get_port_dynamic(name)?
            .downcast::<T>()
            .map_err(|_| PortError::WrongType {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    pub fn get_port_dynamic(&self, name: &str) -> Result<Dynamic, PortError> {
        read(&self.ports)
            .get(name)
            .cloned()
            .ok_or_else(|| PortError::NotFound(name.to_string()))
    }

    /// Writes a port. Later writers overwrite earlier ones.
    pub fn set_port<T>(&self, name: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.set_port_dynamic(name, Arc::new(value));
    }

    pub fn set_port_dynamic(&self, name: impl Into<String>, value: Dynamic) {
        write(&self.ports).insert(name.into(), value);
    }

    pub fn has_port(&self, name: &str) -> bool {
        read(&self.ports).contains_key(name)
    }

    pub fn remove_port(&self, name: &str) -> Option<Dynamic> {
        write(&self.ports).remove(name)
    }

    pub fn port_names(&self) -> Vec<String> {
        let mut names: Vec<_> = read(&self.ports).keys().cloned().collect();
        names.sort();
        names
    }

    /// Raises the abort flag. Nodes not yet started will be skipped; running
    /// nodes finish normally.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            tracing::warn!("abort requested");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// A cloneable handle that can raise the abort flag from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(Arc::clone(&self.aborted))
    }

    pub(crate) fn record(&self, info: NodeInfo) {
        lock(&self.results).insert(info.index, info);
    }

    /// Result of a node of the graph run against this context.
    pub fn result(&self, index: usize) -> Option<NodeInfo> {
        lock(&self.results).get(&index).cloned()
    }

    pub fn results(&self) -> BTreeMap<usize, NodeInfo> {
        lock(&self.results).clone()
    }

    /// Clears the abort flag and all recorded results, keeping ports.
    pub fn reset(&self) {
        self.aborted.store(false, Ordering::Release);
        lock(&self.results).clear();
    }

    /// Like [`reset`](Self::reset), but also drops every port.
    pub fn clear(&self) {
        self.reset();
        write(&self.ports).clear();
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("ports", &self.port_names())
            .field("aborted", &self.is_aborted())
            .field("results", &lock(&self.results).len())
            .finish()
    }
}

/// Raises the abort flag of the context it was taken from.
#[derive(Debug, Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        if !self.0.swap(true, Ordering::AcqRel) {
            tracing::warn!("abort requested");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

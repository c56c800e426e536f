//! Task graph data structures.
//!
//! A [`TaskGraph`] is an arena of [`TaskNode`]s plus `(from, to, kind)` edges,
//! stored in a `petgraph::Graph`. Nodes are never removed one by one, so a
//! node's index is simply its insertion order and stays stable for the whole
//! life of the graph.
//!
//! ## Edges
//!
//! Every edge carries an [`EdgeKind`]:
//! * `Unconditional`: the target waits for the source to finish, whatever the
//!   outcome.
//! * `OnSuccess`: the target runs only if the source succeeded.
//! * `OnFailure`: the target runs only if the source failed (or was skipped).
//!
//! Cycles are rejected when the edge is inserted, not when the graph runs.
//!
//! ## Composition
//!
//! A [`TaskNode`] is either a leaf wrapping a [`Task`] or a composite owning a
//! whole child [`TaskGraph`]. The parent sees a composite as one node; the
//! child's structure and parallelism are invisible outside of it.
use std::fmt::Display;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use petgraph::Direction;
use petgraph::Graph;
use petgraph::algo::has_path_connecting;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use serde::Serialize;

use crate::error::GraphError;
use crate::task::{NodeState, Task};
use crate::utils::lock;

/// Condition attached to an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EdgeKind {
    Unconditional,
    OnSuccess,
    OnFailure,
}

impl EdgeKind {
    /// Whether a source that finished in `state` lets this edge through.
    pub fn is_satisfied_by(self, state: NodeState) -> bool {
        match self {
            EdgeKind::Unconditional => true,
            EdgeKind::OnSuccess => state.is_success(),
            EdgeKind::OnFailure => !state.is_success(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            EdgeKind::Unconditional => "",
            EdgeKind::OnSuccess => "success",
            EdgeKind::OnFailure => "failure",
        }
    }
}

pub enum NodeKind {
    Leaf(Box<dyn Task>),
    Composite(TaskGraph),
}

/// A schedulable unit, owned by exactly one graph.
pub struct TaskNode {
    name: String,
    description: String,
    conditional: bool,
    kind: NodeKind,
}

impl TaskNode {
    /// Wraps a leaf task. Name and conditional flag come from the task.
    pub fn leaf<T>(task: T) -> Self
    where
        T: Task + 'static,
    {
        Self::boxed(Box::new(task))
    }

    pub fn boxed(task: Box<dyn Task>) -> Self {
        Self {
            name: task.name().to_string(),
            description: String::new(),
            conditional: task.is_conditional(),
            kind: NodeKind::Leaf(task),
        }
    }

    /// Wraps a child graph as a single opaque node.
    pub fn composite(name: impl Into<String>, graph: TaskGraph) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            conditional: false,
            kind: NodeKind::Composite(graph),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_conditional(mut self, conditional: bool) -> Self {
        self.conditional = conditional;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_conditional(&self) -> bool {
        self.conditional
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// The child graph of a composite node.
    pub fn child(&self) -> Option<&TaskGraph> {
        match &self.kind {
            NodeKind::Leaf(_) => None,
            NodeKind::Composite(graph) => Some(graph),
        }
    }

    fn reset(&mut self) {
        if let NodeKind::Composite(graph) = &mut self.kind {
            graph.reset();
        }
    }
}

impl std::fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            NodeKind::Leaf(_) => "Leaf(*)".to_string(),
            NodeKind::Composite(graph) => format!("Composite({} nodes)", graph.node_count()),
        };

        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("conditional", &self.conditional)
            .field("kind", &kind)
            .finish()
    }
}

/// An explicit DAG of task nodes.
pub struct TaskGraph {
    name: String,
    graph: Graph<TaskNode, EdgeKind>,
    states: Mutex<Vec<NodeState>>,
    started: AtomicBool,
}

impl TaskGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: Graph::new(),
            states: Mutex::default(),
            started: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a node and returns its index.
    pub fn add_node(&mut self, node: TaskNode) -> Result<usize, GraphError> {
        self.ensure_mutable()?;

        let index = self.graph.add_node(node);
        lock(&self.states).push(NodeState::Pending);

        Ok(index.index())
    }

    /// Adds an edge, rejecting bad indices and anything that would close a
    /// cycle.
    pub fn add_edge(&mut self, from: usize, to: usize, kind: EdgeKind) -> Result<(), GraphError> {
        self.ensure_mutable()?;

        let len = self.graph.node_count();
        for index in [from, to] {
            if index >= len {
                return Err(GraphError::IndexOutOfRange { index, len });
            }
        }

        let (a, b) = (NodeIndex::new(from), NodeIndex::new(to));
        if from == to || has_path_connecting(&self.graph, b, a, None) {
            return Err(GraphError::Cycle { from, to });
        }

        self.graph.add_edge(a, b, kind);
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<(), GraphError> {
        match self.started.load(Ordering::Acquire) {
            true => Err(GraphError::Frozen),
            false => Ok(()),
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, index: usize) -> Option<&TaskNode> {
        self.graph.node_weight(NodeIndex::new(index))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (usize, &TaskNode)> {
        self.graph
            .node_indices()
            .map(|index| (index.index(), &self.graph[index]))
    }

    /// All edges as `(from, to, kind)`, in insertion order.
    pub fn edges(&self) -> Vec<(usize, usize, EdgeKind)> {
        self.graph
            .raw_edges()
            .iter()
            .map(|edge| (edge.source().index(), edge.target().index(), edge.weight))
            .collect()
    }

    pub fn successors(&self, index: usize) -> Vec<(usize, EdgeKind)> {
        self.neighbors(index, Direction::Outgoing)
    }

    pub fn predecessors(&self, index: usize) -> Vec<(usize, EdgeKind)> {
        self.neighbors(index, Direction::Incoming)
    }

    fn neighbors(&self, index: usize, direction: Direction) -> Vec<(usize, EdgeKind)> {
        if index >= self.graph.node_count() {
            return vec![];
        }

        let mut neighbors: Vec<_> = self
            .graph
            .edges_directed(NodeIndex::new(index), direction)
            .map(|edge| {
                let other = match direction {
                    Direction::Outgoing => edge.target(),
                    Direction::Incoming => edge.source(),
                };
                (other.index(), *edge.weight())
            })
            .collect();

        neighbors.sort_by_key(|(other, _)| *other);
        neighbors
    }

    /// Nodes with no inbound edges; they are ready as soon as a run starts.
    pub fn roots(&self) -> Vec<usize> {
        self.externals(Direction::Incoming)
    }

    /// Nodes with no outbound edges.
    pub fn terminal_nodes(&self) -> Vec<usize> {
        self.externals(Direction::Outgoing)
    }

    fn externals(&self, direction: Direction) -> Vec<usize> {
        let mut nodes: Vec<_> = self
            .graph
            .externals(direction)
            .map(|index| index.index())
            .collect();
        nodes.sort_unstable();
        nodes
    }

    pub fn state(&self, index: usize) -> Option<NodeState> {
        lock(&self.states).get(index).copied()
    }

    pub fn states(&self) -> Vec<NodeState> {
        lock(&self.states).clone()
    }

    /// Whether a run has started on this graph since the last reset.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Freezes the topology for a run. Fails if the graph already ran.
    pub(crate) fn begin(&self) -> Result<(), GraphError> {
        match self.started.swap(true, Ordering::AcqRel) {
            true => Err(GraphError::AlreadyExecuted),
            false => Ok(()),
        }
    }

    pub(crate) fn set_state(&self, index: usize, state: NodeState) {
        if let Some(slot) = lock(&self.states).get_mut(index) {
            *slot = state;
        }
    }

    /// Puts every node, including those of nested graphs, back to `Pending`
    /// and unfreezes the topology. Nodes and edges are kept.
    pub fn reset(&mut self) {
        for state in lock(&self.states).iter_mut() {
            *state = NodeState::Pending;
        }

        for node in self.graph.node_weights_mut() {
            node.reset();
        }

        self.started.store(false, Ordering::Release);
    }

    /// Drops every node and edge, returning the graph to its pre-generation
    /// state.
    pub fn clear(&mut self) {
        self.graph.clear();
        lock(&self.states).clear();
        self.started.store(false, Ordering::Release);
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new("graph")
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("name", &self.name)
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.edges())
            .field("states", &self.states())
            .finish()
    }
}

pub(crate) fn escape(name: &str) -> String {
    name.replace('"', "#quot;")
}

/// Renders the graph as a Mermaid flowchart.
impl Display for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for (index, node) in self.nodes() {
            let name = escape(node.name());
            match node.kind() {
                NodeKind::Leaf(_) if node.is_conditional() => {
                    writeln!(f, "    {index}{{\"{name}\"}}")?
                }
                NodeKind::Leaf(_) => writeln!(f, "    {index}[\"{name}\"]")?,
                NodeKind::Composite(_) => writeln!(f, "    {index}[[\"{name}\"]]")?,
            }
        }

        for (from, to, kind) in self.edges() {
            match kind {
                EdgeKind::Unconditional => writeln!(f, "    {from} --> {to}")?,
                _ => writeln!(f, "    {from} -- \"{}\" --> {to}", kind.label())?,
            }
        }

        Ok(())
    }
}

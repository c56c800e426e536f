use thiserror::Error;

/// Structural problems in a motion program, detected before any graph exists.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Invalid input: program has no segments")]
    Empty,

    #[error("Invalid input: not composite")]
    NotComposite,

    #[error("Invalid input: missing start")]
    MissingStart,

    #[error("Invalid input: malformed segment at position {index}")]
    MalformedSegment { index: usize },

    #[error("Invalid input: {len} segments leave a dangling transition")]
    DanglingTransition { len: usize },

    #[error("Invalid input: segment {index} rejected: {source}")]
    Segment {
        index: usize,
        #[source]
        source: Box<KumikiError>,
    },
}

/// Programming errors in graph construction, and misuse of a graph at run time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Invalid graph: node index {index} out of range ({len} nodes)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Invalid graph: edge {from} -> {to} would create a cycle")]
    Cycle { from: usize, to: usize },

    #[error("Invalid graph: topology is frozen once execution has started")]
    Frozen,

    #[error("Graph has already been executed, call `reset` before running it again")]
    AlreadyExecuted,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("Port not found: {0}")]
    NotFound(String),

    #[error("Port {name} does not hold a value of type {expected}")]
    WrongType { name: String, expected: &'static str },
}

#[derive(Debug, Error)]
pub enum KumikiError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("Failed to build worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("No task graph has been generated yet")]
    NotGenerated,

    #[error("Run thread terminated without reporting a result")]
    WorkerLost,
}

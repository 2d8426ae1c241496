use thiserror::Error;
use uuid::Uuid;

/// Structural graph problems. These are fatal: a run never starts on an
/// invalid graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("edge references unknown node {0}")]
    UnknownNode(Uuid),
    #[error("edge references unknown port '{port}' on node {node}")]
    UnknownPort { node: Uuid, port: String },
    #[error("cycle detected through nodes {path:?}")]
    CycleDetected { path: Vec<Uuid> },
}

/// Handle store resource errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error(
        "handle store budget exhausted: need {needed} bytes but only pinned entries remain ({pinned} of {budget} bytes pinned)"
    )]
    CapacityExceeded {
        needed: usize,
        budget: usize,
        pinned: usize,
    },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("script runner error: {0}")]
    Runner(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

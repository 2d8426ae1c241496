//! Per-node execution state and staleness tracking.
//!
//! State transitions are driven exclusively by the execution coordinator;
//! nothing else mutates a `NodeExecutionState`.

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use serde::Serialize;
use uuid::Uuid;

use crate::model::{Graph, OutputBag};
use crate::runner::ScriptFailure;
use crate::schedule;

/// Node status state machine:
/// `Pending -> Running -> {Completed | Error}`; `Completed` may later be
/// marked `Stale` when an upstream input changes. `Cached` means satisfied
/// from a prior run without re-execution this pass.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Cached,
    Error,
    Stale,
}

/// What a completed node produced.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub enum NodeOutput {
    /// An externally visible output bag.
    Bag(OutputBag),
    /// Sentinel for chain intermediates: the value stayed inside the
    /// script runner's execution context and was never surfaced.
    KeptInternal,
}

#[derive(Serialize, Clone, Debug)]
pub struct NodeExecutionState {
    pub status: NodeStatus,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
    pub output: Option<NodeOutput>,
    pub error: Option<ScriptFailure>,
    /// Handles created by this node's last execution, released by the
    /// coordinator when the output is superseded.
    pub produced_handles: Vec<Uuid>,
}

impl NodeExecutionState {
    pub fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            started_at: None,
            ended_at: None,
            output: None,
            error: None,
            produced_handles: Vec::new(),
        }
    }

    /// The externally visible output bag, if any.
    pub fn bag(&self) -> Option<&OutputBag> {
        match &self.output {
            Some(NodeOutput::Bag(bag)) => Some(bag),
            _ => None,
        }
    }

    /// Fresh enough to satisfy downstream consumers without re-execution.
    pub fn is_fresh(&self) -> bool {
        matches!(self.status, NodeStatus::Completed | NodeStatus::Cached)
    }
}

/// Execution results retained between runs, keyed by node id.
#[derive(Default)]
pub struct ExecutionCache {
    entries: HashMap<Uuid, NodeExecutionState>,
}

impl ExecutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<&NodeExecutionState> {
        self.entries.get(&id)
    }

    pub fn insert(&mut self, id: Uuid, state: NodeExecutionState) {
        self.entries.insert(id, state);
    }

    /// Flag a node's cached result as out of date (e.g. its static value
    /// or code was edited). Downstream propagation happens in
    /// `stale_nodes`, not here.
    pub fn mark_stale(&mut self, id: Uuid) -> bool {
        match self.entries.get_mut(&id) {
            Some(state) if state.is_fresh() => {
                state.status = NodeStatus::Stale;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Nodes whose cached output can no longer be trusted: no cache entry, an
/// entry in `Error`/`Stale` (or any non-fresh status), or any transitive
/// upstream stale. Computed bottom-up in topological order.
pub fn stale_nodes(graph: &Graph, cache: &ExecutionCache) -> HashSet<Uuid> {
    let mut stale = HashSet::new();
    for id in schedule::topological_order(graph) {
        let own = match cache.get(id) {
            Some(state) => !state.is_fresh(),
            None => true,
        };
        let upstream = graph.edges_into(id).any(|e| stale.contains(&e.from.node_id));
        if own || upstream {
            stale.insert(id);
        }
    }
    stale
}

//! Edge model for the computation graph.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a specific port on a specific node.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node_id: Uuid,
    pub port: String,
}

impl PortRef {
    pub fn new(node_id: Uuid, port: &str) -> Self {
        Self {
            node_id,
            port: port.to_string(),
        }
    }
}

/// A directed edge between two ports.
///
/// An output port may fan out to multiple targets; each input port accepts
/// values from the edges targeting it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Edge {
    pub id: Uuid,
    /// Source port (an output).
    pub from: PortRef,
    /// Destination port (an input).
    pub to: PortRef,
}

impl Edge {
    pub fn new(from: PortRef, to: PortRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
        }
    }
}

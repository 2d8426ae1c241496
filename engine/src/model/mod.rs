//! Graph model: nodes, edges, typed ports, and runtime values.

pub mod edge;
pub mod graph;
pub mod node;
pub mod value;

pub use edge::{Edge, PortRef};
pub use graph::{Graph, GraphDefinition};
pub use node::{Node, NodeKind, PortDecl, PortType};
pub use value::{HandleRef, OutputBag, Value, DEFAULT_PORT};

//! Node model for the computation graph.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::graph::GraphDefinition;
use super::value::DEFAULT_PORT;

/// Data type of a port. Only port existence is validated when a graph is
/// built; type agreement between connected ports is the editor's concern.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    /// Accepts any value.
    Any,
    /// Floating point or integer number.
    Number,
    /// Text string.
    Text,
    /// Boolean value.
    Boolean,
    /// Structured JSON object.
    Object,
    /// Reference to a heavy value in the handle store.
    Handle,
}

/// Declaration of a named port on a node.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PortDecl {
    pub name: String,
    pub port_type: PortType,
    /// Fallback for an input port with no incoming edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
}

impl PortDecl {
    pub fn new(name: &str, port_type: PortType) -> Self {
        Self {
            name: name.to_string(),
            port_type,
            default_value: None,
        }
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// The behavior of a node, as a closed set of variants.
///
/// The coordinator matches exhaustively on this enum; adding a kind forces
/// every dispatch site to handle it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    /// Executes user code through the script runner.
    Script { code: String },
    /// Emits a constant value.
    Input { value: serde_json::Value },
    /// Surfaces its single incoming value as a run artifact.
    Output,
    /// Surfaces its single incoming value for display.
    Viewer,
    /// A nested graph executed in place of the node.
    ///
    /// `input_bindings` maps this node's input ports to `Input` nodes of the
    /// inner graph; `output_bindings` maps output ports to inner `Output`
    /// nodes.
    Subgraph {
        graph: GraphDefinition,
        input_bindings: BTreeMap<String, Uuid>,
        output_bindings: BTreeMap<String, Uuid>,
    },
}

/// A node in the computation graph. Identity is stable within a run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Node {
    pub id: Uuid,
    pub kind: NodeKind,
    pub inputs: Vec<PortDecl>,
    pub outputs: Vec<PortDecl>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// A script node with no declared ports; add them with `with_input` /
    /// `with_output`.
    pub fn script(code: &str) -> Self {
        Self::new(NodeKind::Script {
            code: code.to_string(),
        })
    }

    /// An input node emitting a constant value on its `default` output port.
    pub fn input(value: serde_json::Value) -> Self {
        Self::new(NodeKind::Input { value }).with_output(DEFAULT_PORT, PortType::Any)
    }

    /// An output node consuming one value on its `default` input port.
    pub fn output() -> Self {
        Self::new(NodeKind::Output).with_input(DEFAULT_PORT, PortType::Any)
    }

    /// A viewer node consuming one value on its `default` input port.
    pub fn viewer() -> Self {
        Self::new(NodeKind::Viewer).with_input(DEFAULT_PORT, PortType::Any)
    }

    pub fn subgraph(
        graph: GraphDefinition,
        input_bindings: BTreeMap<String, Uuid>,
        output_bindings: BTreeMap<String, Uuid>,
    ) -> Self {
        Self::new(NodeKind::Subgraph {
            graph,
            input_bindings,
            output_bindings,
        })
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_input(mut self, name: &str, port_type: PortType) -> Self {
        self.inputs.push(PortDecl::new(name, port_type));
        self
    }

    pub fn with_input_decl(mut self, decl: PortDecl) -> Self {
        self.inputs.push(decl);
        self
    }

    pub fn with_output(mut self, name: &str, port_type: PortType) -> Self {
        self.outputs.push(PortDecl::new(name, port_type));
        self
    }

    pub fn is_script(&self) -> bool {
        matches!(self.kind, NodeKind::Script { .. })
    }
}

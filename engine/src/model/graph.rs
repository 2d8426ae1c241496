//! Graph container and structural validation.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GraphError;

use super::edge::Edge;
use super::node::Node;

/// The serializable shape of a graph, independent of how it was stored.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct GraphDefinition {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl GraphDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Node) -> Uuid {
        let id = node.id;
        self.nodes.push(node);
        id
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.push(edge);
    }
}

/// A validated graph: every edge endpoint and port exists and the edge set
/// is acyclic. Only validated graphs can be scheduled or executed, so
/// downstream code never re-checks these properties.
///
/// Node insertion order is preserved; the scheduler uses it as the
/// deterministic tie-break.
#[derive(Clone, Debug)]
pub struct Graph {
    def: GraphDefinition,
    index: HashMap<Uuid, usize>,
}

impl Graph {
    /// Validate a definition, consuming it on success.
    pub fn validate(def: GraphDefinition) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(def.nodes.len());
        for (i, node) in def.nodes.iter().enumerate() {
            index.insert(node.id, i);
        }

        for edge in &def.edges {
            let from_node = index
                .get(&edge.from.node_id)
                .map(|&i| &def.nodes[i])
                .ok_or(GraphError::UnknownNode(edge.from.node_id))?;
            if !from_node.outputs.iter().any(|p| p.name == edge.from.port) {
                return Err(GraphError::UnknownPort {
                    node: edge.from.node_id,
                    port: edge.from.port.clone(),
                });
            }
            let to_node = index
                .get(&edge.to.node_id)
                .map(|&i| &def.nodes[i])
                .ok_or(GraphError::UnknownNode(edge.to.node_id))?;
            if !to_node.inputs.iter().any(|p| p.name == edge.to.port) {
                return Err(GraphError::UnknownPort {
                    node: edge.to.node_id,
                    port: edge.to.port.clone(),
                });
            }
        }

        let graph = Self { def, index };
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn definition(&self) -> &GraphDefinition {
        &self.def
    }

    pub fn nodes(&self) -> &[Node] {
        &self.def.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.def.edges
    }

    pub fn node(&self, id: Uuid) -> Option<&Node> {
        self.index.get(&id).map(|&i| &self.def.nodes[i])
    }

    /// Position of a node in insertion order.
    pub fn insertion_index(&self, id: Uuid) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn edges_into(&self, id: Uuid) -> impl Iterator<Item = &Edge> {
        self.def.edges.iter().filter(move |e| e.to.node_id == id)
    }

    pub fn edges_out_of(&self, id: Uuid) -> impl Iterator<Item = &Edge> {
        self.def.edges.iter().filter(move |e| e.from.node_id == id)
    }

    /// Kahn's algorithm over the whole node set; any leftover nodes sit on
    /// a cycle, which is then recovered for the error report.
    fn check_acyclic(&self) -> Result<(), GraphError> {
        let mut in_degree: HashMap<Uuid, usize> =
            self.def.nodes.iter().map(|n| (n.id, 0)).collect();
        for edge in &self.def.edges {
            if let Some(deg) = in_degree.get_mut(&edge.to.node_id) {
                *deg += 1;
            }
        }

        let mut queue: VecDeque<Uuid> = self
            .def
            .nodes
            .iter()
            .filter(|n| in_degree[&n.id] == 0)
            .map(|n| n.id)
            .collect();

        let mut processed = 0usize;
        while let Some(id) = queue.pop_front() {
            processed += 1;
            for edge in self.edges_out_of(id) {
                if let Some(deg) = in_degree.get_mut(&edge.to.node_id) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(edge.to.node_id);
                    }
                }
            }
        }

        if processed == self.def.nodes.len() {
            return Ok(());
        }

        // Recover one cycle for the error report. Every node left with
        // in-degree has an unprocessed predecessor, so walking backwards
        // must eventually revisit a node; the revisited segment is a cycle.
        let start = self
            .def
            .nodes
            .iter()
            .map(|n| n.id)
            .find(|id| in_degree[id] > 0)
            .unwrap_or_default();
        let mut path = vec![start];
        let mut current = start;
        loop {
            let prev = self
                .edges_into(current)
                .map(|e| e.from.node_id)
                .find(|id| in_degree.get(id).is_some_and(|&d| d > 0));
            match prev {
                Some(id) => {
                    if let Some(pos) = path.iter().position(|&p| p == id) {
                        path.drain(..pos);
                        path.reverse();
                        return Err(GraphError::CycleDetected { path });
                    }
                    path.push(id);
                    current = id;
                }
                None => return Err(GraphError::CycleDetected { path }),
            }
        }
    }
}

//! Scheduler: deterministic topological ordering and script-chain detection.
//!
//! Chains are the engine's core performance optimization: a maximal run of
//! script nodes whose intermediate outputs never leave the script runner's
//! execution context, so they are dispatched back-to-back without
//! serializing values across the boundary.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use uuid::Uuid;

use crate::model::Graph;

/// A maximal run of script nodes eligible for batched dispatch.
///
/// Members are in execution order. Every non-terminal member's entire
/// fan-out targets the next member, so only the terminal member's output is
/// ever visible outside the chain.
#[derive(Clone, Debug, PartialEq)]
pub struct Chain {
    pub id: Uuid,
    pub nodes: Vec<Uuid>,
}

impl Chain {
    pub fn terminal(&self) -> Uuid {
        *self.nodes.last().unwrap_or(&self.id)
    }

    pub fn contains(&self, node_id: Uuid) -> bool {
        self.nodes.contains(&node_id)
    }
}

/// One unit of coordinator work.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Step {
    /// A single node (any kind, including a singleton script chain).
    Single(Uuid),
    /// A multi-node chain, by index into the plan's chain list.
    Chain(usize),
}

/// The coordinator's schedule: steps in execution order plus the detected
/// chains they refer to.
#[derive(Clone, Debug)]
pub struct ExecutionPlan {
    pub steps: Vec<Step>,
    pub chains: Vec<Chain>,
}

/// Topological order over all nodes (Kahn's algorithm).
///
/// Among simultaneously eligible nodes, ascending insertion order wins, so
/// two calls on the same graph produce identical sequences. Infallible
/// because `Graph` is acyclic by construction.
pub fn topological_order(graph: &Graph) -> Vec<Uuid> {
    let mut in_degree: HashMap<Uuid, usize> = graph.nodes().iter().map(|n| (n.id, 0)).collect();
    for edge in graph.edges() {
        if let Some(deg) = in_degree.get_mut(&edge.to.node_id) {
            *deg += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = graph
        .nodes()
        .iter()
        .enumerate()
        .filter(|(_, n)| in_degree[&n.id] == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(graph.nodes().len());
    while let Some(Reverse(i)) = ready.pop() {
        let id = graph.nodes()[i].id;
        order.push(id);
        for edge in graph.edges_out_of(id) {
            if let Some(deg) = in_degree.get_mut(&edge.to.node_id) {
                *deg -= 1;
                if *deg == 0 {
                    if let Some(ti) = graph.insertion_index(edge.to.node_id) {
                        ready.push(Reverse(ti));
                    }
                }
            }
        }
    }

    debug_assert_eq!(order.len(), graph.nodes().len());
    order
}

/// Group script nodes into maximal chains.
///
/// A chain grows from its tail to the next node `t` only when every
/// outgoing edge of the tail targets `t`, `t` is a script node, and `t` is
/// not already claimed by another chain. A single non-script consumer (or a
/// fan-out to more than one node) forces the tail to be the chain's last
/// member, serializing its output. Every script node lands in exactly one
/// chain, singletons included.
pub fn detect_chains(graph: &Graph) -> Vec<Chain> {
    let order = topological_order(graph);
    let mut claimed: HashSet<Uuid> = HashSet::new();
    let mut chains = Vec::new();

    for &start in &order {
        let node = match graph.node(start) {
            Some(n) if n.is_script() => n,
            _ => continue,
        };
        if claimed.contains(&node.id) {
            continue;
        }

        let mut members = vec![start];
        claimed.insert(start);
        let mut tail = start;
        loop {
            let next = chain_successor(graph, tail);
            match next {
                Some(t) if !claimed.contains(&t) => {
                    claimed.insert(t);
                    members.push(t);
                    tail = t;
                }
                _ => break,
            }
        }

        chains.push(Chain {
            id: Uuid::new_v4(),
            nodes: members,
        });
    }

    chains
}

/// The unique script node that all of `tail`'s outgoing edges target, if
/// any. Multiple edges into different ports of the same node still count as
/// a single successor.
fn chain_successor(graph: &Graph, tail: Uuid) -> Option<Uuid> {
    let mut successor = None;
    let mut any = false;
    for edge in graph.edges_out_of(tail) {
        any = true;
        let target = edge.to.node_id;
        if !graph.node(target).is_some_and(|n| n.is_script()) {
            return None;
        }
        match successor {
            None => successor = Some(target),
            Some(s) if s == target => {}
            Some(_) => return None,
        }
    }
    if any { successor } else { None }
}

/// Build the coordinator's schedule: topological order over the
/// chain-contracted graph, so a multi-node chain dispatches as one step
/// with every external upstream already executed.
///
/// Contraction cannot introduce a cycle: no edge leaves a chain except from
/// its terminal, so any path back into the chain would be a cycle in the
/// original graph.
pub fn plan(graph: &Graph) -> ExecutionPlan {
    let chains = detect_chains(graph);

    // Unit id per node: one unit per chain, one per non-script node.
    let mut unit_of: HashMap<Uuid, usize> = HashMap::new();
    // (sort key, representative) per unit; chains sort by their head.
    let mut units: Vec<(usize, Step)> = Vec::new();
    for (ci, chain) in chains.iter().enumerate() {
        let head_index = graph.insertion_index(chain.nodes[0]).unwrap_or(usize::MAX);
        let step = if chain.nodes.len() > 1 {
            Step::Chain(ci)
        } else {
            Step::Single(chain.nodes[0])
        };
        let unit = units.len();
        units.push((head_index, step));
        for &n in &chain.nodes {
            unit_of.insert(n, unit);
        }
    }
    for (i, node) in graph.nodes().iter().enumerate() {
        if node.is_script() {
            continue;
        }
        let unit = units.len();
        units.push((i, Step::Single(node.id)));
        unit_of.insert(node.id, unit);
    }

    let mut in_degree = vec![0usize; units.len()];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); units.len()];
    for edge in graph.edges() {
        let (Some(&fu), Some(&tu)) = (
            unit_of.get(&edge.from.node_id),
            unit_of.get(&edge.to.node_id),
        ) else {
            continue;
        };
        if fu != tu {
            adjacency[fu].push(tu);
            in_degree[tu] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<(usize, usize)>> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(u, _)| Reverse((units[u].0, u)))
        .collect();

    let mut steps = Vec::with_capacity(units.len());
    while let Some(Reverse((_, u))) = ready.pop() {
        steps.push(units[u].1);
        for &t in &adjacency[u] {
            in_degree[t] -= 1;
            if in_degree[t] == 0 {
                ready.push(Reverse((units[t].0, t)));
            }
        }
    }

    debug_assert_eq!(steps.len(), units.len());
    ExecutionPlan { steps, chains }
}

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;

use crate::backend::index::GraphError;
use crate::backend::spec::Graph;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyError {
    pub missing_node: u32,
    pub consumer: u32,
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "input node {} is missing before node {}",
            self.missing_node, self.consumer
        )
    }
}

impl std::error::Error for TopologyError {}

pub fn validate_graph_topology(graph: &Graph) -> Result<(), TopologyError> {
    let mut available = HashSet::new();
    for node in &graph.nodes {
        for input in &node.inputs {
            if !available.contains(&input.0) {
                return Err(TopologyError {
                    missing_node: input.0,
                    consumer: node.id.0,
                });
            }
        }
        available.insert(node.id.0);
    }
    Ok(())
}

/// Stable Kahn ordering: returns node positions such that producers come first, breaking ties
/// by current position.
pub fn topological_order(graph: &Graph) -> Result<Vec<usize>, GraphError> {
    let pos_of: HashMap<_, _> = graph
        .nodes
        .iter()
        .enumerate()
        .map(|(pos, node)| (node.id, pos))
        .collect();

    let mut pending = vec![0usize; graph.nodes.len()];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); graph.nodes.len()];
    for (pos, node) in graph.nodes.iter().enumerate() {
        for input in &node.inputs {
            let producer = *pos_of.get(input).ok_or(GraphError::MissingNode {
                node: *input,
                consumer: node.id,
            })?;
            pending[pos] += 1;
            consumers[producer].push(pos);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(pos, _)| Reverse(pos))
        .collect();
    let mut order = Vec::with_capacity(graph.nodes.len());
    while let Some(Reverse(pos)) = ready.pop() {
        order.push(pos);
        for &consumer in &consumers[pos] {
            pending[consumer] -= 1;
            if pending[consumer] == 0 {
                ready.push(Reverse(consumer));
            }
        }
    }

    if order.len() != graph.nodes.len() {
        let stuck = pending
            .iter()
            .position(|count| *count > 0)
            .map(|pos| graph.nodes[pos].id)
            .unwrap_or(graph.nodes[0].id);
        return Err(GraphError::Cycle { node: stuck });
    }
    Ok(order)
}

use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;
use thiserror::Error;

use crate::backend::spec::{AxisId, Graph, Node, NodeId};

/// One consuming edge: `consumer.inputs[slot]` reads the indexed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    pub consumer: NodeId,
    pub slot: usize,
}

/// Captures structural indices for a single fused graph.
#[derive(Debug, Clone)]
pub struct GraphIndex {
    pub pos_of: HashMap<NodeId, usize>,
    pub users: HashMap<NodeId, SmallVec<[Use; 4]>>,
    pub next_node: u32,
    pub next_axis: u32,
}

impl GraphIndex {
    /// Builds indices for the provided graph and validates edge and axis references.
    ///
    /// Node order is not checked here; see [`crate::backend::topology`] for that.
    pub fn build(graph: &Graph) -> Result<Self, GraphError> {
        let mut axis_ids: HashSet<AxisId> = HashSet::new();
        let mut max_axis = None::<u32>;
        for axis in &graph.axes {
            if !axis_ids.insert(axis.id) {
                return Err(GraphError::DuplicateAxis { axis: axis.id });
            }
            max_axis = Some(max_axis.map_or(axis.id.0, |max| max.max(axis.id.0)));
        }

        let mut pos_of = HashMap::with_capacity(graph.nodes.len());
        let mut max_node = None::<u32>;
        for (pos, node) in graph.nodes.iter().enumerate() {
            if pos_of.insert(node.id, pos).is_some() {
                return Err(GraphError::DuplicateNode { node: node.id });
            }
            max_node = Some(max_node.map_or(node.id.0, |max| max.max(node.id.0)));
        }

        let mut users: HashMap<NodeId, SmallVec<[Use; 4]>> = HashMap::new();
        for node in &graph.nodes {
            if node.output.axes.len() != node.output.repeats.len() {
                return Err(GraphError::InconsistentDesc {
                    node: node.id,
                    axes: node.output.axes.len(),
                    repeats: node.output.repeats.len(),
                });
            }
            for axis in &node.output.axes {
                if !axis_ids.contains(axis) {
                    return Err(GraphError::MissingAxis {
                        axis: *axis,
                        node: node.id,
                    });
                }
            }
            for (slot, input) in node.inputs.iter().enumerate() {
                if !pos_of.contains_key(input) {
                    return Err(GraphError::MissingNode {
                        node: *input,
                        consumer: node.id,
                    });
                }
                users.entry(*input).or_default().push(Use {
                    consumer: node.id,
                    slot,
                });
            }
        }

        Ok(GraphIndex {
            pos_of,
            users,
            next_node: max_node.map_or(0, |max| max + 1),
            next_axis: max_axis.map_or(0, |max| max + 1),
        })
    }

    /// Returns the node position for the provided identifier.
    pub fn position(&self, node: NodeId) -> Option<usize> {
        self.pos_of.get(&node).copied()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.pos_of.contains_key(&node)
    }

    /// Returns the consuming edges recorded for a node.
    pub fn users_of(&self, node: NodeId) -> &[Use] {
        self.users
            .get(&node)
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }

    pub fn ordered_node_ids(&self) -> Vec<NodeId> {
        let mut entries: Vec<_> = self
            .pos_of
            .iter()
            .map(|(node, pos)| (*node, *pos))
            .collect();
        entries.sort_by_key(|&(_, pos)| pos);
        entries.into_iter().map(|(node, _)| node).collect()
    }

    pub(crate) fn allocate_node(&mut self) -> NodeId {
        let node = NodeId(self.next_node);
        self.next_node += 1;
        node
    }

    pub(crate) fn allocate_axis(&mut self) -> AxisId {
        let axis = AxisId(self.next_axis);
        self.next_axis += 1;
        axis
    }

    /// Records a node appended at `pos` (the end of the node list).
    pub(crate) fn append_node(&mut self, node: &Node, pos: usize) -> Result<(), GraphError> {
        for input in &node.inputs {
            if !self.contains(*input) {
                return Err(GraphError::MissingNode {
                    node: *input,
                    consumer: node.id,
                });
            }
        }
        self.pos_of.insert(node.id, pos);
        for (slot, input) in node.inputs.iter().enumerate() {
            self.users.entry(*input).or_default().push(Use {
                consumer: node.id,
                slot,
            });
        }
        Ok(())
    }

    pub(crate) fn remove_node(&mut self, node: &Node) {
        if let Some(pos) = self.pos_of.remove(&node.id) {
            for other in self.pos_of.values_mut() {
                if *other > pos {
                    *other -= 1;
                }
            }
        }
        self.users.remove(&node.id);
        for input in &node.inputs {
            self.drop_use(*input, node.id, None);
        }
    }

    pub(crate) fn update_input(
        &mut self,
        consumer: NodeId,
        slot: usize,
        from: NodeId,
        to: NodeId,
    ) -> Result<(), GraphError> {
        if !self.contains(to) {
            return Err(GraphError::MissingNode { node: to, consumer });
        }
        self.drop_use(from, consumer, Some(slot));
        self.users.entry(to).or_default().push(Use { consumer, slot });
        Ok(())
    }

    pub(crate) fn replace_inputs(&mut self, consumer: NodeId, from: &[NodeId], to: &[NodeId]) {
        for input in from {
            self.drop_use(*input, consumer, None);
        }
        for (slot, input) in to.iter().enumerate() {
            self.users.entry(*input).or_default().push(Use { consumer, slot });
        }
    }

    fn drop_use(&mut self, producer: NodeId, consumer: NodeId, slot: Option<usize>) {
        if let Some(list) = self.users.get_mut(&producer) {
            list.retain(|edge| {
                edge.consumer != consumer || slot.is_some_and(|slot| edge.slot != slot)
            });
            if list.is_empty() {
                self.users.remove(&producer);
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("node {node} is defined more than once")]
    DuplicateNode { node: NodeId },
    #[error("node {consumer} reads undefined node {node}")]
    MissingNode { node: NodeId, consumer: NodeId },
    #[error("node {node} does not exist")]
    UnknownNode { node: NodeId },
    #[error("axis {axis} is defined more than once")]
    DuplicateAxis { axis: AxisId },
    #[error("axis {axis} referenced by node {node} is not defined")]
    MissingAxis { axis: AxisId, node: NodeId },
    #[error("node {node} has {axes} axes but {repeats} repeats")]
    InconsistentDesc {
        node: NodeId,
        axes: usize,
        repeats: usize,
    },
    #[error("node {node} has no input slot {slot}")]
    InvalidSlot { node: NodeId, slot: usize },
    #[error("cannot erase node {node}: {users} consuming edges remain")]
    LiveUses { node: NodeId, users: usize },
    #[error("attribute '{key}' on node {node} cannot be duplicated")]
    UncopyableAttr { node: NodeId, key: String },
    #[error("graph contains a cycle through node {node}")]
    Cycle { node: NodeId },
}

use std::collections::BTreeMap;

use crate::backend::{
    expr::SizeExpr,
    index::{GraphError, GraphIndex, Use},
    spec::{Axis, AxisId, Graph, Node, NodeAttr, NodeId, Operation, TensorDesc},
    topology,
};

/// Mutable graph editor with stable node identifiers and edge accounting.
///
/// New nodes are appended; call [`GraphRewriter::sort_topologically`] once a batch of edits is
/// done to restore producer-before-consumer order.
pub struct GraphRewriter<'a> {
    pub graph: &'a mut Graph,
    index: GraphIndex,
}

impl<'a> GraphRewriter<'a> {
    /// Creates a rewriter for the provided graph, indexing its nodes.
    pub fn new(graph: &'a mut Graph) -> Result<Self, GraphError> {
        let index = GraphIndex::build(graph)?;
        Ok(Self { graph, index })
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        let pos = self
            .index
            .position(id)
            .ok_or(GraphError::UnknownNode { node: id })?;
        Ok(&self.graph.nodes[pos])
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        let pos = self
            .index
            .position(id)
            .ok_or(GraphError::UnknownNode { node: id })?;
        Ok(&mut self.graph.nodes[pos])
    }

    /// Returns the operation of `id`.
    pub fn op(&self, id: NodeId) -> Result<&Operation, GraphError> {
        Ok(&self.node(id)?.op)
    }

    /// Returns the producers feeding `id`, slot by slot.
    pub fn inputs(&self, id: NodeId) -> Result<&[NodeId], GraphError> {
        Ok(&self.node(id)?.inputs)
    }

    /// Returns the recorded consuming edges of `id`.
    pub fn users_of(&self, id: NodeId) -> &[Use] {
        self.index.users_of(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains(id)
    }

    pub fn nodes_in_order(&self) -> Vec<NodeId> {
        self.index.ordered_node_ids()
    }

    /// Appends a fresh loop axis.
    pub fn add_axis(&mut self, name: impl Into<String>, size: SizeExpr) -> AxisId {
        let id = self.index.allocate_axis();
        self.graph.axes.push(Axis {
            id,
            name: name.into(),
            size,
        });
        id
    }

    /// Appends a new node reading `inputs`.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: Operation,
        inputs: Vec<NodeId>,
        output: TensorDesc,
    ) -> Result<NodeId, GraphError> {
        let id = self.index.allocate_node();
        let node = Node {
            id,
            name: name.into(),
            op,
            inputs,
            output,
            attrs: BTreeMap::new(),
        };
        self.push_node(node)
    }

    /// Copies the operator, tensor view and attributes of `id` into a new node that reads the
    /// same producers. No consumer is moved over to the copy.
    pub fn duplicate_node(
        &mut self,
        id: NodeId,
        name: impl Into<String>,
    ) -> Result<NodeId, GraphError> {
        let original = self.node(id)?;
        if let Some((key, _)) = original.attrs.iter().find(|(_, attr)| !attr.is_copyable()) {
            return Err(GraphError::UncopyableAttr {
                node: id,
                key: key.clone(),
            });
        }
        let mut copy = original.clone();
        copy.id = self.index.allocate_node();
        copy.name = name.into();
        self.push_node(copy)
    }

    fn push_node(&mut self, node: Node) -> Result<NodeId, GraphError> {
        let id = node.id;
        self.index.append_node(&node, self.graph.nodes.len())?;
        self.graph.nodes.push(node);
        Ok(id)
    }

    /// Points `consumer.inputs[slot]` at `producer`.
    pub fn set_input(
        &mut self,
        consumer: NodeId,
        slot: usize,
        producer: NodeId,
    ) -> Result<(), GraphError> {
        let previous = *self
            .node(consumer)?
            .inputs
            .get(slot)
            .ok_or(GraphError::InvalidSlot {
                node: consumer,
                slot,
            })?;
        if previous == producer {
            return Ok(());
        }
        self.index
            .update_input(consumer, slot, previous, producer)?;
        self.node_mut(consumer)?.inputs[slot] = producer;
        Ok(())
    }

    /// Replaces every input of `consumer`.
    pub fn set_inputs(&mut self, consumer: NodeId, inputs: Vec<NodeId>) -> Result<(), GraphError> {
        for input in &inputs {
            if !self.contains(*input) {
                return Err(GraphError::MissingNode {
                    node: *input,
                    consumer,
                });
            }
        }
        let previous = std::mem::replace(&mut self.node_mut(consumer)?.inputs, inputs.clone());
        self.index.replace_inputs(consumer, &previous, &inputs);
        Ok(())
    }

    pub fn set_op(&mut self, id: NodeId, op: Operation) -> Result<(), GraphError> {
        self.node_mut(id)?.op = op;
        Ok(())
    }

    pub fn set_output(&mut self, id: NodeId, output: TensorDesc) -> Result<(), GraphError> {
        self.node_mut(id)?.output = output;
        Ok(())
    }

    pub fn set_attr(
        &mut self,
        id: NodeId,
        key: impl Into<String>,
        value: NodeAttr,
    ) -> Result<(), GraphError> {
        self.node_mut(id)?.attrs.insert(key.into(), value);
        Ok(())
    }

    /// Erases a node that no longer has consumers.
    pub fn erase_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        let users = self.index.users_of(id).len();
        if users != 0 {
            return Err(GraphError::LiveUses { node: id, users });
        }
        let pos = self
            .index
            .position(id)
            .ok_or(GraphError::UnknownNode { node: id })?;
        let node = self.graph.nodes.remove(pos);
        self.index.remove_node(&node);
        Ok(())
    }

    /// Reorders nodes so every producer precedes its consumers, keeping the existing relative
    /// order wherever the edges allow it.
    pub fn sort_topologically(&mut self) -> Result<(), GraphError> {
        let order = topology::topological_order(self.graph)?;
        let mut slots: Vec<Option<Node>> = self.graph.nodes.drain(..).map(Some).collect();
        self.graph.nodes = order
            .into_iter()
            .filter_map(|pos| slots.get_mut(pos).and_then(Option::take))
            .collect();
        let mut index = GraphIndex::build(self.graph)?;
        index.next_node = index.next_node.max(self.index.next_node);
        index.next_axis = index.next_axis.max(self.index.next_axis);
        self.index = index;
        Ok(())
    }

    /// Verifies edge, axis and ordering invariants after mutations.
    pub fn verify(&self) -> bool {
        GraphIndex::build(self.graph).is_ok()
            && topology::validate_graph_topology(self.graph).is_ok()
    }
}

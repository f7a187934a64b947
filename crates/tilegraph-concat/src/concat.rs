use tilegraph::backend::{
    expr::SizeExpr,
    spec::{DType, Graph, NodeId, Operation, TensorDesc},
};
use tilegraph::GraphError;

use crate::error::{ConcatFusionError, ConcatFusionResult};

/// Read-only view of one `Concat` node and the sizes of its inputs along the concat axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatInfo {
    pub node: NodeId,
    pub name: String,
    pub axis: usize,
    pub dtype: DType,
    pub inputs: Vec<NodeId>,
    /// Extent of every input along the concat axis, slot by slot.
    pub input_dims: Vec<SizeExpr>,
    pub output: TensorDesc,
}

/// First `Concat` in graph order.
pub fn find_first_concat(graph: &Graph) -> Option<NodeId> {
    graph
        .nodes
        .iter()
        .find(|node| matches!(node.op, Operation::Concat(_)))
        .map(|node| node.id)
}

impl ConcatInfo {
    pub fn from_graph(graph: &Graph, node: NodeId) -> ConcatFusionResult<Self> {
        let concat = graph.node(node).ok_or(GraphError::UnknownNode { node })?;
        let Operation::Concat(spec) = &concat.op else {
            return Err(ConcatFusionError::invalid(
                node,
                format!("expected concat, found {}", concat.op.kind_name()),
            ));
        };
        if concat.inputs.is_empty() {
            return Err(ConcatFusionError::invalid(node, "concat has no inputs"));
        }
        let rank = concat.output.rank();
        if spec.axis >= rank {
            return Err(ConcatFusionError::invalid(
                node,
                format!("axis {} out of range for rank {rank}", spec.axis),
            ));
        }

        let mut input_dims = Vec::with_capacity(concat.inputs.len());
        for input in &concat.inputs {
            let producer = graph.node(*input).ok_or(GraphError::MissingNode {
                node: *input,
                consumer: node,
            })?;
            if producer.output.rank() != rank {
                return Err(ConcatFusionError::invalid(
                    node,
                    format!(
                        "input {} has rank {} but the output has rank {rank}",
                        input,
                        producer.output.rank()
                    ),
                ));
            }
            if producer.output.dtype != concat.output.dtype {
                return Err(ConcatFusionError::invalid(
                    node,
                    format!(
                        "input {} has dtype {:?} but the output is {:?}",
                        input, producer.output.dtype, concat.output.dtype
                    ),
                ));
            }
            input_dims.push(producer.output.repeats[spec.axis].clone());
        }

        Ok(Self {
            node,
            name: concat.name.clone(),
            axis: spec.axis,
            dtype: concat.output.dtype,
            inputs: concat.inputs.clone(),
            input_dims,
            output: concat.output.clone(),
        })
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn dtype_size(&self) -> u64 {
        self.dtype.size_in_bytes() as u64
    }

    pub fn rank(&self) -> usize {
        self.output.rank()
    }

    pub fn outer_dims(&self) -> &[SizeExpr] {
        &self.output.repeats[..self.axis]
    }

    pub fn inner_dims(&self) -> &[SizeExpr] {
        &self.output.repeats[self.axis + 1..]
    }

    /// Output extent along the concat axis.
    pub fn output_dim(&self) -> &SizeExpr {
        &self.output.repeats[self.axis]
    }

    /// Elements spanned by one unit of the concat axis.
    pub fn inner_elems(&self) -> SizeExpr {
        SizeExpr::product(self.inner_dims().iter().cloned())
    }

    /// Bytes spanned by one unit of the concat axis.
    pub fn stride_expr(&self) -> SizeExpr {
        SizeExpr::constant(self.dtype_size()) * self.inner_elems()
    }

    /// Statically known factor of [`ConcatInfo::stride_expr`].
    pub fn const_part_stride(&self) -> u64 {
        self.dtype_size()
            .saturating_mul(self.inner_elems().const_factor())
    }

    pub fn inner_is_static(&self) -> bool {
        self.inner_dims().iter().all(SizeExpr::is_const)
    }

    pub fn static_input_dims(&self) -> Option<Vec<u64>> {
        self.input_dims.iter().map(SizeExpr::as_const).collect()
    }

    /// Every dim before the concat axis is the constant 1.
    pub fn is_leading_axis(&self) -> bool {
        self.outer_dims().iter().all(|dim| dim.is_const_value(1))
    }

    /// Product of the statically known dims before the concat axis.
    pub fn known_row_count(&self) -> ConcatFusionResult<u64> {
        self.outer_dims()
            .iter()
            .filter_map(SizeExpr::as_const)
            .try_fold(1u64, |acc, dim| acc.checked_mul(dim))
            .ok_or(ConcatFusionError::Overflow {
                what: "known row count",
            })
    }

    /// Row count when every dim before the concat axis is static.
    pub fn total_row_count(&self) -> ConcatFusionResult<Option<u64>> {
        if !self.outer_dims().iter().all(SizeExpr::is_const) {
            return Ok(None);
        }
        self.known_row_count().map(Some)
    }

    /// Per-row output bytes when the output extent and inner dims are all static.
    pub fn static_output_row_bytes(&self) -> Option<u64> {
        let stride = self.stride_expr().as_const()?;
        self.output_dim().as_const()?.checked_mul(stride)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilegraph::backend::spec::GraphBuilder;

    fn graph(dtype: DType, axis: usize, repeats: &[Vec<SizeExpr>]) -> Graph {
        let mut builder = GraphBuilder::new(dtype);
        for (index, dim) in repeats[0].iter().enumerate() {
            builder.axis(format!("z{index}"), dim.clone());
        }
        let inputs = repeats
            .iter()
            .enumerate()
            .map(|(index, dims)| builder.input(&format!("x{index}"), dims.clone()))
            .collect();
        let concat = builder.concat("concat", axis, inputs);
        let store = builder.store("store", concat);
        builder.output("out", vec![store]);
        builder.finish("g")
    }

    #[test]
    fn strides_and_row_counts() {
        let c = SizeExpr::constant;
        let g = graph(
            DType::F16,
            1,
            &[
                vec![c(4), c(3), SizeExpr::sym("s0"), c(8)],
                vec![c(4), c(5), SizeExpr::sym("s0"), c(8)],
            ],
        );
        let info = ConcatInfo::from_graph(&g, find_first_concat(&g).expect("concat"))
            .expect("concat info");
        assert_eq!(info.output_dim().as_const(), Some(8));
        assert_eq!(info.stride_expr().to_string(), "16 * s0");
        assert_eq!(info.const_part_stride(), 16);
        assert!(!info.inner_is_static());
        assert_eq!(info.known_row_count().expect("rows"), 4);
        assert_eq!(info.total_row_count().expect("rows"), Some(4));
        assert!(!info.is_leading_axis());
    }

    #[test]
    fn dtype_mismatch_is_rejected() {
        let c = SizeExpr::constant;
        let mut g = graph(DType::F32, 0, &[vec![c(2), c(4)], vec![c(3), c(4)]]);
        let load = g.node_by_name("load_x1").expect("load").id;
        if let Some(node) = g.nodes.iter_mut().find(|node| node.id == load) {
            node.output.dtype = DType::F16;
        }
        let concat = find_first_concat(&g).expect("concat");
        match ConcatInfo::from_graph(&g, concat) {
            Err(ConcatFusionError::InvalidConcat { reason, .. }) => {
                assert!(reason.contains("dtype"), "{reason}")
            }
            other => panic!("expected a dtype mismatch, got {other:?}"),
        }
    }
}

#![allow(dead_code)]

use tilegraph::backend::{
    expr::SizeExpr,
    spec::{DType, Graph, GraphBuilder, NodeId, Operation},
};

pub fn c(value: u64) -> SizeExpr {
    SizeExpr::constant(value)
}

pub fn s(name: &str) -> SizeExpr {
    SizeExpr::sym(name)
}

pub fn consts(values: &[u64]) -> Vec<SizeExpr> {
    values.iter().copied().map(SizeExpr::constant).collect()
}

/// `x_i -> concat(axis) -> store -> out`, one independent input per entry of `dims`.
///
/// `shape` gives every dim of the output; the entry at `axis` is replaced per input.
pub fn concat_graph(dtype: DType, shape: &[SizeExpr], axis: usize, dims: &[SizeExpr]) -> Graph {
    let mut builder = GraphBuilder::new(dtype);
    for (index, dim) in shape.iter().enumerate() {
        builder.axis(format!("z{index}"), dim.clone());
    }
    let inputs = dims
        .iter()
        .enumerate()
        .map(|(index, dim)| {
            let mut repeats = shape.to_vec();
            repeats[axis] = dim.clone();
            builder.input(&format!("x{index}"), repeats)
        })
        .collect();
    let concat = builder.concat("concat", axis, inputs);
    let store = builder.store("store", concat);
    builder.output("out", vec![store]);
    builder.finish("fused")
}

/// Concat on the last axis of a `[rows, concat]` output.
pub fn tail_concat(dtype: DType, rows: u64, dims: &[SizeExpr]) -> Graph {
    concat_graph(dtype, &[c(rows), c(0)], 1, dims)
}

pub fn concat_id(graph: &Graph) -> NodeId {
    graph
        .nodes
        .iter()
        .find(|node| matches!(node.op, Operation::Concat(_)))
        .expect("graph has a concat")
        .id
}

pub fn id_of(graph: &Graph, name: &str) -> NodeId {
    graph
        .node_by_name(name)
        .unwrap_or_else(|| panic!("node {name} exists"))
        .id
}

pub fn names(graph: &Graph, ids: &[NodeId]) -> Vec<String> {
    ids.iter()
        .map(|id| graph.node(*id).expect("node exists").name.clone())
        .collect()
}

use tilegraph::backend::{
    expr::SizeExpr,
    rewriter::GraphRewriter,
    spec::{ConcatSpec, NodeId, Operation, StoreSpec},
};
use tracing::trace;

use crate::concat::ConcatInfo;
use crate::error::{ConcatFusionError, ConcatFusionResult};
use crate::partition::ConcatGroup;

/// Where the concat result goes: `concat -> store -> output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatSink {
    pub store: NodeId,
    pub output: NodeId,
    /// Destination offset of the original store, in elements.
    pub offset: SizeExpr,
}

pub fn concat_sink(rewriter: &GraphRewriter<'_>, concat: NodeId) -> ConcatFusionResult<ConcatSink> {
    let [edge] = rewriter.users_of(concat) else {
        return Err(ConcatFusionError::topology(
            concat,
            format!(
                "expected a single store consumer, found {} consuming edges",
                rewriter.users_of(concat).len()
            ),
        ));
    };
    let store = edge.consumer;
    let Operation::Store(spec) = rewriter.op(store)? else {
        return Err(ConcatFusionError::topology(
            concat,
            format!("concat feeds a {} instead of a store", rewriter.op(store)?.kind_name()),
        ));
    };
    let offset = spec.offset.clone();

    let [edge] = rewriter.users_of(store) else {
        return Err(ConcatFusionError::topology(
            store,
            "concat store must feed exactly one output",
        ));
    };
    let output = edge.consumer;
    if !matches!(rewriter.op(output)?, Operation::Output(_)) {
        return Err(ConcatFusionError::topology(
            store,
            format!("store feeds a {} instead of an output", rewriter.op(output)?.kind_name()),
        ));
    }
    Ok(ConcatSink {
        store,
        output,
        offset,
    })
}

/// Replaces the concat with one store per input at its prefix offset.
pub fn convert_to_stores(
    rewriter: &mut GraphRewriter<'_>,
    info: &ConcatInfo,
    sink: &ConcatSink,
) -> ConcatFusionResult<Vec<NodeId>> {
    let inputs = rewriter.inputs(info.node)?.to_vec();
    let store_name = rewriter.node(sink.store)?.name.clone();
    let inner = info.inner_elems();
    let mut prefix = SizeExpr::zero();
    let mut stores = Vec::with_capacity(inputs.len());
    for (index, (input, dim)) in inputs.iter().zip(&info.input_dims).enumerate() {
        let offset = sink.offset.clone() + prefix.clone() * inner.clone();
        let desc = rewriter.node(*input)?.output.clone();
        let store = rewriter.add_node(
            format!("{store_name}_{index}"),
            Operation::Store(StoreSpec { offset }),
            vec![*input],
            desc,
        )?;
        stores.push(store);
        prefix = prefix + dim.clone();
    }
    replace_sink(rewriter, info.node, sink, &stores)?;
    Ok(stores)
}

/// Lowers every group separately: singletons become offset stores, wider groups become a
/// sub-concat over a fresh axis feeding one store.
pub fn split_into_groups(
    rewriter: &mut GraphRewriter<'_>,
    info: &ConcatInfo,
    sink: &ConcatSink,
    groups: &[ConcatGroup],
) -> ConcatFusionResult<Vec<NodeId>> {
    let inputs = rewriter.inputs(info.node)?.to_vec();
    let axis_id = *info.output.axes.get(info.axis).ok_or_else(|| {
        ConcatFusionError::invalid(info.node, "concat output has no axis for the concat dim")
    })?;
    let axis_name = rewriter
        .graph
        .axis(axis_id)
        .map(|axis| axis.name.clone())
        .unwrap_or_else(|| format!("axis{}", info.axis));
    let store_name = rewriter.node(sink.store)?.name.clone();
    let inner = info.inner_elems();

    let mut prefix = SizeExpr::zero();
    let mut next_start = 0;
    let mut stores = Vec::with_capacity(groups.len());
    for (k, group) in groups.iter().enumerate() {
        if group.start != next_start || group.is_empty() {
            return Err(ConcatFusionError::invalid(
                info.node,
                format!("group [{}, {}) breaks contiguity at {next_start}", group.start, group.end),
            ));
        }
        next_start = group.end;
        let (Some(members), Some(dims)) =
            (inputs.get(group.range()), info.input_dims.get(group.range()))
        else {
            return Err(ConcatFusionError::invalid(
                info.node,
                format!("group [{}, {}) exceeds {} inputs", group.start, group.end, inputs.len()),
            ));
        };
        let extent = SizeExpr::checked_sum(dims.iter().cloned())
            .ok_or(ConcatFusionError::Overflow { what: "group extent" })?;
        let offset = sink.offset.clone() + prefix.clone() * inner.clone();

        let source = if let [single] = members {
            *single
        } else {
            let axis = rewriter.add_axis(format!("{axis_name}_g{k}"), extent.clone());
            let mut desc = info.output.clone();
            desc.axes[info.axis] = axis;
            desc.repeats[info.axis] = extent.clone();
            let sub = rewriter.add_node(
                format!("{}_g{k}", info.name),
                Operation::Concat(ConcatSpec { axis: info.axis }),
                members.to_vec(),
                desc,
            )?;
            trace!(group = k, start = group.start, end = group.end, %sub, "sub-concat created");
            sub
        };
        let desc = rewriter.node(source)?.output.clone();
        stores.push(rewriter.add_node(
            format!("{store_name}_g{k}"),
            Operation::Store(StoreSpec { offset }),
            vec![source],
            desc,
        )?);
        prefix = prefix + extent;
    }
    if next_start != inputs.len() {
        return Err(ConcatFusionError::invalid(
            info.node,
            format!("groups cover {next_start} of {} inputs", inputs.len()),
        ));
    }
    replace_sink(rewriter, info.node, sink, &stores)?;
    Ok(stores)
}

/// Prepends a unit axis to every node and shifts concat axes by one.
pub fn add_leading_unit_axis(
    rewriter: &mut GraphRewriter<'_>,
    name: &str,
) -> ConcatFusionResult<()> {
    let axis = rewriter.add_axis(format!("{name}_unit"), SizeExpr::one());
    for id in rewriter.nodes_in_order() {
        let node = rewriter.node(id)?;
        let mut output = node.output.clone();
        output.axes.insert(0, axis);
        output.repeats.insert(0, SizeExpr::one());
        let op = match &node.op {
            Operation::Concat(spec) => Some(Operation::Concat(ConcatSpec {
                axis: spec.axis + 1,
            })),
            _ => None,
        };
        rewriter.set_output(id, output)?;
        if let Some(op) = op {
            rewriter.set_op(id, op)?;
        }
    }
    Ok(())
}

/// Points the output at `stores` in place of the concat store, then drops the store and the
/// concat.
fn replace_sink(
    rewriter: &mut GraphRewriter<'_>,
    concat: NodeId,
    sink: &ConcatSink,
    stores: &[NodeId],
) -> ConcatFusionResult<()> {
    let mut rewired = Vec::new();
    for input in rewriter.inputs(sink.output)? {
        if *input == sink.store {
            rewired.extend_from_slice(stores);
        } else {
            rewired.push(*input);
        }
    }
    rewriter.set_inputs(sink.output, rewired)?;
    rewriter.erase_node(sink.store)?;
    rewriter.erase_node(concat)?;
    rewriter.sort_topologically()?;
    Ok(())
}

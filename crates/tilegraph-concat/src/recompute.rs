use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tilegraph::backend::{
    expr::SizeExpr,
    rewriter::GraphRewriter,
    spec::{NodeId, Operation},
};
use tracing::{trace, warn};

use crate::error::{ConcatFusionError, ConcatFusionResult};
use crate::group_type::GroupType;
use crate::partition::ConcatGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecomputeOptions {
    /// Inputs whose concat extents are provably equal may keep sharing an ancestor.
    pub single_group_mode: bool,
    pub max_walk_steps: usize,
}

impl RecomputeOptions {
    pub fn cross_groups(max_walk_steps: usize) -> Self {
        Self {
            single_group_mode: false,
            max_walk_steps,
        }
    }

    pub fn single_group(max_walk_steps: usize) -> Self {
        Self {
            single_group_mode: true,
            max_walk_steps,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecomputeStats {
    pub cloned_nodes: usize,
    pub relinked_edges: usize,
    pub walk_limit_hits: usize,
}

impl RecomputeStats {
    pub fn changed(&self) -> bool {
        self.cloned_nodes > 0 || self.relinked_edges > 0
    }

    pub fn merge(&mut self, other: RecomputeStats) {
        self.cloned_nodes += other.cloned_nodes;
        self.relinked_edges += other.relinked_edges;
        self.walk_limit_hits += other.walk_limit_hits;
    }
}

/// Edge `consumer.inputs[slot] = producer` visited by the backward walk.
type Edge = (NodeId, NodeId, usize);

/// Clones ancestors of `concat` whose output would otherwise be shared across a group boundary.
///
/// For each input of each group the producer chain is walked backwards up to the first ancestor
/// with more than one consuming edge. When that ancestor also reaches another concat slot at or
/// after the group start (under the hazard rule of `options`), the edge on the walked path is
/// relinked to a per-group clone whose inputs are the ancestor's own. The walk never continues
/// past that ancestor, and edges into clones made by this call do not count as fan-out. Nodes
/// are re-sorted topologically before returning.
pub fn recompute_nodes_cross_groups(
    rewriter: &mut GraphRewriter<'_>,
    concat: NodeId,
    groups: &[ConcatGroup],
    options: RecomputeOptions,
) -> ConcatFusionResult<RecomputeStats> {
    let axis = match rewriter.op(concat)? {
        Operation::Concat(spec) => spec.axis,
        other => {
            return Err(ConcatFusionError::invalid(
                concat,
                format!("expected concat, found {}", other.kind_name()),
            ))
        }
    };
    let mut dims = Vec::new();
    for input in rewriter.inputs(concat)?.to_vec() {
        let dim = rewriter.node(input)?.output.repeat(axis).cloned().ok_or_else(|| {
            ConcatFusionError::invalid(concat, format!("input {input} lacks the concat axis"))
        })?;
        dims.push(dim);
    }

    let mut stats = RecomputeStats::default();
    let mut created = HashSet::new();
    for (group_index, group) in groups.iter().enumerate() {
        if group.end > dims.len() {
            return Err(ConcatFusionError::invalid(
                concat,
                format!("group [{}, {}) exceeds {} inputs", group.start, group.end, dims.len()),
            ));
        }
        let mut pass = GroupPass {
            concat,
            group,
            group_index,
            dims: &dims,
            options,
            clones: HashMap::new(),
            created: &mut created,
        };
        for slot in group.range() {
            stats.merge(pass.repair_input(rewriter, slot)?);
        }
    }
    if stats.changed() {
        rewriter.sort_topologically()?;
    }
    Ok(stats)
}

/// Single-group repair over every input of `concat`: inputs with different extents never share
/// an ancestor afterwards.
pub fn recompute_diff_axes(
    rewriter: &mut GraphRewriter<'_>,
    concat: NodeId,
    max_walk_steps: usize,
) -> ConcatFusionResult<RecomputeStats> {
    let num_inputs = rewriter.inputs(concat)?.len();
    if num_inputs == 0 {
        return Ok(RecomputeStats::default());
    }
    let whole = ConcatGroup {
        start: 0,
        end: num_inputs,
        group_type: GroupType::DEFAULT,
        size: 0,
    };
    recompute_nodes_cross_groups(
        rewriter,
        concat,
        &[whole],
        RecomputeOptions::single_group(max_walk_steps),
    )
}

struct GroupPass<'g, 'c> {
    concat: NodeId,
    group: &'g ConcatGroup,
    group_index: usize,
    dims: &'g [SizeExpr],
    options: RecomputeOptions,
    /// original -> clone, scoped to this group.
    clones: HashMap<NodeId, NodeId>,
    /// Every clone made so far, across groups.
    created: &'c mut HashSet<NodeId>,
}

impl GroupPass<'_, '_> {
    fn repair_input(
        &mut self,
        rewriter: &mut GraphRewriter<'_>,
        slot: usize,
    ) -> ConcatFusionResult<RecomputeStats> {
        let mut stats = RecomputeStats::default();
        let producer = *rewriter.inputs(self.concat)?.get(slot).ok_or_else(|| {
            ConcatFusionError::invalid(self.concat, format!("missing input slot {slot}"))
        })?;
        let mut worklist: VecDeque<Edge> = VecDeque::from([(producer, self.concat, slot)]);
        let mut visited: HashSet<Edge> = HashSet::new();
        let mut steps = 0usize;

        while let Some(edge) = worklist.pop_front() {
            if !visited.insert(edge) {
                continue;
            }
            steps += 1;
            if steps > self.options.max_walk_steps {
                warn!(concat = %self.concat, slot, "recompute walk hit its step limit");
                stats.walk_limit_hits += 1;
                break;
            }
            let (node, consumer, input_slot) = edge;
            if self.created.contains(&node) || rewriter.op(node)?.is_data() {
                continue;
            }

            if self.fans_out(rewriter, node) {
                if self.is_hazard(rewriter, node, slot)? {
                    let clone = match self.clones.get(&node) {
                        Some(clone) => *clone,
                        None => {
                            let name =
                                format!("{}_rc{}", rewriter.node(node)?.name, self.group_index);
                            let clone = rewriter.duplicate_node(node, name)?;
                            self.clones.insert(node, clone);
                            self.created.insert(clone);
                            stats.cloned_nodes += 1;
                            trace!(original = %node, %clone, group = self.group_index, "recomputed ancestor");
                            clone
                        }
                    };
                    rewriter.set_input(consumer, input_slot, clone)?;
                    stats.relinked_edges += 1;
                }
                continue;
            }

            for (index, input) in rewriter.inputs(node)?.iter().enumerate() {
                worklist.push_back((*input, node, index));
            }
        }
        Ok(stats)
    }

    /// More than one consuming edge, not counting clones made by this call.
    fn fans_out(&self, rewriter: &GraphRewriter<'_>, node: NodeId) -> bool {
        rewriter
            .users_of(node)
            .iter()
            .filter(|edge| !self.created.contains(&edge.consumer))
            .count()
            > 1
    }

    fn is_hazard(
        &self,
        rewriter: &GraphRewriter<'_>,
        node: NodeId,
        slot: usize,
    ) -> ConcatFusionResult<bool> {
        let Some(reached) = slots_reached(
            rewriter,
            self.concat,
            node,
            self.options.max_walk_steps,
            &*self.created,
        ) else {
            warn!(concat = %self.concat, %node, "forward reach walk hit its step limit");
            return Ok(true);
        };
        Ok(reached.into_iter().any(|other| {
            other != slot
                && other >= self.group.start
                && (!self.options.single_group_mode || self.dims[other] != self.dims[slot])
        }))
    }
}

/// Concat slots fed (directly or transitively) by `start`; `None` when the walk exceeds `max_steps`.
pub fn concat_slots_reached(
    rewriter: &GraphRewriter<'_>,
    concat: NodeId,
    start: NodeId,
    max_steps: usize,
) -> Option<BTreeSet<usize>> {
    slots_reached(rewriter, concat, start, max_steps, &HashSet::new())
}

fn slots_reached(
    rewriter: &GraphRewriter<'_>,
    concat: NodeId,
    start: NodeId,
    max_steps: usize,
    skip: &HashSet<NodeId>,
) -> Option<BTreeSet<usize>> {
    let mut slots = BTreeSet::new();
    let mut queue = VecDeque::from([start]);
    let mut seen = HashSet::from([start]);
    let mut steps = 0usize;
    while let Some(node) = queue.pop_front() {
        steps += 1;
        if steps > max_steps {
            return None;
        }
        for edge in rewriter.users_of(node) {
            if skip.contains(&edge.consumer) {
                continue;
            }
            if edge.consumer == concat {
                slots.insert(edge.slot);
            } else if seen.insert(edge.consumer) {
                queue.push_back(edge.consumer);
            }
        }
    }
    Some(slots)
}

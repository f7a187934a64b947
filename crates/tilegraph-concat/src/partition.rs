use std::ops::Range;

use tilegraph::backend::{spec::Graph, spec::NodeId, target::TargetCapabilities};
use tracing::{debug, trace};

use crate::concat::ConcatInfo;
use crate::config::ConcatFusionConfig;
use crate::error::{ConcatFusionError, ConcatFusionResult};
use crate::group_type::{Classifier, GroupType};
use crate::small_tail;

/// Contiguous run `[start, end)` of concat inputs lowered together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcatGroup {
    pub start: usize,
    pub end: usize,
    pub group_type: GroupType,
    /// Summed per-row bytes of the members.
    pub size: u64,
}

impl ConcatGroup {
    pub fn singleton(index: usize, group_type: GroupType, size: u64) -> Self {
        Self {
            start: index,
            end: index + 1,
            group_type,
            size,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn is_singleton(&self) -> bool {
        self.len() == 1
    }

    pub fn contains(&self, index: usize) -> bool {
        self.range().contains(&index)
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Result of partitioning one concat, with the bounds the groups were built against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatPartition {
    pub groups: Vec<ConcatGroup>,
    pub classifier: Classifier,
    pub max_inputs_per_group: usize,
}

impl ConcatPartition {
    pub fn size_limit(&self, group_type: GroupType) -> u64 {
        self.classifier.size_limit(group_type)
    }

    pub fn default_cols_per_group(&self) -> u64 {
        self.classifier.default_cols_per_group
    }

    /// More than one group: the concat really gets split.
    pub fn is_split(&self) -> bool {
        self.groups.len() > 1
    }
}

/// Partitions the inputs of `concat`; `Ok(None)` when a dim after the concat axis is symbolic.
pub fn partition_groups(
    graph: &Graph,
    concat: NodeId,
    target: &dyn TargetCapabilities,
    config: &ConcatFusionConfig,
) -> ConcatFusionResult<Option<ConcatPartition>> {
    let info = ConcatInfo::from_graph(graph, concat)?;
    Ok(ConcatGroupPartitioner::new(&info, target, config)?.map(|partitioner| partitioner.partition()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Extend(GroupType),
    Submit,
}

#[derive(Debug, Clone, Copy)]
struct OpenGroup {
    start: usize,
    count: usize,
    size: u64,
    group_type: GroupType,
}

impl OpenGroup {
    fn close(self) -> ConcatGroup {
        ConcatGroup {
            start: self.start,
            end: self.start + self.count,
            group_type: self.group_type,
            size: self.size,
        }
    }
}

/// Greedy grouping of concat inputs by per-row byte footprint and alignment category.
#[derive(Debug, Clone)]
pub struct ConcatGroupPartitioner<'a> {
    config: &'a ConcatFusionConfig,
    node: NodeId,
    /// Per-row bytes of each input; `None` when its concat extent is symbolic.
    input_bytes: Vec<Option<u64>>,
    input_elems: Vec<Option<u64>>,
    stride: u64,
    classifier: Classifier,
    target_small_tail: bool,
    max_input_num_per_group: usize,
    known_row_count: u64,
    total_row_count: Option<u64>,
}

impl<'a> ConcatGroupPartitioner<'a> {
    /// Parses sizes and derives the per-node budgets.
    pub fn new(
        info: &ConcatInfo,
        target: &dyn TargetCapabilities,
        config: &'a ConcatFusionConfig,
    ) -> ConcatFusionResult<Option<Self>> {
        let Some(inner) = info
            .inner_dims()
            .iter()
            .map(|dim| dim.as_const())
            .collect::<Option<Vec<_>>>()
        else {
            debug!(concat = %info.name, "symbolic dim after the concat axis; grouping skipped");
            return Ok(None);
        };
        let overflow = |what| ConcatFusionError::Overflow { what };
        let stride_elems = inner
            .iter()
            .try_fold(1u64, |acc, dim| acc.checked_mul(*dim))
            .ok_or(overflow("concat stride"))?;
        let stride = stride_elems
            .checked_mul(info.dtype_size())
            .ok_or(overflow("concat stride"))?;

        let num_inputs = info.num_inputs();
        let mut input_bytes = Vec::with_capacity(num_inputs);
        let mut input_elems = Vec::with_capacity(num_inputs);
        for dim in &info.input_dims {
            match dim.as_const() {
                Some(dim) => {
                    input_bytes.push(Some(
                        dim.checked_mul(stride).ok_or(overflow("input row bytes"))?,
                    ));
                    input_elems.push(Some(
                        dim.checked_mul(stride_elems)
                            .ok_or(overflow("input row elements"))?,
                    ));
                }
                None => {
                    input_bytes.push(None);
                    input_elems.push(None);
                }
            }
        }

        let known_row_count = info.known_row_count()?;
        let total_row_count = info.total_row_count()?;
        let target_small_tail = target.supports_small_tail_concat();
        let can_use_small_tail = target_small_tail && small_tail::is_tail_eligible(info);

        let mut cap = if target_small_tail || num_inputs <= config.many_inputs_threshold {
            config.max_inputs_per_group
        } else {
            config.max_inputs_per_group_many
        };
        if known_row_count >= config.row_split_threshold {
            cap = (cap / 2).max(2);
        }
        cap = cap.max(1);

        let total_bytes = match info.output_dim().as_const() {
            Some(dim) => Some(dim.checked_mul(stride).ok_or(overflow("output row bytes"))?),
            None => None,
        };
        let mut default_cols = config.default_group_bytes;
        if let Some(total) = total_bytes.filter(|total| *total > 0) {
            let est_groups = num_inputs.div_ceil(cap).max(1) as u64;
            let balanced = round_up(total.div_ceil(est_groups), config.align_bytes)
                .ok_or(overflow("balanced group bytes"))?;
            if balanced < config.min_group_bytes {
                default_cols = config.min_group_bytes;
                let groups_at_floor = total.div_ceil(config.min_group_bytes.max(1)).max(1);
                let widened = num_inputs.div_ceil(groups_at_floor as usize);
                cap = cap.max(widened);
            } else {
                default_cols = balanced.min(config.default_group_bytes);
            }
        }

        let use_default_group = total_bytes.is_some_and(|total| total <= default_cols)
            && num_inputs <= cap
            && !can_use_small_tail;
        let is_scalar = total_row_count == Some(1);

        let classifier = Classifier {
            align_bytes: config.align_bytes,
            is_scalar,
            use_default_group,
            can_use_small_tail,
            small_tail_input_max_bytes: config.small_tail_input_max_bytes,
            scalar_input_max_elements: config.scalar_input_max_elements,
            small_tail_group_max_bytes: config.small_tail_group_max_bytes,
            default_cols_per_group: default_cols,
        };
        debug!(
            concat = %info.name,
            num_inputs,
            stride,
            cap,
            default_cols,
            can_use_small_tail,
            use_default_group,
            is_scalar,
            "concat partitioner initialised"
        );

        Ok(Some(Self {
            config,
            node: info.node,
            input_bytes,
            input_elems,
            stride,
            classifier,
            target_small_tail,
            max_input_num_per_group: cap,
            known_row_count,
            total_row_count,
        }))
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn max_inputs_per_group(&self) -> usize {
        self.max_input_num_per_group
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn known_row_count(&self) -> u64 {
        self.known_row_count
    }

    pub fn total_row_count(&self) -> Option<u64> {
        self.total_row_count
    }

    /// Runs the greedy scan followed by the merge and reclassification sweeps.
    pub fn partition(&self) -> ConcatPartition {
        let mut groups = self.scan();
        self.merge_small_groups(&mut groups);
        self.convert_to_default_if_too_small(&mut groups);
        self.merge_small_groups(&mut groups);
        debug!(groups = groups.len(), "concat partitioned");
        ConcatPartition {
            groups,
            classifier: self.classifier,
            max_inputs_per_group: self.max_input_num_per_group,
        }
    }

    fn scan(&self) -> Vec<ConcatGroup> {
        let mut groups = Vec::new();
        let mut open: Option<OpenGroup> = None;

        for index in 0..self.input_bytes.len() {
            let singleton = match (self.input_bytes[index], self.input_elems[index]) {
                (None, _) | (_, None) => Some(0),
                (Some(bytes), _) if bytes > self.config.large_input_bytes => Some(bytes),
                (Some(bytes), Some(elements)) => {
                    let group_type = self.classifier.classify(bytes, elements);
                    trace!(index, bytes, %group_type, "classified concat input");
                    if group_type.is_none() || bytes > self.classifier.size_limit(group_type) {
                        Some(bytes)
                    } else {
                        open = Some(match open {
                            None => OpenGroup {
                                start: index,
                                count: 1,
                                size: bytes,
                                group_type,
                            },
                            Some(current) => match self.need_submit(&current, bytes, group_type) {
                                Step::Extend(merged) => OpenGroup {
                                    count: current.count + 1,
                                    size: current.size + bytes,
                                    group_type: merged,
                                    ..current
                                },
                                Step::Submit => {
                                    groups.push(current.close());
                                    OpenGroup {
                                        start: index,
                                        count: 1,
                                        size: bytes,
                                        group_type,
                                    }
                                }
                            },
                        });
                        None
                    }
                }
            };
            if let Some(size) = singleton {
                if let Some(current) = open.take() {
                    groups.push(current.close());
                }
                groups.push(ConcatGroup::singleton(index, GroupType::NONE, size));
            }
        }
        if let Some(current) = open.take() {
            groups.push(current.close());
        }
        groups
    }

    fn need_submit(&self, open: &OpenGroup, bytes: u64, group_type: GroupType) -> Step {
        let size = open.size.saturating_add(bytes);
        if size > self.classifier.size_limit(open.group_type)
            || open.count + 1 > self.max_input_num_per_group
        {
            return Step::Submit;
        }
        if group_type == open.group_type {
            return Step::Extend(group_type);
        }
        match open.group_type.merge(group_type) {
            None => {
                let specialised = open.group_type != GroupType::DEFAULT
                    && open.group_type != GroupType::SCALAR;
                if open.count == 1 && specialised {
                    Step::Extend(GroupType::DEFAULT)
                } else {
                    Step::Submit
                }
            }
            Some(merged)
                if merged == GroupType::SMALL_TAIL
                    && size > self.classifier.size_limit(GroupType::SMALL_TAIL) =>
            {
                Step::Submit
            }
            Some(merged) => Step::Extend(merged),
        }
    }

    fn merged_type(&self, left: &ConcatGroup, right: &ConcatGroup) -> Option<GroupType> {
        if left.group_type.is_none() || right.group_type.is_none() {
            return None;
        }
        if left.group_type == right.group_type {
            return Some(left.group_type);
        }
        if left.group_type.intersects(GroupType::ALIGNED) && right.group_type == GroupType::DEFAULT
        {
            return Some(GroupType::DEFAULT);
        }
        let scalar = left.group_type == GroupType::SCALAR || right.group_type == GroupType::SCALAR;
        if (left.is_singleton() || right.is_singleton()) && !scalar {
            return Some(GroupType::DEFAULT);
        }
        None
    }

    /// Folds adjacent groups into their right neighbour until no pair can merge.
    ///
    /// Returns whether anything changed.
    pub fn merge_small_groups(&self, groups: &mut Vec<ConcatGroup>) -> bool {
        let mut changed_any = false;
        loop {
            let mut changed = false;
            let mut index = 0;
            while index + 1 < groups.len() {
                let (left, right) = (groups[index], groups[index + 1]);
                let merged = self.merged_type(&left, &right).and_then(|group_type| {
                    let size = left.size.checked_add(right.size)?;
                    let fits = left.len() + right.len() <= self.max_input_num_per_group
                        && size <= self.classifier.size_limit(group_type);
                    fits.then_some(ConcatGroup {
                        start: left.start,
                        end: right.end,
                        group_type,
                        size,
                    })
                });
                match merged {
                    Some(group) => {
                        trace!(start = group.start, end = group.end, group_type = %group.group_type, "merged concat groups");
                        groups[index + 1] = group;
                        groups.remove(index);
                        changed = true;
                    }
                    None => index += 1,
                }
            }
            changed_any |= changed;
            if !changed {
                return changed_any;
            }
        }
    }

    /// Singletons with a specialised category fall back to `DEFAULT`.
    pub fn convert_to_default_if_too_small(&self, groups: &mut [ConcatGroup]) -> bool {
        let mut changed = false;
        for group in groups.iter_mut().filter(|group| group.is_singleton()) {
            let small_tail = group.group_type.contains(GroupType::SMALL_TAIL);
            let aligned = !self.target_small_tail && group.group_type == GroupType::ALIGNED;
            if small_tail || aligned {
                group.group_type = GroupType::DEFAULT;
                changed = true;
            }
        }
        changed
    }
}

fn round_up(value: u64, align: u64) -> Option<u64> {
    if align == 0 {
        return Some(value);
    }
    value.div_ceil(align).checked_mul(align)
}

mod common;

use common::{c, concat_graph, concat_id, consts, s, tail_concat};
use tilegraph::backend::{spec::DType, target::TargetSpec};
use tilegraph_concat::{
    partition_groups, ConcatFusionConfig, ConcatGroup, ConcatGroupPartitioner, ConcatInfo,
    ConcatPartition, GroupType,
};

fn partition(graph: &tilegraph::Graph, target: &TargetSpec) -> ConcatPartition {
    partition_groups(graph, concat_id(graph), target, &ConcatFusionConfig::default())
        .expect("partition")
        .expect("static stride")
}

fn spans(groups: &[ConcatGroup]) -> Vec<(usize, usize, GroupType)> {
    groups
        .iter()
        .map(|group| (group.start, group.end, group.group_type))
        .collect()
}

fn assert_covers(groups: &[ConcatGroup], num_inputs: usize) {
    let mut next = 0;
    for group in groups {
        assert_eq!(group.start, next, "groups must be contiguous: {groups:?}");
        assert!(group.end > group.start, "empty group in {groups:?}");
        next = group.end;
    }
    assert_eq!(next, num_inputs);
}

/// `[412, 58 x4, 24 x16]` on the tail axis of an f16 output.
fn wide_then_narrow() -> tilegraph::Graph {
    let mut dims = vec![412];
    dims.extend([58; 4]);
    dims.extend([24; 16]);
    tail_concat(DType::F16, 8, &consts(&dims))
}

#[test]
fn dynamic_and_large_inputs_sit_alone() {
    let mut dims = consts(&[412, 1, 6, 6, 6, 6, 16, 16, 33, 16, 32, 32]);
    dims.extend([s("s1"), s("s2")]);
    dims.extend(consts(&[32, 1, 2, 3, 16, 1, 222]));
    let graph = concat_graph(DType::F32, &[c(16), c(0), c(2)], 1, &dims);

    let result = partition(&graph, &TargetSpec::generic());
    assert_covers(&result.groups, dims.len());
    assert_eq!(
        spans(&result.groups),
        vec![
            (0, 1, GroupType::NONE),
            (1, 9, GroupType::DEFAULT),
            (9, 12, GroupType::ALIGNED),
            (12, 13, GroupType::NONE),
            (13, 14, GroupType::NONE),
            (14, 20, GroupType::DEFAULT),
            (20, 21, GroupType::NONE),
        ]
    );
}

/// 412 unit inputs followed by `16, 16, 1, 2`: thirteen groups, each filled to the input cap.
#[test]
fn many_unit_inputs_on_a_small_tail_target() {
    let mut dims = vec![1; 412];
    dims.extend([16, 16, 1, 2]);
    let graph = tail_concat(DType::F16, 2, &consts(&dims));

    let result = partition(&graph, &TargetSpec::with_small_tail());
    assert_covers(&result.groups, 416);
    assert_eq!(result.groups.len(), 13);
    assert!(result
        .groups
        .iter()
        .all(|group| group.group_type == GroupType::SMALL_TAIL && group.len() == 32));
    let last = result.groups.last().expect("groups");
    assert_eq!((last.start, last.end, last.size), (384, 416, 126));
}

#[test]
fn wide_inputs_fill_the_default_budget() {
    let graph = wide_then_narrow();
    let result = partition(&graph, &TargetSpec::generic());
    assert_covers(&result.groups, 21);
    assert_eq!(result.default_cols_per_group(), 2048);
    assert_eq!(
        spans(&result.groups),
        vec![(0, 20, GroupType::DEFAULT), (20, 21, GroupType::DEFAULT)]
    );
    assert_eq!(result.groups[0].size, 2008);
    assert!(result.is_split());
}

#[test]
fn small_tail_target_carves_out_narrow_runs() {
    let graph = wide_then_narrow();
    let result = partition(&graph, &TargetSpec::with_small_tail());
    assert_covers(&result.groups, 21);
    assert_eq!(
        spans(&result.groups),
        vec![
            (0, 5, GroupType::DEFAULT),
            (5, 10, GroupType::SMALL_TAIL),
            (10, 15, GroupType::SMALL_TAIL),
            (15, 21, GroupType::DEFAULT),
        ]
    );
    for group in &result.groups {
        assert!(group.size <= result.size_limit(group.group_type), "{group:?}");
    }
}

#[test]
fn symbolic_trailing_dim_is_not_applicable() {
    let graph = concat_graph(DType::F16, &[c(4), c(0), s("s0")], 1, &consts(&[3, 5]));
    let result = partition_groups(
        &graph,
        concat_id(&graph),
        &TargetSpec::generic(),
        &ConcatFusionConfig::default(),
    )
    .expect("partition");
    assert!(result.is_none());
}

#[test]
fn single_row_output_uses_scalar_groups() {
    let graph = tail_concat(DType::F32, 1, &consts(&[3, 5, 8, 100, 7]));
    let result = partition(&graph, &TargetSpec::generic());
    assert_covers(&result.groups, 5);
    assert!(result.classifier.is_scalar);
    for group in &result.groups {
        assert!(
            group.group_type == GroupType::SCALAR || group.group_type.is_none(),
            "{group:?}"
        );
    }
}

#[test]
fn tiny_output_stays_in_one_default_group() {
    let graph = tail_concat(DType::F16, 4, &consts(&[3, 5, 16, 7]));
    let result = partition(&graph, &TargetSpec::generic());
    assert!(result.classifier.use_default_group);
    assert_eq!(spans(&result.groups), vec![(0, 4, GroupType::DEFAULT)]);
    assert!(!result.is_split());
}

#[test]
fn many_rows_halve_the_input_cap() {
    let graph = tail_concat(DType::F16, 4096, &consts(&[16; 40]));
    let result = partition(&graph, &TargetSpec::generic());
    assert_eq!(result.max_inputs_per_group, 16);
    assert_covers(&result.groups, 40);
    assert!(result.groups.iter().all(|group| group.len() <= 16));
}

#[test]
fn byte_floor_widens_the_cap_on_small_tail_nodes() {
    let graph = tail_concat(DType::F16, 1024, &consts(&[1; 20]));
    let result = partition(&graph, &TargetSpec::with_small_tail());
    assert!(result.classifier.can_use_small_tail);
    assert_eq!(result.default_cols_per_group(), 64);
    assert_eq!(result.max_inputs_per_group, 20, "halved cap of 16 widened to the floor");
    assert_eq!(spans(&result.groups), vec![(0, 20, GroupType::SMALL_TAIL)]);
}

#[test]
fn merge_and_convert_reach_a_fixed_point() {
    let config = ConcatFusionConfig::default();
    let target = TargetSpec::with_small_tail();
    let graph = wide_then_narrow();
    let info = ConcatInfo::from_graph(&graph, concat_id(&graph)).expect("concat info");
    let partitioner = ConcatGroupPartitioner::new(&info, &target, &config)
        .expect("partitioner")
        .expect("static stride");
    let mut groups = partitioner.partition().groups;
    let before = groups.clone();
    assert!(!partitioner.merge_small_groups(&mut groups));
    assert!(!partitioner.convert_to_default_if_too_small(&mut groups));
    assert_eq!(groups, before);
}

#[test]
fn convert_only_touches_specialised_singletons() {
    let config = ConcatFusionConfig::default();
    let target = TargetSpec::generic();
    let graph = wide_then_narrow();
    let info = ConcatInfo::from_graph(&graph, concat_id(&graph)).expect("concat info");
    let partitioner = ConcatGroupPartitioner::new(&info, &target, &config)
        .expect("partitioner")
        .expect("static stride");

    let mut groups = vec![
        ConcatGroup::singleton(0, GroupType::ALIGNED, 64),
        ConcatGroup::singleton(1, GroupType::NONE, 0),
        ConcatGroup {
            start: 2,
            end: 4,
            group_type: GroupType::ALIGNED,
            size: 128,
        },
        ConcatGroup::singleton(4, GroupType::SMALL_TAIL_AND_ALIGNED, 32),
    ];
    assert!(partitioner.convert_to_default_if_too_small(&mut groups));
    let types: Vec<_> = groups.iter().map(|group| group.group_type).collect();
    assert_eq!(
        types,
        vec![
            GroupType::DEFAULT,
            GroupType::NONE,
            GroupType::ALIGNED,
            GroupType::DEFAULT,
        ]
    );
}

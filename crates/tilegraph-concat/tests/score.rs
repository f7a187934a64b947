mod common;

use common::{c, concat_graph, concat_id, consts, s, tail_concat};
use tilegraph::backend::{spec::DType, target::TargetSpec};
use tilegraph::Graph;
use tilegraph_concat::{
    generate_score_one, ConcatFusionConfig, ConcatFusionError, ScoreFunction,
    ScoreFunctionGenerator, ScoreKind,
};

fn generate(graph: &Graph, target: &TargetSpec) -> ScoreFunction {
    let config = ConcatFusionConfig::default();
    ScoreFunctionGenerator::new(graph, concat_id(graph), target, &config)
        .expect("generator")
        .generate()
        .expect("score")
}

fn check_small_tail(graph: &Graph) -> ScoreFunction {
    let config = ConcatFusionConfig::default();
    let target = TargetSpec::with_small_tail();
    ScoreFunctionGenerator::new(graph, concat_id(graph), &target, &config)
        .expect("generator")
        .generate_for_check_small_tail()
        .expect("score")
}

fn returns(source: &str) -> usize {
    source.matches("return").count()
}

#[test]
fn aligned_stride_always_prefers() {
    let graph = concat_graph(DType::F16, &[c(4), c(0), c(16)], 1, &consts(&[3, 5]));
    let score = generate(&graph, &TargetSpec::generic());
    assert_eq!(score.body.trim(), "return 1;");
    assert_eq!(score.kind, ScoreKind::Prefer);
    assert_eq!(returns(&score.to_source()), 1);
    assert_eq!(score.name, "fused_score");
    assert_eq!(score.tiling_data, "fused_tiling_data_t");
}

#[test]
fn mostly_aligned_prefix_prefers() {
    let mut dims = vec![32; 9];
    dims.push(7);
    let graph = tail_concat(DType::F16, 8, &consts(&dims));
    let score = generate(&graph, &TargetSpec::generic());
    assert_eq!(score.static_value(), Some(1));
}

#[test]
fn exactly_one_tenth_unaligned_still_prefers() {
    let prefer = generate(
        &tail_concat(DType::F16, 8, &consts(&[144, 10, 6])),
        &TargetSpec::generic(),
    );
    assert_eq!(prefer.static_value(), Some(1));

    let reject = generate(
        &tail_concat(DType::F16, 8, &consts(&[144, 11, 6])),
        &TargetSpec::generic(),
    );
    assert_eq!(reject.static_value(), Some(-1));
    assert_eq!(reject.body.trim(), "return -1;");
    assert_eq!(returns(&reject.to_source()), 1);
}

#[test]
fn small_tail_shape_prefers_on_capable_targets() {
    let graph = tail_concat(DType::F16, 2, &consts(&[3, 5]));
    assert_eq!(
        generate(&graph, &TargetSpec::with_small_tail()).kind,
        ScoreKind::Prefer
    );
    assert_eq!(generate(&graph, &TargetSpec::generic()).kind, ScoreKind::Reject);
}

#[test]
fn symbolic_shapes_emit_a_runtime_check() {
    let dims = vec![c(3), s("s1")];
    let graph = concat_graph(DType::F32, &[c(4), c(0), s("s0")], 1, &dims);
    let score = generate(&graph, &TargetSpec::generic());
    assert_eq!(score.kind, ScoreKind::Runtime);
    assert_eq!(score.static_value(), None);

    let source = score.to_source();
    assert!(source.starts_with("int64_t fused_score(const fused_tiling_data_t* tiling_data) {\n"));
    assert!(source.contains(
        "  const int64_t s0 = tiling_data->s0;\n  const int64_t s1 = tiling_data->s1;\n"
    ));
    assert!(source.contains("const int64_t stride = 4 * s0;"));
    assert!(source.contains("if (stride % 32 == 0) {"));
    assert!(source.contains("const int64_t total = (3 + s1);"));
    assert!(source.contains("if (unaligned * 10 > total) {"));
    assert!(source.trim_end().ends_with("return 1;\n}"));
    assert!(!source.contains("static"), "generated code must not keep state");
}

#[test]
fn reserved_symbol_names_are_rejected() {
    let config = ConcatFusionConfig::default();
    let target = TargetSpec::generic();
    for name in ["stride", "int", "static"] {
        let graph = concat_graph(DType::F32, &[c(4), c(0), s(name)], 1, &consts(&[3, 5]));
        let err = ScoreFunctionGenerator::new(&graph, concat_id(&graph), &target, &config)
            .expect("generator")
            .generate()
            .expect_err("symbol clashes with C");
        assert!(matches!(err, ConcatFusionError::InvalidConcat { .. }), "{name}: {err}");
    }
}

#[test]
fn small_tail_check_rejects_aligned_strides() {
    let graph = concat_graph(DType::F16, &[c(4), c(0), c(16)], 1, &consts(&[3, 5]));
    let score = check_small_tail(&graph);
    assert_eq!(score.static_value(), Some(-1));
    assert_eq!(score.name, "fused_small_tail_score");
    assert_eq!(score.tiling_data, "fused_small_tail_tiling_data_t");
}

#[test]
fn small_tail_check_evaluates_static_columns() {
    let narrow = check_small_tail(&tail_concat(DType::F16, 2, &consts(&[3, 5])));
    assert_eq!(narrow.static_value(), Some(1));
    let wide = check_small_tail(&tail_concat(DType::F16, 2, &consts(&[20, 5])));
    assert_eq!(wide.static_value(), Some(-1));
}

#[test]
fn small_tail_check_bounds_runtime_columns() {
    let graph = concat_graph(DType::F16, &[c(4), c(0), s("s0")], 1, &consts(&[3, 5]));
    let score = check_small_tail(&graph);
    assert_eq!(score.kind, ScoreKind::Runtime);
    let source = score.to_source();
    assert!(source.contains("const int64_t s0 = tiling_data->s0;"));
    assert!(source.contains("const int64_t inner = s0;"));
    assert!(source.contains("if ((8) * inner > 128) {"));
    assert!(source.contains("if ((3) * inner > 16) {"));
    assert!(source.contains("if ((5) * inner > 16) {"));
}

#[test]
fn score_one_is_unconditional() {
    let score = generate_score_one("variant", "variant_tiling_data_t");
    assert_eq!(score.kind, ScoreKind::Prefer);
    assert_eq!(score.body, "return 1;\n");
    assert_eq!(
        score.to_string(),
        "int64_t variant(const variant_tiling_data_t* tiling_data) {\n  return 1;\n}\n"
    );
}

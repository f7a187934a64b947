//! Candidate lowerings of one concat node and the scores that choose between them at tiling
//! time.

pub mod rewrite;

use serde::{Deserialize, Serialize};
use tilegraph::backend::{
    rewriter::GraphRewriter,
    spec::{Graph, NodeAttr, NodeId, Operation},
    target::TargetCapabilities,
};
use tilegraph::env;
use tracing::debug;

use crate::concat::{find_first_concat, ConcatInfo};
use crate::config::ConcatFusionConfig;
use crate::error::{ConcatFusionError, ConcatFusionResult};
use crate::partition::{ConcatGroupPartitioner, ConcatPartition};
use crate::recompute::{recompute_diff_axes, recompute_nodes_cross_groups, RecomputeOptions};
use crate::score::{ScoreFunction, ScoreFunctionGenerator};
use crate::small_tail;

use rewrite::ConcatSink;

/// Set on concat nodes whose leading axis was synthesised; later passes must not fold it away.
pub const NO_MERGE_LEADING_AXIS: &str = "no_merge_leading_axis";
/// Requests the transpose-based small-tail lowering for a concat.
pub const FORCE_SMALL_TAIL: &str = "force_small_tail";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariantKind {
    /// Concat replaced by one store per input.
    Stores,
    /// Concat kept whole in one on-chip buffer.
    WholeBuffer,
    /// Concat split into groups.
    Split,
    /// Whole concat lowered through the small-tail path.
    ForcedSmallTail,
}

impl VariantKind {
    pub fn suffix(self) -> &'static str {
        match self {
            VariantKind::Stores => "stores",
            VariantKind::WholeBuffer => "whole",
            VariantKind::Split => "split",
            VariantKind::ForcedSmallTail => "small_tail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatVariant {
    pub kind: VariantKind,
    pub graph: Graph,
    /// Ancestors cloned so no producer is shared across groups.
    pub recomputed_nodes: usize,
    pub score: Option<ScoreFunction>,
}

/// Every variant generated for one concat node; empty when the graph has no concat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionCases {
    pub concat: Option<NodeId>,
    pub variants: Vec<ConcatVariant>,
}

impl FusionCases {
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn variant(&self, kind: VariantKind) -> Option<&ConcatVariant> {
        self.variants.iter().find(|variant| variant.kind == kind)
    }

    pub fn kinds(&self) -> Vec<VariantKind> {
        self.variants.iter().map(|variant| variant.kind).collect()
    }

    pub fn scores(&self) -> impl Iterator<Item = &ScoreFunction> {
        self.variants.iter().filter_map(|variant| variant.score.as_ref())
    }
}

/// Builds the candidate graphs for the first concat of a fused graph.
pub struct FusionCaseGenerator<'a> {
    target: &'a dyn TargetCapabilities,
    config: &'a ConcatFusionConfig,
}

impl<'a> FusionCaseGenerator<'a> {
    pub fn new(target: &'a dyn TargetCapabilities, config: &'a ConcatFusionConfig) -> Self {
        Self { target, config }
    }

    pub fn generate(&self, graph: &Graph) -> ConcatFusionResult<FusionCases> {
        let Some(concat) = find_first_concat(graph) else {
            debug!(graph = %graph.name, "no concat; nothing to generate");
            return Ok(FusionCases::default());
        };
        let info = ConcatInfo::from_graph(graph, concat)?;
        let sink = {
            let mut probe = graph.clone();
            let rewriter = GraphRewriter::new(&mut probe)?;
            rewrite::concat_sink(&rewriter, concat)?
        };
        debug!(
            graph = %graph.name,
            concat = %info.name,
            axis = info.axis,
            inputs = info.num_inputs(),
            leading = info.is_leading_axis(),
            target = self.target.target_name(),
            "generating concat variants"
        );

        let variants = if info.is_leading_axis() {
            self.leading_axis(graph, &info, &sink)?
        } else {
            self.non_leading_axis(graph, &info, &sink)?
        };
        debug!(
            concat = %info.name,
            variants = variants.len(),
            "concat variants generated"
        );
        Ok(FusionCases {
            concat: Some(concat),
            variants,
        })
    }

    fn leading_axis(
        &self,
        graph: &Graph,
        info: &ConcatInfo,
        sink: &ConcatSink,
    ) -> ConcatFusionResult<Vec<ConcatVariant>> {
        if info.num_inputs() > 1 && !self.target.supports_small_tail_concat() && info.rank() == 1 {
            let mut lifted = graph.clone();
            {
                let mut rewriter = GraphRewriter::new(&mut lifted)?;
                rewrite::add_leading_unit_axis(&mut rewriter, &info.name)?;
                self.verify(&rewriter, "leading unit axis")?;
            }
            let lifted_info = ConcatInfo::from_graph(&lifted, info.node)?;
            let mut variants = self.non_leading_axis(&lifted, &lifted_info, sink)?;
            for variant in &mut variants {
                mark_no_merge_leading_axis(&mut variant.graph);
            }
            return Ok(variants);
        }
        Ok(vec![self.stores_variant(graph, info, sink)?])
    }

    fn non_leading_axis(
        &self,
        graph: &Graph,
        info: &ConcatInfo,
        sink: &ConcatSink,
    ) -> ConcatFusionResult<Vec<ConcatVariant>> {
        let num_inputs = info.num_inputs();
        let target_small_tail = self.target.supports_small_tail_concat();
        let partitioner = ConcatGroupPartitioner::new(info, self.target, self.config)?;
        let cap = partitioner
            .as_ref()
            .map_or(self.config.max_inputs_per_group, |p| p.max_inputs_per_group());

        let mut whole = None;
        if num_inputs <= cap {
            whole = Some(self.whole_buffer_variant(graph, info)?);
            if target_small_tail && small_tail::matches_pattern(info, self.config) {
                debug!(concat = %info.name, "small-tail shape; whole buffer only");
                return Ok(whole.into_iter().collect());
            }
        }

        let mut split = None;
        match (&partitioner, self.config.enable_split) {
            (Some(partitioner), true) => {
                let partition = partitioner.partition();
                if partition.is_split() {
                    split = Some(self.split_variant(graph, info, sink, &partition)?);
                } else {
                    debug!(concat = %info.name, "one group; no split variant");
                }
            }
            (None, _) => debug!(concat = %info.name, "symbolic stride; no split variant"),
            (_, false) => debug!(concat = %info.name, "splitting disabled"),
        }

        if split.is_some() && whole.is_some() && info.output_dim().is_const() && !self.keep_original(info) {
            debug!(concat = %info.name, "split variant dominates the whole buffer");
            whole = None;
        }
        if whole.is_none() && split.is_none() {
            whole = Some(self.whole_buffer_variant(graph, info)?);
        }

        let mut forced = None;
        if target_small_tail && small_tail::dtype_eligible(info.dtype) && !info.inner_is_static() {
            forced = Some(self.forced_small_tail_variant(graph, info)?);
        }

        let count = [whole.is_some(), split.is_some(), forced.is_some()]
            .into_iter()
            .filter(|present| *present)
            .count();
        if count > 1 {
            let small_tail_in_play =
                forced.is_some() || (target_small_tail && small_tail::is_tail_eligible(info));
            let split_recomputed = split
                .as_ref()
                .is_some_and(|variant: &ConcatVariant| variant.recomputed_nodes > 0);
            if let Some(variant) = whole.as_mut() {
                let generator =
                    ScoreFunctionGenerator::new(&variant.graph, info.node, self.target, self.config)?;
                variant.score = if split_recomputed && !small_tail_in_play {
                    self.cheap_whole_buffer(info).then(|| generator.generate_score_one())
                } else {
                    Some(generator.generate()?)
                };
            }
            if let Some(variant) = forced.as_mut() {
                let generator =
                    ScoreFunctionGenerator::new(&variant.graph, info.node, self.target, self.config)?;
                variant.score = Some(generator.generate_for_check_small_tail()?);
            }
        }

        Ok(whole.into_iter().chain(split).chain(forced).collect())
    }

    /// Few inputs, or a small output row: the unsplit kernel stays competitive.
    fn keep_original(&self, info: &ConcatInfo) -> bool {
        info.num_inputs() <= self.config.keep_original_max_inputs
            || info
                .static_output_row_bytes()
                .is_some_and(|bytes| bytes <= self.config.keep_original_max_bytes)
    }

    fn cheap_whole_buffer(&self, info: &ConcatInfo) -> bool {
        info.num_inputs() <= self.config.keep_original_max_inputs
            && info
                .static_output_row_bytes()
                .is_some_and(|bytes| bytes <= self.config.keep_original_max_bytes)
    }

    fn stores_variant(
        &self,
        graph: &Graph,
        info: &ConcatInfo,
        sink: &ConcatSink,
    ) -> ConcatFusionResult<ConcatVariant> {
        let mut variant = graph.renamed(variant_name(graph, VariantKind::Stores));
        let mut rewriter = GraphRewriter::new(&mut variant)?;
        let stores = rewrite::convert_to_stores(&mut rewriter, info, sink)?;
        self.verify(&rewriter, "store conversion")?;
        debug!(concat = %info.name, stores = stores.len(), "concat converted to stores");
        Ok(ConcatVariant {
            kind: VariantKind::Stores,
            graph: variant,
            recomputed_nodes: 0,
            score: None,
        })
    }

    fn whole_buffer_variant(
        &self,
        graph: &Graph,
        info: &ConcatInfo,
    ) -> ConcatFusionResult<ConcatVariant> {
        let mut variant = graph.renamed(variant_name(graph, VariantKind::WholeBuffer));
        let mut rewriter = GraphRewriter::new(&mut variant)?;
        let stats = recompute_diff_axes(&mut rewriter, info.node, self.config.max_walk_steps)?;
        self.verify(&rewriter, "whole-buffer recompute")?;
        Ok(ConcatVariant {
            kind: VariantKind::WholeBuffer,
            graph: variant,
            recomputed_nodes: stats.cloned_nodes,
            score: None,
        })
    }

    fn split_variant(
        &self,
        graph: &Graph,
        info: &ConcatInfo,
        sink: &ConcatSink,
        partition: &ConcatPartition,
    ) -> ConcatFusionResult<ConcatVariant> {
        let mut variant = graph.renamed(variant_name(graph, VariantKind::Split));
        let mut rewriter = GraphRewriter::new(&mut variant)?;
        let stats = recompute_nodes_cross_groups(
            &mut rewriter,
            info.node,
            &partition.groups,
            RecomputeOptions::cross_groups(self.config.max_walk_steps),
        )?;
        let stores = rewrite::split_into_groups(&mut rewriter, info, sink, &partition.groups)?;
        self.verify(&rewriter, "concat split")?;
        debug!(
            concat = %info.name,
            groups = partition.groups.len(),
            stores = stores.len(),
            recomputed = stats.cloned_nodes,
            "split variant built"
        );
        Ok(ConcatVariant {
            kind: VariantKind::Split,
            graph: variant,
            recomputed_nodes: stats.cloned_nodes,
            score: None,
        })
    }

    fn forced_small_tail_variant(
        &self,
        graph: &Graph,
        info: &ConcatInfo,
    ) -> ConcatFusionResult<ConcatVariant> {
        let mut variant = graph.renamed(variant_name(graph, VariantKind::ForcedSmallTail));
        let mut rewriter = GraphRewriter::new(&mut variant)?;
        rewriter.set_attr(info.node, FORCE_SMALL_TAIL, NodeAttr::Bool(true))?;
        let stats = recompute_diff_axes(&mut rewriter, info.node, self.config.max_walk_steps)?;
        self.verify(&rewriter, "small-tail recompute")?;
        Ok(ConcatVariant {
            kind: VariantKind::ForcedSmallTail,
            graph: variant,
            recomputed_nodes: stats.cloned_nodes,
            score: None,
        })
    }

    fn verify(&self, rewriter: &GraphRewriter<'_>, stage: &'static str) -> ConcatFusionResult<()> {
        if env::verify_enabled() && !rewriter.verify() {
            return Err(ConcatFusionError::Verification { stage });
        }
        Ok(())
    }
}

fn variant_name(graph: &Graph, kind: VariantKind) -> String {
    format!("{}_{}", graph.name, kind.suffix())
}

fn mark_no_merge_leading_axis(graph: &mut Graph) {
    for node in &mut graph.nodes {
        if matches!(node.op, Operation::Concat(_)) {
            node.attrs
                .insert(NO_MERGE_LEADING_AXIS.to_string(), NodeAttr::Bool(true));
        }
    }
}

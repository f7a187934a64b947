//! Concat grouping, variant generation and tiling-time variant selection for fused
//! [`tilegraph`] graphs.

pub mod case;
pub mod concat;
pub mod config;
pub mod error;
pub mod group_type;
pub mod partition;
pub mod recompute;
pub mod score;
pub mod small_tail;

pub use case::{ConcatVariant, FusionCaseGenerator, FusionCases, VariantKind};
pub use concat::ConcatInfo;
pub use config::ConcatFusionConfig;
pub use error::{ConcatFusionError, ConcatFusionResult};
pub use group_type::GroupType;
pub use partition::{partition_groups, ConcatGroup, ConcatGroupPartitioner, ConcatPartition};
pub use recompute::{
    recompute_diff_axes, recompute_nodes_cross_groups, RecomputeOptions, RecomputeStats,
};
pub use score::{generate_score_one, ScoreFunction, ScoreFunctionGenerator, ScoreKind};

use std::{fs, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tilegraph::env;

/// Thresholds steering concat grouping, variant selection and generated score functions.
///
/// All byte quantities are per output row (one step of the axes before the concat axis).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcatFusionConfig {
    /// Minimum efficient transfer granularity.
    pub align_bytes: u64,
    /// Inputs wider than this always get a group of their own.
    pub large_input_bytes: u64,
    /// Widest input the small-tail path accepts.
    pub small_tail_input_max_bytes: u64,
    /// Byte budget of a `SMALL_TAIL` group.
    pub small_tail_group_max_bytes: u64,
    /// Upper bound for the balanced per-group byte budget.
    pub default_group_bytes: u64,
    /// Lower bound for the balanced per-group byte budget; falling under it widens the input cap.
    pub min_group_bytes: u64,
    /// Largest element count an input may have when the whole output is a single row.
    pub scalar_input_max_elements: u64,
    pub max_inputs_per_group: usize,
    pub max_inputs_per_group_many: usize,
    /// Input count above which `max_inputs_per_group_many` applies on generic targets.
    pub many_inputs_threshold: usize,
    /// Known row count from which the per-group input cap is halved.
    pub row_split_threshold: u64,
    /// Step bound for backward and forward graph walks.
    pub max_walk_steps: usize,
    pub keep_original_max_inputs: usize,
    pub keep_original_max_bytes: u64,
    /// Output columns the small-tail kernel handles in one pass.
    pub small_tail_max_output_cols: u64,
    pub small_tail_max_input_cols: u64,
    pub enable_split: bool,
}

impl Default for ConcatFusionConfig {
    fn default() -> Self {
        Self {
            align_bytes: 32,
            large_input_bytes: 1024,
            small_tail_input_max_bytes: 64,
            small_tail_group_max_bytes: 256,
            default_group_bytes: 2048,
            min_group_bytes: 64,
            scalar_input_max_elements: 256,
            max_inputs_per_group: 32,
            max_inputs_per_group_many: 16,
            many_inputs_threshold: 512,
            row_split_threshold: 1024,
            max_walk_steps: 1024,
            keep_original_max_inputs: 8,
            keep_original_max_bytes: 512,
            small_tail_max_output_cols: 128,
            small_tail_max_input_cols: 16,
            enable_split: true,
        }
    }
}

impl ConcatFusionConfig {
    /// Defaults with `TILEGRAPH_CONCAT_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env::number("TILEGRAPH_CONCAT_MAX_INPUTS_PER_GROUP") {
            self.max_inputs_per_group = value;
        }
        if let Some(value) = env::number("TILEGRAPH_CONCAT_DEFAULT_GROUP_BYTES") {
            self.default_group_bytes = value;
        }
        if let Some(value) = env::number("TILEGRAPH_CONCAT_MIN_GROUP_BYTES") {
            self.min_group_bytes = value;
        }
        if let Some(value) = env::number("TILEGRAPH_CONCAT_LARGE_INPUT_BYTES") {
            self.large_input_bytes = value;
        }
        if let Some(value) = env::number("TILEGRAPH_CONCAT_MAX_WALK_STEPS") {
            self.max_walk_steps = value;
        }
        if let Some(disabled) = env::flag("TILEGRAPH_CONCAT_DISABLE_SPLIT") {
            self.enable_split = !disabled;
        }
        self
    }

    pub fn from_json_str(src: &str) -> anyhow::Result<Self> {
        serde_json::from_str(src).context("invalid concat fusion config")
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json_str(&contents)
    }
}

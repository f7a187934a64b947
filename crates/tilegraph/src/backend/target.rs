use serde::{Deserialize, Serialize};

/// Read-only capability queries a lowering pass may ask of the compilation target.
pub trait TargetCapabilities: Send + Sync {
    fn target_name(&self) -> &str;

    /// Whether the target provides the transpose-based concat path for short rows.
    fn supports_small_tail_concat(&self) -> bool {
        false
    }
}

/// Plain-data target description, loadable from JSON alongside the rest of a build config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub name: String,
    #[serde(default)]
    pub small_tail_concat: bool,
}

impl TargetSpec {
    pub fn generic() -> Self {
        Self {
            name: "generic".to_string(),
            small_tail_concat: false,
        }
    }

    pub fn with_small_tail() -> Self {
        Self {
            name: "transpose-concat".to_string(),
            small_tail_concat: true,
        }
    }
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self::generic()
    }
}

impl TargetCapabilities for TargetSpec {
    fn target_name(&self) -> &str {
        &self.name
    }

    fn supports_small_tail_concat(&self) -> bool {
        self.small_tail_concat
    }
}

//! Shape rules for the transpose-based concat path used on rows that are only a few elements
//! wide.

use tilegraph::backend::spec::DType;

use crate::concat::ConcatInfo;
use crate::config::ConcatFusionConfig;

pub fn dtype_eligible(dtype: DType) -> bool {
    matches!(dtype.size_in_bytes(), 2 | 4)
}

/// Concat on the last axis with a 2- or 4-byte element.
pub fn is_tail_eligible(info: &ConcatInfo) -> bool {
    info.axis + 1 == info.rank() && dtype_eligible(info.dtype)
}

/// Static tail-axis shapes whose output row and every input row fit the small-tail kernel.
pub fn matches_pattern(info: &ConcatInfo, config: &ConcatFusionConfig) -> bool {
    if !is_tail_eligible(info) {
        return false;
    }
    let Some(inner) = info.inner_elems().as_const() else {
        return false;
    };
    let Some(output_cols) = info
        .output_dim()
        .as_const()
        .and_then(|dim| dim.checked_mul(inner))
    else {
        return false;
    };
    if output_cols > config.small_tail_max_output_cols {
        return false;
    }
    info.input_dims.iter().all(|dim| {
        dim.as_const()
            .and_then(|dim| dim.checked_mul(inner))
            .is_some_and(|cols| cols <= config.small_tail_max_input_cols)
    })
}

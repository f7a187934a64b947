//! Tiling-time score functions that choose between concat variants.
//!
//! Each function is emitted as C source taking one read-only tiling-data record and returning
//! `1` (prefer this variant) or `-1` (reject it). Bodies declare locals only, so the compiled
//! functions are reentrant.

mod emit;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tilegraph::backend::{
    expr::SizeExpr,
    spec::{DimSymbol, Graph, NodeId},
    target::TargetCapabilities,
};
use tracing::debug;

use crate::concat::ConcatInfo;
use crate::config::ConcatFusionConfig;
use crate::error::{ConcatFusionError, ConcatFusionResult};
use crate::small_tail;

use emit::{c_identifier, emit_symbol_bindings, push_block, push_line};

pub const PREFER: i64 = 1;
pub const REJECT: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreKind {
    /// Unconditionally returns `1`.
    Prefer,
    /// Unconditionally returns `-1`.
    Reject,
    /// Decides from the shapes in the tiling-data record.
    Runtime,
}

/// One generated score function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreFunction {
    pub name: String,
    /// C type name of the record the function reads.
    pub tiling_data: String,
    pub body: String,
    pub kind: ScoreKind,
}

impl ScoreFunction {
    fn constant(name: String, tiling_data: String, value: i64) -> Self {
        let kind = if value == PREFER {
            ScoreKind::Prefer
        } else {
            ScoreKind::Reject
        };
        let mut body = String::new();
        push_line(&mut body, 0, &format!("return {value};"));
        Self {
            name,
            tiling_data,
            body,
            kind,
        }
    }

    /// Compile-time answer, if the body does not depend on the tiling data.
    pub fn static_value(&self) -> Option<i64> {
        match self.kind {
            ScoreKind::Prefer => Some(PREFER),
            ScoreKind::Reject => Some(REJECT),
            ScoreKind::Runtime => None,
        }
    }

    pub fn to_source(&self) -> String {
        let mut out = String::new();
        push_line(
            &mut out,
            0,
            &format!(
                "int64_t {}(const {}* tiling_data) {{",
                self.name, self.tiling_data
            ),
        );
        push_block(&mut out, 1, &self.body);
        push_line(&mut out, 0, "}");
        out
    }
}

impl fmt::Display for ScoreFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_source())
    }
}

/// Score function that always prefers its variant.
pub fn generate_score_one(name: &str, tiling_data: &str) -> ScoreFunction {
    ScoreFunction::constant(c_identifier(name), c_identifier(tiling_data), PREFER)
}

/// Builds score functions for one concat node of one variant graph.
pub struct ScoreFunctionGenerator<'a> {
    info: ConcatInfo,
    target: &'a dyn TargetCapabilities,
    config: &'a ConcatFusionConfig,
    prefix: String,
}

impl<'a> ScoreFunctionGenerator<'a> {
    pub fn new(
        graph: &Graph,
        concat: NodeId,
        target: &'a dyn TargetCapabilities,
        config: &'a ConcatFusionConfig,
    ) -> ConcatFusionResult<Self> {
        Ok(Self {
            info: ConcatInfo::from_graph(graph, concat)?,
            target,
            config,
            prefix: c_identifier(&graph.name),
        })
    }

    pub fn function_name(&self) -> String {
        format!("{}_score", self.prefix)
    }

    pub fn tiling_data_name(&self) -> String {
        format!("{}_tiling_data_t", self.prefix)
    }

    pub fn small_tail_function_name(&self) -> String {
        format!("{}_small_tail_score", self.prefix)
    }

    pub fn small_tail_tiling_data_name(&self) -> String {
        format!("{}_small_tail_tiling_data_t", self.prefix)
    }

    pub fn generate_score_one(&self) -> ScoreFunction {
        generate_score_one(&self.function_name(), &self.tiling_data_name())
    }

    /// Preference for keeping the concat in one on-chip buffer.
    ///
    /// Prefers the variant when most of the output (at least nine tenths of the concat extent)
    /// is written at aligned offsets.
    pub fn generate(&self) -> ConcatFusionResult<ScoreFunction> {
        let name = self.function_name();
        let tiling_data = self.tiling_data_name();
        if self.target.supports_small_tail_concat()
            && small_tail::matches_pattern(&self.info, self.config)
        {
            debug!(concat = %self.info.name, "small-tail shape; score is constant");
            return Ok(ScoreFunction::constant(name, tiling_data, PREFER));
        }

        let align = self.align();
        let const_stride = self.const_part_stride()?;
        if const_stride % align == 0 {
            debug!(concat = %self.info.name, const_stride, "stride aligned; score is constant");
            return Ok(ScoreFunction::constant(name, tiling_data, PREFER));
        }
        if let Some(value) = self.static_alignment_answer(const_stride)? {
            debug!(concat = %self.info.name, value, "alignment score resolved statically");
            return Ok(ScoreFunction::constant(name, tiling_data, value));
        }
        self.runtime_alignment_score(name, tiling_data)
    }

    /// Preference for the forced small-tail variant.
    pub fn generate_for_check_small_tail(&self) -> ConcatFusionResult<ScoreFunction> {
        let name = self.small_tail_function_name();
        let tiling_data = self.small_tail_tiling_data_name();
        if self.const_part_stride()? % self.align() == 0 {
            return Ok(ScoreFunction::constant(name, tiling_data, REJECT));
        }

        let inner = self.info.inner_elems();
        let dims = self.distinct_input_dims();
        if let (Some(inner), Some(total)) = (inner.as_const(), self.info.output_dim().as_const()) {
            let static_dims: Option<Vec<u64>> = dims.iter().map(SizeExpr::as_const).collect();
            if let Some(static_dims) = static_dims {
                let mut fits = cols(total, inner)? <= self.config.small_tail_max_output_cols;
                for dim in &static_dims {
                    fits &= cols(*dim, inner)? <= self.config.small_tail_max_input_cols;
                }
                let value = if fits { PREFER } else { REJECT };
                return Ok(ScoreFunction::constant(name, tiling_data, value));
            }
        }

        let mut symbols = inner.symbols();
        self.info.output_dim().collect_symbols(&mut symbols);
        for dim in &dims {
            dim.collect_symbols(&mut symbols);
        }
        self.check_symbols(&symbols)?;

        let mut body = String::new();
        emit_symbol_bindings(&mut body, 0, &symbols);
        push_line(&mut body, 0, &format!("const int64_t inner = {inner};"));
        push_block(
            &mut body,
            0,
            &format!(
                r#"
                if (({total}) * inner > {max}) {{
                  return -1;
                }}
                "#,
                total = self.info.output_dim(),
                max = self.config.small_tail_max_output_cols,
            ),
        );
        for dim in &dims {
            push_block(
                &mut body,
                0,
                &format!(
                    r#"
                    if (({dim}) * inner > {max}) {{
                      return -1;
                    }}
                    "#,
                    max = self.config.small_tail_max_input_cols,
                ),
            );
        }
        push_line(&mut body, 0, "return 1;");
        Ok(ScoreFunction {
            name,
            tiling_data,
            body,
            kind: ScoreKind::Runtime,
        })
    }

    fn align(&self) -> u64 {
        self.config.align_bytes.max(1)
    }

    fn const_part_stride(&self) -> ConcatFusionResult<u64> {
        self.info
            .dtype_size()
            .checked_mul(self.info.inner_elems().const_factor())
            .ok_or(ConcatFusionError::Overflow {
                what: "constant stride",
            })
    }

    fn distinct_input_dims(&self) -> Vec<SizeExpr> {
        let mut seen = BTreeSet::new();
        self.info
            .input_dims
            .iter()
            .filter(|dim| seen.insert((*dim).clone()))
            .cloned()
            .collect()
    }

    fn static_alignment_answer(&self, const_stride: u64) -> ConcatFusionResult<Option<i64>> {
        let Some(total) = self.info.output_dim().as_const() else {
            return Ok(None);
        };
        let Some(dims) = self.info.static_input_dims() else {
            return Ok(None);
        };
        let unaligned = unaligned_extent(&dims, const_stride, self.align())?;
        let aligned_run = total.saturating_sub(unaligned);
        if u128::from(aligned_run) * 10 >= u128::from(total) * 9 {
            return Ok(Some(PREFER));
        }
        // Only a fully static stride proves the unaligned inputs really are misaligned.
        if self.info.inner_is_static() {
            return Ok(Some(REJECT));
        }
        Ok(None)
    }

    fn runtime_alignment_score(
        &self,
        name: String,
        tiling_data: String,
    ) -> ConcatFusionResult<ScoreFunction> {
        let stride = self.info.stride_expr();
        let total = self.info.output_dim();
        let mut symbols = stride.symbols();
        total.collect_symbols(&mut symbols);
        for dim in &self.info.input_dims {
            dim.collect_symbols(&mut symbols);
        }
        self.check_symbols(&symbols)?;
        debug!(
            concat = %self.info.name,
            symbols = symbols.len(),
            "emitting runtime alignment score"
        );

        let align = self.align();
        let mut body = String::new();
        emit_symbol_bindings(&mut body, 0, &symbols);
        push_block(
            &mut body,
            0,
            &format!(
                r#"
                const int64_t stride = {stride};
                if (stride % {align} == 0) {{
                  return 1;
                }}
                const int64_t total = {total};
                int64_t unaligned = 0;
                int misaligned = 0;
                "#
            ),
        );
        for dim in &self.info.input_dims {
            push_block(
                &mut body,
                0,
                &format!(
                    r#"
                    {{
                      const int64_t dim = {dim};
                      if (misaligned || (dim * stride) % {align} != 0) {{
                        misaligned = 1;
                        unaligned += dim;
                        if (unaligned * 10 > total) {{
                          return -1;
                        }}
                      }}
                    }}
                    "#
                ),
            );
        }
        push_line(&mut body, 0, "return 1;");
        Ok(ScoreFunction {
            name,
            tiling_data,
            body,
            kind: ScoreKind::Runtime,
        })
    }

    fn check_symbols(&self, symbols: &BTreeSet<DimSymbol>) -> ConcatFusionResult<()> {
        for symbol in symbols {
            let name = symbol.as_str();
            if !emit::is_bindable_symbol(name) {
                return Err(ConcatFusionError::invalid(
                    self.info.node,
                    format!("size symbol '{name}' cannot be bound in a score function"),
                ));
            }
        }
        Ok(())
    }
}

/// Concat extent written after the first input whose byte size breaks alignment, that input
/// included.
fn unaligned_extent(dims: &[u64], stride: u64, align: u64) -> ConcatFusionResult<u64> {
    let mut misaligned = false;
    let mut unaligned = 0u64;
    for dim in dims {
        let bytes = dim.checked_mul(stride).ok_or(ConcatFusionError::Overflow {
            what: "input bytes",
        })?;
        misaligned |= bytes % align != 0;
        if misaligned {
            unaligned = unaligned
                .checked_add(*dim)
                .ok_or(ConcatFusionError::Overflow {
                    what: "unaligned extent",
                })?;
        }
    }
    Ok(unaligned)
}

fn cols(dim: u64, inner: u64) -> ConcatFusionResult<u64> {
    dim.checked_mul(inner).ok_or(ConcatFusionError::Overflow {
        what: "small-tail columns",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaligned_extent_counts_from_first_break() {
        assert_eq!(unaligned_extent(&[16, 16, 3, 16], 2, 32).expect("extent"), 19);
        assert_eq!(unaligned_extent(&[16, 16], 2, 32).expect("extent"), 0);
        assert_eq!(unaligned_extent(&[1, 16], 2, 32).expect("extent"), 17);
    }

    #[test]
    fn score_one_source_shape() {
        let score = generate_score_one("fused.concat", "fused_tiling_data_t");
        assert_eq!(score.static_value(), Some(1));
        assert_eq!(
            score.to_source(),
            "int64_t fused_concat(const fused_tiling_data_t* tiling_data) {\n  return 1;\n}\n"
        );
    }
}

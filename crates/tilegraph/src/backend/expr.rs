use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops;

use serde::{Deserialize, Serialize};

use crate::backend::spec::DimSymbol;

/// Symbolic, non-negative size used for axis extents and tensor repeats.
///
/// Values built through [`SizeExpr::sum`] / [`SizeExpr::product`] (and the `+` / `*` operators)
/// are kept canonical: nested sums and products are flattened, constants are folded into a
/// single leading term and the remaining terms are sorted. Two canonical expressions compare
/// equal exactly when they are structurally identical, which is what "provably equal" means for
/// the concat passes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum SizeExpr {
    Const(u64),
    Sym(DimSymbol),
    Add(Vec<SizeExpr>),
    Mul(Vec<SizeExpr>),
}

impl SizeExpr {
    pub fn constant(value: u64) -> Self {
        SizeExpr::Const(value)
    }

    pub fn sym(name: impl Into<String>) -> Self {
        SizeExpr::Sym(DimSymbol::new(name))
    }

    pub fn zero() -> Self {
        SizeExpr::Const(0)
    }

    pub fn one() -> Self {
        SizeExpr::Const(1)
    }

    /// Canonical sum of `terms`. Constant folding saturates at `u64::MAX`; use
    /// [`SizeExpr::checked_sum`] where an overflow must be reported.
    pub fn sum<I>(terms: I) -> Self
    where
        I: IntoIterator<Item = SizeExpr>,
    {
        fold_sum(terms, |a, b| Some(a.saturating_add(b))).unwrap_or(SizeExpr::Const(u64::MAX))
    }

    /// Canonical sum of `terms`; `None` when the constant part overflows.
    pub fn checked_sum<I>(terms: I) -> Option<Self>
    where
        I: IntoIterator<Item = SizeExpr>,
    {
        fold_sum(terms, u64::checked_add)
    }

    /// Canonical product of `factors`. Constant folding saturates at `u64::MAX`; use
    /// [`SizeExpr::checked_product`] where an overflow must be reported.
    pub fn product<I>(factors: I) -> Self
    where
        I: IntoIterator<Item = SizeExpr>,
    {
        fold_product(factors, |a, b| Some(a.saturating_mul(b)))
            .unwrap_or(SizeExpr::Const(u64::MAX))
    }

    /// Canonical product of `factors`; `None` when the constant part overflows.
    pub fn checked_product<I>(factors: I) -> Option<Self>
    where
        I: IntoIterator<Item = SizeExpr>,
    {
        fold_product(factors, u64::checked_mul)
    }

    /// Returns the value when the expression contains no symbols.
    pub fn as_const(&self) -> Option<u64> {
        match self {
            SizeExpr::Const(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        self.as_const().is_some()
    }

    pub fn is_const_value(&self, expected: u64) -> bool {
        self.as_const() == Some(expected)
    }

    /// Largest constant known to divide the expression for every binding of its symbols.
    pub fn const_factor(&self) -> u64 {
        match self {
            SizeExpr::Const(value) => *value,
            SizeExpr::Sym(_) => 1,
            SizeExpr::Mul(factors) => factors
                .iter()
                .fold(1u64, |acc, factor| acc.saturating_mul(factor.const_factor())),
            SizeExpr::Add(terms) => terms
                .iter()
                .map(SizeExpr::const_factor)
                .fold(0u64, gcd),
        }
    }

    /// Every symbol the expression depends on, in sorted order.
    pub fn symbols(&self) -> BTreeSet<DimSymbol> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    pub fn collect_symbols(&self, out: &mut BTreeSet<DimSymbol>) {
        match self {
            SizeExpr::Const(_) => {}
            SizeExpr::Sym(sym) => {
                out.insert(sym.clone());
            }
            SizeExpr::Add(items) | SizeExpr::Mul(items) => {
                for item in items {
                    item.collect_symbols(out);
                }
            }
        }
    }

    /// Evaluates under `bindings`; `None` when a symbol is unbound or the value overflows.
    pub fn eval(&self, bindings: &BTreeMap<DimSymbol, u64>) -> Option<u64> {
        match self {
            SizeExpr::Const(value) => Some(*value),
            SizeExpr::Sym(sym) => bindings.get(sym).copied(),
            SizeExpr::Add(terms) => terms.iter().try_fold(0u64, |acc, term| {
                acc.checked_add(term.eval(bindings)?)
            }),
            SizeExpr::Mul(factors) => factors.iter().try_fold(1u64, |acc, factor| {
                acc.checked_mul(factor.eval(bindings)?)
            }),
        }
    }
}

fn fold_sum<I>(terms: I, add: impl Fn(u64, u64) -> Option<u64>) -> Option<SizeExpr>
where
    I: IntoIterator<Item = SizeExpr>,
{
    let mut constant = 0u64;
    let mut rest = Vec::new();
    for term in terms {
        match term {
            SizeExpr::Const(value) => constant = add(constant, value)?,
            SizeExpr::Add(inner) => {
                for item in inner {
                    match item {
                        SizeExpr::Const(value) => constant = add(constant, value)?,
                        other => rest.push(other),
                    }
                }
            }
            other => rest.push(other),
        }
    }
    if rest.is_empty() {
        return Some(SizeExpr::Const(constant));
    }
    rest.sort();
    if constant == 0 && rest.len() == 1 {
        return Some(rest.remove(0));
    }
    if constant != 0 {
        rest.insert(0, SizeExpr::Const(constant));
    }
    Some(SizeExpr::Add(rest))
}

fn fold_product<I>(factors: I, mul: impl Fn(u64, u64) -> Option<u64>) -> Option<SizeExpr>
where
    I: IntoIterator<Item = SizeExpr>,
{
    let mut constant = 1u64;
    let mut rest = Vec::new();
    for factor in factors {
        match factor {
            SizeExpr::Const(value) => constant = mul(constant, value)?,
            SizeExpr::Mul(inner) => {
                for item in inner {
                    match item {
                        SizeExpr::Const(value) => constant = mul(constant, value)?,
                        other => rest.push(other),
                    }
                }
            }
            other => rest.push(other),
        }
    }
    if constant == 0 || rest.is_empty() {
        return Some(SizeExpr::Const(constant));
    }
    rest.sort();
    if constant == 1 && rest.len() == 1 {
        return Some(rest.remove(0));
    }
    if constant != 1 {
        rest.insert(0, SizeExpr::Const(constant));
    }
    Some(SizeExpr::Mul(rest))
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

impl From<u64> for SizeExpr {
    fn from(value: u64) -> Self {
        SizeExpr::Const(value)
    }
}

impl From<DimSymbol> for SizeExpr {
    fn from(sym: DimSymbol) -> Self {
        SizeExpr::Sym(sym)
    }
}

impl ops::Add for SizeExpr {
    type Output = SizeExpr;

    fn add(self, rhs: SizeExpr) -> SizeExpr {
        SizeExpr::sum([self, rhs])
    }
}

impl ops::Mul for SizeExpr {
    type Output = SizeExpr;

    fn mul(self, rhs: SizeExpr) -> SizeExpr {
        SizeExpr::product([self, rhs])
    }
}

/// Renders a C expression over `int64_t` locals named after the symbols.
impl fmt::Display for SizeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeExpr::Const(value) => write!(f, "{value}"),
            SizeExpr::Sym(sym) => f.write_str(sym.as_str()),
            SizeExpr::Add(terms) => {
                f.write_str("(")?;
                for (index, term) in terms.iter().enumerate() {
                    if index > 0 {
                        f.write_str(" + ")?;
                    }
                    write!(f, "{term}")?;
                }
                f.write_str(")")
            }
            SizeExpr::Mul(factors) => {
                for (index, factor) in factors.iter().enumerate() {
                    if index > 0 {
                        f.write_str(" * ")?;
                    }
                    write!(f, "{factor}")?;
                }
                Ok(())
            }
        }
    }
}

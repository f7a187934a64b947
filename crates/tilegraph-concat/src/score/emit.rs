use std::collections::BTreeSet;

use tilegraph::backend::spec::DimSymbol;

/// Locals the score bodies declare themselves; size symbols must not shadow them.
pub(super) const RESERVED_LOCALS: &[&str] = &[
    "tiling_data",
    "stride",
    "inner",
    "total",
    "unaligned",
    "misaligned",
    "dim",
];

/// C99/C11 keywords plus the fixed-width types the generated code spells out.
const C_KEYWORDS: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
    "enum", "extern", "float", "for", "goto", "if", "inline", "int", "long", "register",
    "restrict", "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef",
    "union", "unsigned", "void", "volatile", "while", "_Alignas", "_Alignof", "_Atomic", "_Bool",
    "_Complex", "_Generic", "_Imaginary", "_Noreturn", "_Static_assert", "_Thread_local",
    "int8_t", "int16_t", "int32_t", "int64_t", "uint8_t", "uint16_t", "uint32_t", "uint64_t",
];

/// A size symbol can become a local of the generated function.
pub(super) fn is_bindable_symbol(name: &str) -> bool {
    is_c_identifier(name) && !RESERVED_LOCALS.contains(&name) && !C_KEYWORDS.contains(&name)
}

pub(super) fn is_c_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
}

/// Maps an arbitrary graph name onto a C identifier.
pub(super) fn c_identifier(name: &str) -> String {
    let mut ident: String = name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    if !ident.starts_with(|ch: char| ch == '_' || ch.is_ascii_alphabetic()) {
        ident.insert(0, '_');
    }
    ident
}

/// `const int64_t <sym> = tiling_data-><sym>;` for every symbol, in sorted order.
pub(super) fn emit_symbol_bindings(module: &mut String, indent: usize, symbols: &BTreeSet<DimSymbol>) {
    for symbol in symbols {
        let name = symbol.as_str();
        push_line(
            module,
            indent,
            &format!("const int64_t {name} = tiling_data->{name};"),
        );
    }
}

pub(super) fn push_line(module: &mut String, indent: usize, line: &str) {
    push_block(module, indent, line);
}

/// Appends `block` re-indented to `indent` levels, dropping its common leading whitespace and
/// the blank first/last lines a raw string literal brings along.
pub(super) fn push_block(module: &mut String, indent: usize, block: &str) {
    if block.is_empty() {
        return;
    }
    let pad = "  ".repeat(indent);
    let mut lines: Vec<&str> = block.split('\n').collect();
    if matches!(lines.first(), Some(line) if line.trim().is_empty()) {
        lines.remove(0);
    }
    if matches!(lines.last(), Some(line) if line.trim().is_empty()) {
        lines.pop();
    }

    let common = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);

    for line in lines {
        let trimmed = line.get(common..).unwrap_or("").trim_end();
        if trimmed.is_empty() {
            module.push('\n');
            continue;
        }
        module.push_str(&pad);
        module.push_str(trimmed);
        module.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_block_strips_shared_indent() {
        let mut out = String::new();
        push_block(
            &mut out,
            1,
            r#"
                if (x) {
                  return 1;
                }
            "#,
        );
        assert_eq!(out, "  if (x) {\n    return 1;\n  }\n");
    }

    #[test]
    fn identifiers() {
        assert!(is_c_identifier("s0"));
        assert!(is_c_identifier("_batch"));
        assert!(!is_c_identifier("0s"));
        assert!(!is_c_identifier("seq-len"));
        assert_eq!(c_identifier("fused.concat-3"), "fused_concat_3");
        assert_eq!(c_identifier("3d"), "_3d");
    }

    #[test]
    fn keywords_and_locals_are_not_bindable() {
        assert!(is_bindable_symbol("s0"));
        assert!(is_bindable_symbol("batch"));
        for name in ["int", "const", "static", "for", "while", "char", "int64_t", "stride", "dim"] {
            assert!(!is_bindable_symbol(name), "{name}");
        }
    }
}

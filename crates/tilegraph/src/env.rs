use std::env;
use std::str::FromStr;
use std::sync::OnceLock;

static TILEGRAPH_VERIFY: OnceLock<bool> = OnceLock::new();

pub fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Reads a boolean switch; unset or empty means `None`.
pub fn flag(name: &str) -> Option<bool> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    }
}

/// Reads and parses a numeric override, ignoring values that do not parse.
pub fn number<T: FromStr>(name: &str) -> Option<T> {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}

/// `TILEGRAPH_VERIFY=1` makes rewriting passes re-validate graphs after every edit batch.
pub fn verify_enabled() -> bool {
    *TILEGRAPH_VERIFY.get_or_init(|| flag("TILEGRAPH_VERIFY").unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", " YES ", "on"] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}

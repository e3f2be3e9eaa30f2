use std::env;
use std::sync::OnceLock;

static COMPFLOW_EAGER_ALLOC: OnceLock<bool> = OnceLock::new();
static COMPFLOW_LENIENT_ARGUMENTS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn flag(cell: &OnceLock<bool>, name: &str) -> bool {
    *cell.get_or_init(|| match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// Allocate network storage at compile time instead of on first forward.
pub(crate) fn eager_alloc_enabled() -> bool {
    flag(&COMPFLOW_EAGER_ALLOC, "COMPFLOW_EAGER_ALLOC")
}

/// Ignore forward arguments that are not inputs of the graph.
pub(crate) fn lenient_arguments_enabled() -> bool {
    flag(&COMPFLOW_LENIENT_ARGUMENTS, "COMPFLOW_LENIENT_ARGUMENTS")
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parses_common_truthy_spellings() {
        for value in ["1", "true", " YES ", "On"] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}

//! Structured logging for the whole workspace. Every binary calls [`init`] first, before doing
//! anything else, the same way the teacher's `services/authenticator` and `util` binaries do.

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

/// Reads `RUNTIME_LOG_LEVEL` (trace/debug/info/warn/error/critical, case-insensitive),
/// defaulting to `info` on anything unrecognised, and builds a terminal logger on stderr.
pub fn init() -> Logger {
    let level = std::env::var("RUNTIME_LOG_LEVEL").unwrap_or_default();
    let severity = parse_severity(&level).unwrap_or(Severity::Info);

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);

    builder.build().expect("failed to initialize logger")
}

fn parse_severity(raw: &str) -> Option<Severity> {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => Some(Severity::Trace),
        "debug" => Some(Severity::Debug),
        "info" => Some(Severity::Info),
        "warn" | "warning" => Some(Severity::Warning),
        "error" => Some(Severity::Error),
        "crit" | "critical" => Some(Severity::Critical),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_has_no_match() {
        assert!(parse_severity("banana").is_none());
    }

    #[test]
    fn known_levels_are_case_insensitive() {
        assert!(matches!(parse_severity("WARN"), Some(Severity::Warning)));
        assert!(matches!(parse_severity("Debug"), Some(Severity::Debug)));
    }
}

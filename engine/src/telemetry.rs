//! Telemetry and Observability
//!
//! Sets up `tracing-subscriber` for the gateway process. Everything is written
//! to stderr: stdout carries the JSON-RPC stream and must never see a log line.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// sqlx logs every statement at info; the audit path runs several per request
const QUIET_TARGETS: &[(&str, &str)] = &[("sqlx", "warn")];

/// Filter directive for a configured level
///
/// The gateway crates follow `log_level`, noisy dependencies stay at their
/// quiet level unless the user asked for trace.
pub fn filter_directive(log_level: &str) -> String {
    let mut directive = format!(
        "{level},saan_engine={level},saan_sdk={level}",
        level = log_level
    );
    if log_level != "trace" {
        for (target, level) in QUIET_TARGETS {
            directive.push_str(&format!(",{}={}", target, level));
        }
    }
    directive
}

/// Initialize the tracing subscriber
///
/// Priority: `RUST_LOG` > `cli_level` (`--log`) > `config_level`.
///
/// Debug builds print pretty output; release builds emit JSON with the
/// current span so session logs can be collected by line.
pub fn init_telemetry_with_level(cli_level: Option<&str>, config_level: &str) {
    let level = cli_level.unwrap_or(config_level);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_quiets_sqlx() {
        let d = filter_directive("debug");
        assert!(d.starts_with("debug,saan_engine=debug,saan_sdk=debug"));
        assert!(d.ends_with(",sqlx=warn"));
        assert!(EnvFilter::try_new(&d).is_ok());
    }

    #[test]
    fn test_trace_keeps_everything() {
        assert!(!filter_directive("trace").contains("sqlx"));
    }
}

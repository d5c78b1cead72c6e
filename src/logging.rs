//! Logging setup.
//!
//! Structured logging via `tracing`. Noisy library modules (hyper,
//! reqwest, rustls, ...) are pinned to `warn` so business logs stay
//! readable at `debug`; `RUST_LOG` overrides everything.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Modules that produce high-volume logs without business context.
const NOISY_MODULES: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls", "tokio_util"];

fn build_filter(log_level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut directives = String::from(log_level);
    for module in NOISY_MODULES {
        directives.push_str(&format!(",{module}=warn"));
    }
    EnvFilter::new(&directives)
}

/// Initialize logging.
///
/// `log_format` is `"json"` for structured output, anything else gets the
/// human-readable default.
pub fn init_logging(log_level: &str, log_format: &str) {
    let filter = build_filter(log_level);
    let subscriber = tracing_subscriber::registry().with(filter);

    if log_format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        let _ = subscriber.with(fmt_layer).try_init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(true);
        let _ = subscriber.with(fmt_layer).try_init();
    }

    tracing::info!(log_level = %log_level, log_format = %log_format, "Logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_includes_noise_suppression() {
        // Indirect check: building the filter must not panic for the
        // levels we accept in config.
        for level in ["trace", "debug", "info", "warn", "error"] {
            let _ = build_filter(level);
        }
    }
}

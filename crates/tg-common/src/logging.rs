//! Structured logging setup shared by the Tollgate binaries and tests.
//!
//! - `LOG_FORMAT=json` selects JSON lines (one object per event, flattened fields)
//! - anything else selects compact human-readable output
//! - `RUST_LOG` filters as usual, defaulting to `info`
//!
//! Reservation workers log with structured fields (`correlation_id`,
//! `resource`, `status`), so both formats stay greppable:
//!
//! ```rust,ignore
//! tg_common::logging::init_logging("tg-demo");
//! tracing::info!(resource = %name, level = 3, "Counter registered");
//! ```

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Read `LOG_FORMAT` from the environment
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("LOG_FORMAT").unwrap_or_default())
    }

    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Calling it twice is harmless: the second
/// installation attempt is ignored.
pub fn init_logging(service_name: &str) {
    let format = LogFormat::from_env();
    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter())
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_thread_names(true)
                    .flatten_event(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter())
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_thread_names(true)
                    .with_ansi(true),
            )
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::debug!(service = service_name, ?format, "Logging initialized");
    }
}

/// Subscriber for tests: output is captured by the test harness.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_test_writer().with_target(true))
        .try_init();
}

//! Process-wide tracing setup.
//!
//! Logs are JSON lines with timestamps; the filter comes from `RUST_LOG` and
//! falls back to `info`. Every initializer is safe to call more than once:
//! only the first call installs a subscriber.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    /// Human-readable single-line output for local runs.
    Compact,
}

impl LogFormat {
    /// `"compact"` (any case) selects [`LogFormat::Compact`]; anything else is JSON.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("compact") {
            Self::Compact
        } else {
            Self::Json
        }
    }
}

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Initialize JSON logging for the process.
pub fn init() {
    init_with(LogFormat::Json);
}

pub fn init_with(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(DEFAULT_DIRECTIVE))
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
}

/// Logging for tests: output goes through the test harness capture and
/// defaults to `debug`.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .compact()
        .with_test_writer()
        .try_init();
}

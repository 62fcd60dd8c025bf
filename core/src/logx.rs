use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

/// Output layout for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Default multi-field layout with targets.
    #[default]
    Full,
    /// Single-line compact layout.
    Compact,
}

/// Initialize `tracing` once. Respects `RUST_LOG`; falls back to `default_level`.
pub fn init(default_level: &str) {
    init_with(default_level, LogFormat::Full);
}

/// Like [`init`], choosing the output layout.
pub fn init_with(default_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = fmt().with_env_filter(filter).with_target(true);
    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = match format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
}

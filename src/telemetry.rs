//! Logging initialization for test processes
//!
//! Sets up a `tracing` subscriber writing through the libtest capture writer,
//! so harness logs only show up for failing tests (or with `--nocapture`).
//! Verbosity follows the familiar 0-5 scale of Kubernetes components and is
//! mapped onto an `EnvFilter`. `RUST_LOG` still wins when set.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Verbosity used when nothing is configured
pub const DEFAULT_VERBOSITY: u8 = 3;

const VERBOSITY_ENV: &str = "ENVTEST_VERBOSITY";
const FORMAT_ENV: &str = "ENVTEST_LOG_FORMAT";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An environment variable held an unusable value
    #[error("invalid value for {var}: {value}")]
    InvalidEnv {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },

    /// The filter directive could not be parsed
    #[error("invalid log filter: {0}")]
    Filter(String),
}

/// Output format for harness logs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Logging configuration for a test run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// 0 (warnings only) to 5 (everything)
    pub verbosity: u8,
    /// Output format
    pub format: LogFormat,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            verbosity: DEFAULT_VERBOSITY,
            format: LogFormat::Text,
        }
    }
}

impl LogOptions {
    /// Read `ENVTEST_VERBOSITY` and `ENVTEST_LOG_FORMAT`, falling back to defaults
    pub fn from_env() -> Result<Self, TelemetryError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TelemetryError> {
        let mut options = Self::default();

        if let Some(value) = lookup(VERBOSITY_ENV) {
            options.verbosity = value
                .trim()
                .parse::<u8>()
                .map_err(|_| TelemetryError::InvalidEnv {
                    var: VERBOSITY_ENV,
                    value: value.clone(),
                })?;
        }

        if let Some(value) = lookup(FORMAT_ENV) {
            options.format = match value.trim().to_ascii_lowercase().as_str() {
                "text" | "" => LogFormat::Text,
                "json" => LogFormat::Json,
                _ => {
                    return Err(TelemetryError::InvalidEnv {
                        var: FORMAT_ENV,
                        value,
                    })
                }
            };
        }

        Ok(options)
    }

    /// Filter directive for this verbosity
    pub fn filter_directive(&self) -> &'static str {
        verbosity_filter(self.verbosity)
    }
}

/// Map a 0-5 verbosity onto an `EnvFilter` directive
pub fn verbosity_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 | 2 => "info,kube=warn",
        3 | 4 => "debug,kube=info,tower=warn,hyper=warn,rustls=warn",
        _ => "trace",
    }
}

/// Install the process-wide subscriber
///
/// Returns `Ok(false)` if a subscriber was already installed, which is the
/// normal case when several test binaries share helpers or a test installs
/// its own subscriber first.
pub fn init_logging(options: &LogOptions) -> Result<bool, TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(options.filter_directive())
            .map_err(|e| TelemetryError::Filter(e.to_string()))?,
    };

    let result = match options.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_test_writer()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init(),
    };

    Ok(result.is_ok())
}

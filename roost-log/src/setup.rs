use std::env;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::{prelude::*, EnvFilter, Layer};

/// Workspace crates whose logs follow the configured level. Everything else
/// stays at warnings unless `RUST_LOG` says otherwise.
const CRATE_NAMES: &[&str] = &[
    "roost",
    "roost_config",
    "roost_log",
    "roost_server",
    "roost_statsd",
    "roost_system",
];

/// Controls the log output format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pick [`LogFormat::Pretty`] on a terminal, [`LogFormat::Simplified`]
    /// otherwise.
    Auto,

    /// Compact colored output for interactive use.
    Pretty,

    /// Plain text without colors, one line per event.
    Simplified,

    /// One JSON object per line, for log shippers.
    Json,
}

impl LogFormat {
    /// Resolves `Auto` against the terminal.
    fn resolve(self) -> Self {
        match self {
            Self::Auto if console::user_attended() => Self::Pretty,
            Self::Auto => Self::Simplified,
            other => other,
        }
    }
}

mod level_serde {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(level)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|_| D::Error::custom(format!("invalid log level '{raw}'")))
    }
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// The level our own crates log at.
    #[serde(with = "level_serde")]
    pub level: Level,

    /// The output format, [`LogFormat::Auto`] by default.
    pub format: LogFormat,

    /// Force full backtraces on, equivalent to `RUST_BACKTRACE=full`.
    pub enable_backtraces: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Auto,
            enable_backtraces: false,
        }
    }
}

/// The filter applied when `RUST_LOG` is not set: dependencies at warnings,
/// our own crates at the configured level.
fn default_filter(level: Level) -> EnvFilter {
    let mut filter = EnvFilter::new("warn");

    for name in CRATE_NAMES {
        if let Ok(directive) = format!("{name}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    filter
}

/// Initialize the logging system.
///
/// # Example
///
/// ```
/// let log_config = roost_log::LogConfig {
///     enable_backtraces: true,
///     ..Default::default()
/// };
///
/// roost_log::init(&log_config);
/// ```
pub fn init(config: &LogConfig) {
    if config.enable_backtraces {
        env::set_var("RUST_BACKTRACE", "full");
    }

    let filter = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(raw) => EnvFilter::new(raw),
        Err(_) => default_filter(config.level),
    };

    let base = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    let format = match config.format.resolve() {
        LogFormat::Pretty => base.compact().without_time().boxed(),
        LogFormat::Json => base
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        _ => base.with_ansi(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(format.with_filter(LevelFilter::from(config.level)))
        .with(filter)
        .init();
}

//! Logging setup shared by the manager and worker processes.
//!
//! Workers inherit the manager's stderr, so every process writes to the same
//! stream; worker events carry `worker_id` from the span opened in
//! [`run_worker`](crate::worker::run_worker).
//!
//! # Environment Variables
//!
//! - `TIDEPOOL_LOG` - Log filter (overrides RUST_LOG)
//! - `TIDEPOOL_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `TIDEPOOL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `TIDEPOOL_LOG_FILE` - Path to log file (in addition to stderr)
//! - `TIDEPOOL_LOG_ROTATION` - File rotation: hourly, daily, never
//! - `TIDEPOOL_LOG_SPANS` - Log span timing on close (1/true/yes)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use tidepool::logging::{LogConfig, init};
//!
//! init(LogConfig::for_manager().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Filter variable; also how the manager hands `-v` down to its workers.
pub const LOG_FILTER_ENV: &str = "TIDEPOOL_LOG";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-field format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Log rotation for file output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    /// Single file
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
///
/// Start from a preset, apply `-v`/`-q` and the environment, then pass to
/// [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    pub format: LogFormat,
    /// Log file in addition to stderr
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Log span timing on close
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    pub show_target: bool,
    pub show_line_numbers: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_target: true,
            show_line_numbers: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the manager process.
    pub fn for_manager() -> Self {
        Self::default()
    }

    /// Preset for worker processes: one line per event so output from
    /// several workers interleaves readably.
    pub fn for_worker() -> Self {
        Self {
            format: LogFormat::Compact,
            show_target: false,
            ..Self::default()
        }
    }

    /// Map `-v`/`-q` counts to a filter. With neither flag the
    /// environment decides.
    pub fn with_verbosity(mut self, verbose: u8, quiet: bool) -> Self {
        let filter = match (quiet, verbose) {
            (true, _) => "error",
            (false, 0) => return self,
            (false, 1) => "debug",
            (false, _) => "trace",
        };
        self.filter = Some(filter.to_string());
        self
    }

    /// Apply environment variable overrides.
    ///
    /// CLI arguments take precedence: if a filter is already set (from `-v`
    /// or `-q`), `TIDEPOOL_LOG`, `RUST_LOG` and `TIDEPOOL_LOG_LEVEL` are
    /// ignored.
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if self.filter.is_none() {
            self.filter = var(LOG_FILTER_ENV).or_else(|| var("RUST_LOG"));
        }

        if self.filter.is_none()
            && let Some(level_str) = var("TIDEPOOL_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Some(format) = var("TIDEPOOL_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Some(path) = var("TIDEPOOL_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        if let Some(rotation) = var("TIDEPOOL_LOG_ROTATION")
            && let Ok(r) = rotation.parse()
        {
            self.rotation = r;
        }

        if let Some(spans) = var("TIDEPOOL_LOG_SPANS") {
            self.span_events = matches!(spans.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                EnvFilter::new(self.level.to_string().to_lowercase())
            })
        } else {
            EnvFilter::new(self.level.to_string().to_lowercase())
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// One formatting layer writing to `writer`.
    fn layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
    {
        let base = fmt::layer()
            .with_span_events(self.span_events())
            .with_target(self.show_target)
            .with_line_number(self.show_line_numbers)
            .with_ansi(ansi)
            .with_writer(writer);
        match self.format {
            LogFormat::Json => base.json().boxed(),
            LogFormat::Compact => base.compact().boxed(),
            LogFormat::Pretty => base.boxed(),
        }
    }
}

/// Parse a log level string.
fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn file_appender(path: &Path, rotation: LogRotation) -> RollingFileAppender {
    let parent = path.parent().unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("tidepool.log");
    RollingFileAppender::new(rotation.into(), parent, file_name)
}

/// Initialize the global tracing subscriber.
///
/// Logs go to stderr, and also to `config.file_path` when set. Subsequent
/// calls are silently ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let mut layers = vec![config.layer(std::io::stderr, true)];
    if let Some(path) = &config.file_path {
        layers.push(config.layer(file_appender(path, config.rotation), false));
    }

    // Already initialized (e.g. in tests) is fine.
    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init();
}

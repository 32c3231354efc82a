//! Logging configuration and initialization
//!
//! Centralized `tracing` setup with human-readable or JSON console output and
//! an optional JSON log file.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard tracing filter, wins over everything else
//!   (e.g. "info", "graphforge::graph=debug")
//! - `GRAPHFORGE_LOG_LEVEL`: simple log level (error, warn, info, debug, trace)
//! - `GRAPHFORGE_LOG_FORMAT`: console format ("human" or "json")
//! - `GRAPHFORGE_LOG_FILE`: optional file receiving JSON logs
//!
//! What the library emits: `debug!` for validation, configuration and pass
//! results, `trace!` per executed task, `info!` for workload and pool
//! summaries, `warn!` for rejected sub-tensors.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Outcome of the first initialization; later calls return it unchanged
static TRACING_INITIALIZED: OnceCell<Result<(), LoggingError>> = OnceCell::new();

pub const LOG_LEVEL_ENV: &str = "GRAPHFORGE_LOG_LEVEL";
pub const LOG_FORMAT_ENV: &str = "GRAPHFORGE_LOG_FORMAT";
pub const LOG_FILE_ENV: &str = "GRAPHFORGE_LOG_FILE";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}")]
    InvalidLogFormat(String),

    #[error("failed to create log directory: {0}")]
    DirectoryCreationFailed(String),

    #[error("failed to open log file: {0}")]
    FileOpenFailed(String),

    /// Another global subscriber was installed first
    #[error("failed to install subscriber: {0}")]
    InitFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLogLevel(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Colored, human-readable console output
    #[default]
    Human,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" | "console" => Ok(LogFormat::Human),
            "json" | "structured" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidLogFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file and line of the event
    pub with_file_info: bool,
    /// Emit an event when spans close
    pub with_span_events: bool,
    /// Also write JSON logs to this file
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration from the `GRAPHFORGE_LOG_*` variables.
    ///
    /// Unset variables keep their defaults; malformed ones are errors.
    pub fn from_env() -> Result<Self, LoggingError> {
        let mut config = Self::new();
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            config.level = level.parse()?;
        }
        if let Ok(format) = std::env::var(LOG_FORMAT_ENV) {
            config.format = format.parse()?;
        }
        if let Ok(file) = std::env::var(LOG_FILE_ENV) {
            config.log_file = Some(PathBuf::from(file));
        }
        Ok(config)
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

/// Initialize logging from the environment, ignoring failures.
///
/// Idempotent: only the first call installs a subscriber.
///
/// ```ignore
/// graphforge::logging::init_logging_default();
/// tracing::info!("ready");
/// ```
pub fn init_logging_default() {
    if let Err(e) = init_logging_from_env() {
        eprintln!("graphforge: logging disabled: {}", e);
    }
}

/// Initialize logging from the `GRAPHFORGE_LOG_*` variables.
///
/// Malformed variables fall back to defaults. Idempotent.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    TRACING_INITIALIZED
        .get_or_init(|| {
            let config = LoggingConfig::from_env().unwrap_or_else(|_| {
                let log_file = std::env::var(LOG_FILE_ENV).ok().map(PathBuf::from);
                LoggingConfig {
                    log_file,
                    ..LoggingConfig::default()
                }
            });
            install(&config)
        })
        .clone()
}

/// Initialize logging with an explicit configuration. Idempotent.
pub fn init_with_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    TRACING_INITIALIZED.get_or_init(|| install(config)).clone()
}

pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

fn install(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(config.level)?;

    // File output is always JSON, whatever the console format
    let file_layer = match &config.log_file {
        Some(path) => Some(
            fmt::layer()
                .json()
                .with_writer(Mutex::new(open_log_file(path)?))
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_span_events(span_events(config.with_span_events)),
        ),
        None => None,
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_file(config.with_file_info)
                    .with_line_number(config.with_file_info)
                    .with_span_events(span_events(config.with_span_events)),
            )
            .try_init(),
        LogFormat::Human => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(config.with_file_info)
                    .with_line_number(config.with_file_info)
                    .with_span_events(span_events(config.with_span_events)),
            )
            .try_init(),
    };
    result.map_err(|e| LoggingError::InitFailed(e.to_string()))
}

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| LoggingError::DirectoryCreationFailed(e.to_string()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LoggingError::FileOpenFailed(format!("{}: {}", path.display(), e)))
}

/// `RUST_LOG` first, then the configured level.
fn build_env_filter(level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log)
            .map_err(|e| LoggingError::InvalidLogLevel(e.to_string()));
    }
    Ok(EnvFilter::new(level.as_filter_str()))
}

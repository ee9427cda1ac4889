//! # Logging Utilities
//!
//! Logging infrastructure for OnTarget using `tracing`.
//!
//! This module provides structured logging with support for:
//! - Multiple output formats (JSON for CI, pretty for development)
//! - Environment variable configuration
//! - Log level filtering
//! - File and console output
//! - Structured fields and spans
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ontarget_utils::init_logging;
//!
//! // Initialize with default settings (reads from RUST_LOG env var)
//! init_logging().expect("Failed to initialize logging");
//!
//! // Use tracing macros throughout your code
//! tracing::info!("Test run started");
//! tracing::debug!("Debug information");
//! tracing::error!("An error occurred");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level filter (e.g., `RUST_LOG=debug`, `RUST_LOG=ontarget_core=debug`)
//! - `ONTARGET_LOG_FORMAT`: Set output format (`json` or `pretty`, default: `pretty`)
//! - `ONTARGET_LOG_FILE`: Optional path to log file (if not set, logs only to console)

use std::path::PathBuf;
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default for development)
    Pretty,
    /// JSON format (default for CI)
    Json,
}

impl FromStr for LogFormat
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "ci" | "machine" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {s}. Use 'pretty' or 'json'")),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    Info,
    /// Debug level
    Debug,
    /// Trace level (most verbose)
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "Unknown log level: {s}. Use 'error', 'warn', 'info', 'debug', or 'trace'"
            )),
        }
    }
}

/// Initialize logging with default settings
///
/// Reads configuration from environment variables:
/// - `RUST_LOG`: Log level filter (e.g., `debug`, `ontarget_core=debug`)
/// - `ONTARGET_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
/// - `ONTARGET_LOG_FILE`: Optional path to log file
///
/// ## Example
///
/// ```rust,no_run
/// use ontarget_utils::init_logging;
///
/// init_logging().expect("Failed to initialize logging");
/// tracing::info!("Test run started");
/// ```
///
/// ## Errors
///
/// Returns an error if:
/// - Logging is already initialized
/// - File logging fails (if `ONTARGET_LOG_FILE` is set)
pub fn init_logging() -> Result<(), LoggingError>
{
    // Read format from environment or default to pretty
    let format = env::var("ONTARGET_LOG_FORMAT")
        .ok()
        .and_then(|s| LogFormat::from_str(&s).ok())
        .unwrap_or(LogFormat::Pretty);

    // Read log level from RUST_LOG or default to INFO
    let default_level = env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse::<LogLevel>()
        .map(Into::into)
        .unwrap_or(Level::INFO);

    init_logging_internal(format, default_level)
}

/// Initialize logging with explicit level and format
///
/// ## Example
///
/// ```rust,no_run
/// use ontarget_utils::{LogFormat, LogLevel, init_logging_with_level};
///
/// init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if logging is already initialized or file logging fails.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<(), LoggingError>
{
    init_logging_internal(format, level.into())
}

/// Initialize logging for a test run (file-only, no stdout)
///
/// This function configures logging to write only to a file, not to
/// stdout/stderr, which keeps firmware interaction logs out of the test
/// report printed on the console.
///
/// The log file is created in the user's home directory at
/// `~/.ontarget/YYYY-MM-DD-ontarget-run.log`, falling back to
/// `/tmp/YYYY-MM-DD-ontarget-run.log` if the home directory is not
/// accessible. Returns the path chosen.
///
/// ## Arguments
///
/// * `level` - Optional log level. If `None`, uses the `RUST_LOG` environment variable or defaults to `INFO`.
///
/// ## Example
///
/// ```rust,no_run
/// use ontarget_utils::{LogLevel, init_logging_for_run};
///
/// // Use default (INFO or RUST_LOG)
/// let log_path = init_logging_for_run(None).expect("Failed to initialize run logging");
/// println!("target interaction log: {}", log_path.display());
/// ```
///
/// ## Errors
///
/// Returns an error if logging is already initialized or file creation fails.
pub fn init_logging_for_run(level: Option<LogLevel>) -> Result<PathBuf, LoggingError>
{
    // Date-prefixed file name, one file per day of test runs
    let today = Utc::now().format("%Y-%m-%d");
    let log_file = if let Ok(home) = env::var("HOME") {
        let run_dir = PathBuf::from(home).join(".ontarget");
        std::fs::create_dir_all(&run_dir)?;
        run_dir.join(format!("{today}-ontarget-run.log"))
    } else {
        PathBuf::from("/tmp").join(format!("{today}-ontarget-run.log"))
    };

    // File filter priority:
    // 1. An explicit level (from a CLI flag) wins
    // 2. RUST_LOG next (supports module-specific filters like "ontarget_core=debug")
    // 3. INFO otherwise
    let env_filter = if let Some(level) = level {
        EnvFilter::new(Level::from(level).to_string())
    } else if let Ok(rust_log) = env::var("RUST_LOG") {
        EnvFilter::try_new(&rust_log).unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    } else {
        EnvFilter::new(Level::INFO.to_string())
    };

    // rolling::never because the date is already in the file name
    let appender = tracing_appender::rolling::never(
        log_file.parent().unwrap_or(&PathBuf::from(".")),
        log_file.file_name().unwrap_or_default(),
    );
    Registry::default()
        .with(file_layer(LogFormat::Pretty, appender, env_filter))
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
    Ok(log_file)
}

/// Internal initialization for console logging plus an optional file copy
fn init_logging_internal(format: LogFormat, default_level: Level) -> Result<(), LoggingError>
{
    // RUST_LOG can override the default level with more specific filters
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let console = console_layer(format, env_filter.clone());

    if let Some(path) = env::var("ONTARGET_LOG_FILE").ok().map(PathBuf::from) {
        let appender = tracing_appender::rolling::daily(
            path.parent().unwrap_or(&PathBuf::from(".")),
            path.file_name().unwrap_or_default(),
        );
        Registry::default()
            .with(console)
            .with(file_layer(format, appender, env_filter))
            .try_init()
    } else {
        Registry::default().with(console).try_init()
    }
    .map_err(|err| LoggingError::InitializationFailed(err.to_string()))
}

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

fn console_layer<S>(format: LogFormat, filter: EnvFilter) -> BoxedLayer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let base = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(io::stdout);

    match format {
        LogFormat::Pretty => base.with_ansi(true).with_filter(filter).boxed(),
        LogFormat::Json => base
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

fn file_layer<S>(format: LogFormat, appender: RollingFileAppender, filter: EnvFilter) -> BoxedLayer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    // The worker guard flushes on drop; file logging lives for the whole
    // process, so leak it.
    std::mem::forget(guard);

    let base = fmt::layer()
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false); // No ANSI in files

    match format {
        LogFormat::Pretty => base.with_filter(filter).boxed(),
        LogFormat::Json => base
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

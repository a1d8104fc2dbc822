//! # Logging Utilities
//!
//! Subscriber setup for the `tracing` events emitted by `trapdoor-core`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use trapdoor_utils::init_logging;
//!
//! // Keep the guard alive for as long as events should reach the log file
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("simulator started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Filter directives (e.g. `RUST_LOG=debug`, `RUST_LOG=trapdoor_core::halt=debug`)
//! - `TRAPDOOR_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
//! - `TRAPDOOR_LOG_FILE`: Optional path of a log file, rotated daily
//!
//! Console output goes to stderr so that it never mixes with the reports
//! `trapdoor-sim` prints on stdout.

use std::ffi::OsString;
use std::fmt as std_fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format
pub const LOG_FORMAT_VAR: &str = "TRAPDOOR_LOG_FORMAT";

/// Environment variable naming the optional log file
pub const LOG_FILE_VAR: &str = "TRAPDOOR_LOG_FILE";

type Stack = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Stack> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {s}. Use 'pretty' or 'json'")),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    Error,
    Warn,
    /// Default
    Info,
    /// Patch, breakpoint and halt activity of the core
    Debug,
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

impl std_fmt::Display for LogLevel
{
    fn fmt(&self, f: &mut std_fmt::Formatter<'_>) -> std_fmt::Result
    {
        std_fmt::Display::fmt(&Level::from(*self), f)
    }
}

/// Keeps the background file writer alive
///
/// Dropping the guard flushes and stops file logging; console logging is
/// unaffected.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug)]
pub struct LoggingGuard
{
    file: Option<WorkerGuard>,
}

impl LoggingGuard
{
    /// Whether events are also written to a file
    pub fn has_file(&self) -> bool
    {
        self.file.is_some()
    }
}

/// Initialize logging from the environment
///
/// `RUST_LOG` filters (default `info`), `TRAPDOOR_LOG_FORMAT` picks the
/// format and `TRAPDOOR_LOG_FILE` adds a file.
///
/// ## Errors
///
/// - `InvalidFormat`: `TRAPDOOR_LOG_FORMAT` is set to an unknown format
/// - `InitializationFailed`: a global subscriber is already installed
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    let format = format_from_env()?.unwrap_or_default();
    init_logging_internal(format, None)
}

/// Initialize logging with an explicit level and format
///
/// The level overrides `RUST_LOG`; `TRAPDOOR_LOG_FILE` is still honoured.
///
/// ## Example
///
/// ```rust,no_run
/// use trapdoor_utils::{LogFormat, LogLevel, init_logging_with_level};
///
/// let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if logging is already initialized.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    init_logging_internal(format, Some(level.into()))
}

fn format_from_env() -> Result<Option<LogFormat>, LoggingError>
{
    match env::var(LOG_FORMAT_VAR) {
        Ok(value) => value.parse().map(Some).map_err(LoggingError::InvalidFormat),
        Err(_) => Ok(None),
    }
}

/// Build the filter
///
/// Priority: an explicit level (from `--log-level`), then `RUST_LOG`
/// (module directives allowed), then `info`.
fn build_filter(explicit_level: Option<Level>) -> EnvFilter
{
    match explicit_level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
    }
}

fn build_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());

    match format {
        LogFormat::Pretty => layer.with_ansi(ansi).boxed(),
        LogFormat::Json => layer.json().with_current_span(true).with_span_list(true).boxed(),
    }
}

/// Directory and file name for the daily rolling appender
fn split_log_path(path: &Path) -> (PathBuf, OsString)
{
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file = path.file_name().map_or_else(|| OsString::from("trapdoor.log"), OsString::from);
    (directory, file)
}

fn init_logging_internal(format: LogFormat, explicit_level: Option<Level>) -> Result<LoggingGuard, LoggingError>
{
    let mut layers: Vec<BoxedLayer> = vec![build_layer(format, io::stderr, true)];

    let mut file_guard = None;
    if let Some(path) = env::var_os(LOG_FILE_VAR).map(PathBuf::from) {
        let (directory, file) = split_log_path(&path);
        std::fs::create_dir_all(&directory)?;
        let appender = tracing_appender::rolling::daily(directory, file);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(build_layer(format, writer, false));
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(build_filter(explicit_level))
        .with(layers)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;

    Ok(LoggingGuard { file: file_guard })
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

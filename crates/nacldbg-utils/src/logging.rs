//! # Logging
//!
//! `tracing-subscriber` setup: an [`EnvFilter`] over one console layer and an
//! optional file layer, pretty or JSON, with RFC 3339 UTC timestamps.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: filter directives (`debug`, `nacldbg_core::remote=trace`)
//! - `NACLDBG_LOG_FORMAT`: `pretty` (default) or `json`
//! - `NACLDBG_LOG_FILE`: also write to this file, rolled daily
//!
//! ```rust,no_run
//! let _guard = nacldbg_utils::init_logging().expect("logging");
//! tracing::info!(address = "localhost:4014", "connecting");
//! ```
//!
//! Keep the returned [`LoggingGuard`] alive for as long as the program
//! logs; dropping it flushes and stops the file writer.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const FORMAT_VARIABLE: &str = "NACLDBG_LOG_FORMAT";
const FILE_VARIABLE: &str = "NACLDBG_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable lines (default)
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "dev" | "text" => Ok(Self::Pretty),
            "json" | "prod" => Ok(Self::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    Error,
    Warn,
    Info,
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
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.trim().to_lowercase().as_str() {
            "error" | "err" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" | "dbg" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Keeps the non-blocking file writer running.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug, Default)]
pub struct LoggingGuard
{
    file: Option<WorkerGuard>,
}

impl LoggingGuard
{
    /// Whether events are also written to a file.
    #[must_use]
    pub const fn has_file(&self) -> bool
    {
        self.file.is_some()
    }
}

/// Console logging configured from the environment.
///
/// The level defaults to `info`; `RUST_LOG` refines it.
///
/// ## Errors
///
/// [`LoggingError::InvalidFormat`] for a bad `NACLDBG_LOG_FORMAT`, and
/// [`LoggingError::InitializationFailed`] if a global subscriber is already
/// installed.
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    let format = match env::var(FORMAT_VARIABLE) {
        Ok(value) if !value.trim().is_empty() => value.parse()?,
        _ => LogFormat::Pretty,
    };
    init_console(format, None)
}

/// Console logging with an explicit level, which wins over `RUST_LOG`.
///
/// ## Errors
///
/// See [`init_logging`].
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    init_console(format, Some(level.into()))
}

/// File-only logging into `dir/YYYY-MM-DD-nacldbg.log`.
///
/// Used when stdout belongs to something else (an IDE speaking over pipes).
/// Returns the path of the log file.
///
/// ## Errors
///
/// [`LoggingError::FileError`] if `dir` cannot be created, and
/// [`LoggingError::InitializationFailed`] if a global subscriber is already
/// installed.
pub fn init_logging_to_dir(dir: &Path, level: Option<LogLevel>) -> Result<(PathBuf, LoggingGuard), LoggingError>
{
    std::fs::create_dir_all(dir)?;
    let file_name = dated_file_name(&Utc::now().format("%Y-%m-%d").to_string());
    let path = dir.join(&file_name);

    // The date is already in the name.
    let appender = tracing_appender::rolling::never(dir, &file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    Registry::default()
        .with(vec![layer(LogFormat::Pretty, writer, false)])
        .with(filter(level.map(Into::into)))
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;

    tracing::debug!(path = %path.display(), "file logging initialised");
    Ok((path, LoggingGuard { file: Some(guard) }))
}

fn init_console(format: LogFormat, level: Option<Level>) -> Result<LoggingGuard, LoggingError>
{
    let mut layers = vec![layer(format, io::stderr, true)];
    let mut guard = LoggingGuard::default();

    if let Some(path) = env::var_os(FILE_VARIABLE).filter(|value| !value.is_empty()).map(PathBuf::from) {
        let directory = path.parent().filter(|parent| !parent.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let file_name = path.file_name().ok_or_else(|| {
            LoggingError::InitializationFailed(format!("{FILE_VARIABLE} has no file name: {}", path.display()))
        })?;
        let (writer, file_guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, file_name));
        layers.push(layer(format, writer, false));
        guard.file = Some(file_guard);
    }

    Registry::default()
        .with(layers)
        .with(filter(level))
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
    Ok(guard)
}

/// `level` when given, else `RUST_LOG`, else `info`.
fn filter(level: Option<Level>) -> EnvFilter
{
    match level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
    }
}

fn layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
    }
}

fn dated_file_name(date: &str) -> String
{
    format!("{date}-nacldbg.log")
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Unknown `NACLDBG_LOG_FORMAT` value
    #[error("Invalid log format: {0} (use 'pretty' or 'json')")]
    InvalidFormat(String),

    /// Unknown level name
    #[error("Invalid log level: {0} (use 'error', 'warn', 'info', 'debug' or 'trace')")]
    InvalidLevel(String),

    /// A global subscriber is already installed, or the configuration is unusable
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// Log directory or file could not be created
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

//! Logging bootstrap for canbench binaries
//!
//! Console output plus one log file per day (`YYYY-MM-DD_<service>.log`,
//! split into `.1`, `.2`, ... once a day's file grows past the size limit).
//! Both sinks use the bracketed level format:
//!
//! ```text
//! 2025-12-02T00:50:44.809000Z [INFO] Channel 0 started (FD, 500000 bit/s)
//! ```
//!
//! `RUST_LOG` wins over the configured level.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::Local;
use errors::{CanError, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment variable overriding the log root directory
pub const LOG_DIR_ENV: &str = "CANBENCH_LOG_DIR";

const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

// ============================================================================
// Event format
// ============================================================================

fn level_tag(level: Level) -> (&'static str, &'static str) {
    match level {
        Level::TRACE => ("[TRACE]", "\x1b[35m"),
        Level::DEBUG => ("[DEBUG]", "\x1b[34m"),
        Level::INFO => ("[INFO]", "\x1b[32m"),
        Level::WARN => ("[WARN]", "\x1b[33m"),
        Level::ERROR => ("[ERROR]", "\x1b[31m"),
    }
}

/// `timestamp [LEVEL] message`, coloured when the writer supports it
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        write!(writer, "{} ", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let (tag, color) = level_tag(*event.metadata().level());
        if writer.has_ansi_escapes() {
            write!(writer, "{}{}\x1b[0m ", color, tag)?;
        } else {
            write!(writer, "{} ", tag)?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

// ============================================================================
// Log root
// ============================================================================

static LOG_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// Fix the log root: `CANBENCH_LOG_DIR` > `config_dir` > `logs`
///
/// Only the first call has an effect.
pub fn init_log_root(config_dir: Option<&Path>) {
    LOG_ROOT.get_or_init(|| resolve_log_root(config_dir));
}

/// Log root chosen by [`init_log_root`], or the default resolution
pub fn get_log_root() -> PathBuf {
    LOG_ROOT
        .get()
        .cloned()
        .unwrap_or_else(|| resolve_log_root(None))
}

fn resolve_log_root(config_dir: Option<&Path>) -> PathBuf {
    match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => config_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
    }
}

// ============================================================================
// Daily file writer
// ============================================================================

fn daily_file_name(date: &str, service: &str, part: u32) -> String {
    if part == 0 {
        format!("{}_{}.log", date, service)
    } else {
        format!("{}_{}.{}.log", date, service, part)
    }
}

fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

struct OpenLog {
    date: String,
    part: u32,
    file: File,
    size: u64,
}

/// Appends to the current day's file, starting a new part past `max_size`
struct DailyFileWriter {
    service: String,
    dir: PathBuf,
    max_size: u64,
    current: OpenLog,
}

impl DailyFileWriter {
    fn new(service: String, dir: PathBuf, max_size: u64) -> io::Result<Self> {
        let current = Self::open(&dir, &service, today(), 0)?;
        Ok(Self {
            service,
            dir,
            max_size,
            current,
        })
    }

    fn open(dir: &Path, service: &str, date: String, part: u32) -> io::Result<OpenLog> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(daily_file_name(&date, service, part)))?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(OpenLog {
            date,
            part,
            file,
            size,
        })
    }
}

impl Write for DailyFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let current = &mut self.current;
        let date = today();
        if current.date != date {
            *current = Self::open(&self.dir, &self.service, date, 0)?;
        } else if current.size > 0 && current.size + buf.len() as u64 > self.max_size {
            let next = current.part + 1;
            *current = Self::open(&self.dir, &self.service, date, next)?;
        } else if !self
            .dir
            .join(daily_file_name(&current.date, &self.service, current.part))
            .exists()
        {
            // removed underneath us
            let (date, part) = (current.date.clone(), current.part);
            *current = Self::open(&self.dir, &self.service, date, part)?;
        }

        let written = current.file.write(buf)?;
        current.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.current.file.flush()
    }
}

// ============================================================================
// Subscriber
// ============================================================================

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Used in the file name and as the crate-level filter target
    pub service_name: String,
    pub log_dir: PathBuf,
    /// Default level when RUST_LOG is not set
    pub level: Level,
    /// Write the daily file in addition to the console
    pub enable_file: bool,
    /// JSON lines instead of the bracketed format in the file
    pub enable_json: bool,
    pub max_file_size: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "canbench".to_string(),
            log_dir: get_log_root(),
            level: Level::INFO,
            enable_file: true,
            enable_json: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Flushes the file sink when the process exits
static FILE_GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();

/// Install the global subscriber
pub fn init_with_config(config: LogConfig) -> Result<()> {
    let spec = match std::env::var("RUST_LOG") {
        Ok(spec) if !spec.is_empty() => spec,
        _ => {
            let level = config.level.as_str().to_lowercase();
            format!("{},{}={}", level, config.service_name, level)
        },
    };
    let filter = EnvFilter::try_new(&spec)
        .map_err(|e| CanError::config(format!("invalid log filter '{}': {}", spec, e)))?;

    let console = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (file, guard) = if config.enable_file {
        let writer = DailyFileWriter::new(
            config.service_name.clone(),
            config.log_dir.clone(),
            config.max_file_size,
        )?;
        let (writer, guard) = tracing_appender::non_blocking(writer);
        let layer = if config.enable_json {
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| CanError::config(format!("logging already initialised: {}", e)))?;

    let _ = FILE_GUARD.set(Mutex::new(guard));

    if config.enable_file {
        tracing::info!("Logging {} to {}", config.service_name, config.log_dir.display());
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_level_tags() {
        assert_eq!(level_tag(Level::INFO).0, "[INFO]");
        assert_eq!(level_tag(Level::ERROR).0, "[ERROR]");
    }

    #[test]
    fn test_daily_file_name() {
        assert_eq!(daily_file_name("2025-03-01", "canbench", 0), "2025-03-01_canbench.log");
        assert_eq!(daily_file_name("2025-03-01", "canbench", 2), "2025-03-01_canbench.2.log");
    }

    #[test]
    fn test_writer_appends_to_todays_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            DailyFileWriter::new("unit".to_string(), dir.path().to_path_buf(), 1024).unwrap();
        writer.write_all(b"hello\n").unwrap();
        writer.flush().unwrap();

        let content =
            fs::read_to_string(dir.path().join(daily_file_name(&today(), "unit", 0))).unwrap();
        assert_eq!(content, "hello\n");
    }

    #[test]
    fn test_writer_starts_new_part_past_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            DailyFileWriter::new("rot".to_string(), dir.path().to_path_buf(), 8).unwrap();
        writer.write_all(b"12345678").unwrap();
        writer.write_all(b"abc").unwrap();
        writer.flush().unwrap();

        let first = dir.path().join(daily_file_name(&today(), "rot", 0));
        let second = dir.path().join(daily_file_name(&today(), "rot", 1));
        assert_eq!(fs::read_to_string(first).unwrap(), "12345678");
        assert_eq!(fs::read_to_string(second).unwrap(), "abc");
    }

    #[test]
    fn test_writer_recreates_deleted_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            DailyFileWriter::new("gone".to_string(), dir.path().to_path_buf(), 1024).unwrap();
        let path = dir.path().join(daily_file_name(&today(), "gone", 0));
        fs::remove_file(&path).unwrap();

        writer.write_all(b"back\n").unwrap();
        writer.flush().unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "back\n");
    }

    #[test]
    fn test_log_root_resolution() {
        if std::env::var(LOG_DIR_ENV).is_err() {
            assert_eq!(resolve_log_root(None), PathBuf::from("logs"));
            assert_eq!(
                resolve_log_root(Some(Path::new("/var/log/canbench"))),
                PathBuf::from("/var/log/canbench")
            );
        }
    }
}

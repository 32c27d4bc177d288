//! Structured logging for AFD components.
//!
//! Everything goes through `tracing`. Binaries initialise a stderr `fmt`
//! layer; AMG additionally installs [`SystemLogLayer`], which renders every
//! event as one system-log line and pushes it into `SYSTEM_LOG_FIFO` without
//! ever blocking.
//!
//! # Usage
//!
//! ```ignore
//! use afd_config::{log_amg_info, log_amg_fatal};
//!
//! log_amg_info!(hosts = 12, "Starting dir_check");
//! log_amg_fatal!(path = %p.display(), "Cannot attach afd_status");
//! ```

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use afd_ipc::{self as ipc, Verbosity};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter. `RUST_LOG` is the fallback.
pub const LOG_ENV: &str = "AFD_LOG";

/// Longest line written in one call. Stays below `PIPE_BUF` so concurrent
/// writers never interleave.
pub const MAX_LOG_LINE_LENGTH: usize = 4096;

/// Separator between the fixed fields of an event line and its info text.
pub const SEPARATOR_CHAR: char = '|';

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const AMG: &'static str = "AMG";
    pub const FSA: &'static str = "FSA";
    pub const DUPCHECK: &'static str = "DUPCHECK";
    pub const FIFO: &'static str = "FIFO";
    pub const CTL: &'static str = "CTL";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === AMG logging macros ===

#[macro_export]
macro_rules! log_amg_fatal {
    ($($arg:tt)+) => {
        tracing::error!(component = "AMG", fatal = true, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_amg_error {
    ($($arg:tt)+) => {
        tracing::error!(component = "AMG", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_amg_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "AMG", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_amg_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "AMG", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_amg_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "AMG", $($arg)+)
    };
}

// === FSA logging macros ===

#[macro_export]
macro_rules! log_fsa_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "FSA", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_fsa_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "FSA", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_fsa_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "FSA", $($arg)+)
    };
}

// === DUPCHECK logging macros ===

#[macro_export]
macro_rules! log_dupcheck_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "DUPCHECK", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_dupcheck_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "DUPCHECK", $($arg)+)
    };
}

// === CTL logging macros ===

#[macro_export]
macro_rules! log_ctl_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "CTL", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_ctl_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "CTL", $($arg)+)
    };
}

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()))
}

/// Initialize stderr logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Initialize logging for AMG: stderr plus the system-log FIFO.
///
/// Returns the sink so the crash handler can reach its descriptor.
pub fn init_amg_logging(level: LogLevel, fifo_dir: &Path) -> Arc<FifoSink> {
    let sink = Arc::new(FifoSink::new(fifo_dir.join(ipc::SYSTEM_LOG_FIFO)));
    let _ = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(SystemLogLayer::new(sink.clone()))
        .try_init();
    sink
}

// ---------------------------------------------------------------------------
// FIFO sink
// ---------------------------------------------------------------------------

/// Lazily opened, non-blocking writer for one log FIFO.
///
/// A missing FIFO is created on first use. When nobody reads, or the pipe is
/// full, the line is dropped.
#[derive(Debug)]
pub struct FifoSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FifoSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> std::io::Result<File> {
        let open = || {
            OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.path)
        };
        match open() {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                ipc::make_fifo(&self.path)?;
                open()
            }
            other => other,
        }
    }

    /// Write one record in a single call. Returns whether it went out.
    pub fn write_record(&self, record: &[u8]) -> bool {
        let Ok(mut guard) = self.file.lock() else {
            return false;
        };
        if guard.is_none() {
            match self.open() {
                Ok(f) => *guard = Some(f),
                Err(_) => return false,
            }
        }
        let Some(file) = guard.as_mut() else {
            return false;
        };
        match file.write(record) {
            Ok(n) => n == record.len(),
            Err(e) if e.kind() == ErrorKind::WouldBlock => false,
            Err(_) => {
                // Reader went away; reopen next time.
                *guard = None;
                false
            }
        }
    }

    /// Descriptor of the open FIFO, opening it if needed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        let mut guard = self.file.lock().ok()?;
        if guard.is_none() {
            *guard = Some(self.open().ok()?);
        }
        guard.as_ref().map(|f| f.as_raw_fd())
    }
}

/// Cut `line` to [`MAX_LOG_LINE_LENGTH`] on a char boundary and terminate it.
pub fn truncate_line(mut line: String) -> String {
    if line.len() >= MAX_LOG_LINE_LENGTH {
        let mut end = MAX_LOG_LINE_LENGTH - 1;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        line.truncate(end);
    }
    if !line.ends_with('\n') {
        line.push('\n');
    }
    line
}

// ---------------------------------------------------------------------------
// System log
// ---------------------------------------------------------------------------

/// Severity letter used in system-log lines.
pub fn level_char(level: &Level, fatal: bool) -> char {
    if fatal {
        return 'F';
    }
    match *level {
        Level::ERROR => 'E',
        Level::WARN => 'W',
        Level::INFO => 'I',
        Level::DEBUG => 'D',
        Level::TRACE => 'T',
    }
}

/// Render one system-log line: `DD HH:MM:SS <S> message (file line)`.
pub fn format_system_line(
    now: chrono::DateTime<chrono::Local>,
    sign: char,
    message: &str,
    location: Option<(&str, u32)>,
) -> String {
    let mut line = format!("{} <{}> {}", now.format("%d %H:%M:%S"), sign, message);
    if let Some((file, lineno)) = location {
        let file = Path::new(file)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.to_string());
        let _ = write!(line, " ({} {})", file, lineno);
    }
    truncate_line(line)
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
    fatal: bool,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            "component" => {}
            name => {
                let _ = write!(self.fields, " {}={}", name, value);
            }
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "fatal" {
            self.fatal = value;
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => {
                let _ = write!(self.message, "{:?}", value);
            }
            "component" => {}
            name => {
                let _ = write!(self.fields, " {}={:?}", name, value);
            }
        }
    }
}

/// `tracing` layer feeding the system-log FIFO.
pub struct SystemLogLayer {
    sink: Arc<FifoSink>,
}

impl SystemLogLayer {
    pub fn new(sink: Arc<FifoSink>) -> Self {
        Self { sink }
    }
}

impl<S: Subscriber> Layer<S> for SystemLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let sign = level_char(meta.level(), visitor.fatal);
        // Only problems carry their source location.
        let location = match sign {
            'F' | 'E' | 'W' => meta.file().zip(meta.line()),
            _ => None,
        };
        let message = format!("{}{}", visitor.message, visitor.fields);
        let line = format_system_line(chrono::Local::now(), sign, &message, location);
        self.sink.write_record(line.as_bytes());
    }
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Global = 1,
    Directory = 2,
    Production = 3,
    Host = 4,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Auto = 1,
    Manual = 2,
    External = 3,
}

// Event actions
pub const EA_REREAD_DIR_CONFIG: u32 = 1;
pub const EA_REREAD_HOST_CONFIG: u32 = 2;
pub const EA_AMG_STOP: u32 = 3;
pub const EA_AMG_START: u32 = 4;
pub const EA_DIR_CHECK_RESTART: u32 = 5;
pub const EA_ONETIME_CONFIG: u32 = 6;

/// `<hex-time> <class> <type> <action>[|<info>]`
pub fn format_event_line(
    now: i64,
    class: EventClass,
    event_type: EventType,
    action: u32,
    info: Option<&str>,
) -> String {
    let mut line = format!(
        "{:x} {} {} {}",
        now, class as u8, event_type as u8, action
    );
    if let Some(info) = info {
        line.push(SEPARATOR_CHAR);
        line.push_str(info);
    }
    truncate_line(line)
}

/// Writer for `EVENT_LOG_FIFO`.
pub struct EventLog {
    sink: FifoSink,
}

impl EventLog {
    pub fn new(fifo_dir: &Path) -> Self {
        Self {
            sink: FifoSink::new(fifo_dir.join(ipc::EVENT_LOG_FIFO)),
        }
    }

    pub fn log(&self, class: EventClass, event_type: EventType, action: u32, info: Option<&str>) {
        let now = chrono::Utc::now().timestamp();
        let line = format_event_line(now, class, event_type, action, info);
        self.sink.write_record(line.as_bytes());
    }
}

// ---------------------------------------------------------------------------
// Production log
// ---------------------------------------------------------------------------

/// Frame a production record: little-endian `u16` length, then the line.
pub fn frame_production_record(line: &str) -> Vec<u8> {
    let line = truncate_line(line.to_string());
    let bytes = line.as_bytes();
    let len = bytes.len().min(MAX_LOG_LINE_LENGTH - 2);
    let mut out = Vec::with_capacity(len + 2);
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(&bytes[..len]);
    out
}

/// Writer for `PRODUCTION_LOG_FIFO`.
pub struct ProductionLog {
    sink: FifoSink,
}

impl ProductionLog {
    pub fn new(fifo_dir: &Path) -> Self {
        Self {
            sink: FifoSink::new(fifo_dir.join(ipc::PRODUCTION_LOG_FIFO)),
        }
    }

    /// `<hex-time>|<job-hex>|<input>|<output>|<detail>`
    pub fn log(&self, job_id: u32, input: &str, output: &str, detail: &str) {
        let now = chrono::Utc::now().timestamp();
        let line = format!(
            "{:x}{sep}{:x}{sep}{}{sep}{}{sep}{}",
            now,
            job_id,
            input,
            output,
            detail,
            sep = SEPARATOR_CHAR
        );
        self.sink.write_record(&frame_production_record(&line));
    }
}

// ---------------------------------------------------------------------------
// Update log (reread diagnostics)
// ---------------------------------------------------------------------------

/// Diagnostics for one HOST_CONFIG or DIR_CONFIG reread.
///
/// Every line goes to the system log. With a verbose request it is also
/// mirrored into `DB_UPDATE_REPLY_DEBUG_FILE<pid>` so the dialog that asked
/// can show it; `Verbose2` mirrors debug lines too.
pub struct UpdateDbLog {
    debug_file: Option<File>,
    verbosity: Verbosity,
    warnings: u32,
}

impl UpdateDbLog {
    pub fn quiet() -> Self {
        Self {
            debug_file: None,
            verbosity: Verbosity::Quiet,
            warnings: 0,
        }
    }

    /// Open the per-request debug file when `verbosity` asks for one.
    pub fn open(fifo_dir: &Path, reply_pid: i32, verbosity: Verbosity) -> Self {
        let debug_file = if verbosity == Verbosity::Quiet {
            None
        } else {
            let path = fifo_dir.join(format!("{}{}", ipc::DB_UPDATE_REPLY_DEBUG_FILE, reply_pid));
            match OpenOptions::new()
                .append(true)
                .create(true)
                .mode(ipc::FILE_MODE)
                .open(&path)
            {
                Ok(f) => Some(f),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to open reply debug file");
                    None
                }
            }
        };
        Self {
            debug_file,
            verbosity,
            warnings: 0,
        }
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Warnings logged through this handle so far.
    pub fn warnings(&self) -> u32 {
        self.warnings
    }

    /// Count a warning that was logged elsewhere.
    pub fn add_warnings(&mut self, n: u32) {
        self.warnings += n;
    }

    pub fn log(&mut self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!(component = "AMG", "{}", message),
            Level::WARN => tracing::warn!(component = "AMG", "{}", message),
            Level::INFO => tracing::info!(component = "AMG", "{}", message),
            Level::DEBUG => tracing::debug!(component = "AMG", "{}", message),
            Level::TRACE => tracing::trace!(component = "AMG", "{}", message),
        }
        if level == Level::WARN {
            self.warnings += 1;
        }
        let mirror = level <= Level::INFO || self.verbosity == Verbosity::Verbose2;
        if let (Some(file), true) = (self.debug_file.as_mut(), mirror) {
            let line = format_system_line(chrono::Local::now(), level_char(&level, false), message, None);
            let _ = file.write_all(line.as_bytes());
        }
    }

    pub fn info(&mut self, message: &str) {
        self.log(Level::INFO, message);
    }

    pub fn warn(&mut self, message: &str) {
        self.log(Level::WARN, message);
    }

    pub fn debug(&mut self, message: &str) {
        self.log(Level::DEBUG, message);
    }
}

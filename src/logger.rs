//! Log sink behind the `logmsg!`, `logerr!` and `dbglog!` macros.
//!
//! Producers format a complete line and `push` it into the process-wide `Logger` under a short mutex.
//! `sync` hands the pending lines to the `AsyncLogger` writer thread which appends them to rotating files.
//! Without an installed logger lines are printed to stdout.

use crate::event_loop::EventLoop;
use crate::timer::TimerTask;
use crate::utils;
use crate::{RpcConfig, RpcError};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 1,
    Info = 2,
    Error = 3,
}

impl LogLevel {
    /// Unknown names fall back to `Debug`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "INFO" => LogLevel::Info,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Debug,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Debug as u8);
static GLOBAL_LOGGER: OnceLock<Arc<Logger>> = OnceLock::new();

/// Whether lines of `level` are currently emitted.
pub fn enabled(level: LogLevel) -> bool {
    level as u8 >= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Format and emit one line. Called by the log macros.
pub fn log_line(level: LogLevel, file: &str, line: u32, args: std::fmt::Arguments) {
    let mut buf = [0u8; 40];
    let now = utils::format_time(&mut buf, utils::now_nanos(), 6, false);
    let msg = format!(
        "[{}]\t[{}]\t[{}:{}]\t[{}:{}]\t{}\n",
        level,
        now,
        std::process::id(),
        utils::thread_id(),
        file,
        line,
        args
    );
    match GLOBAL_LOGGER.get() {
        Some(logger) => logger.push(msg),
        None => print!("{}", msg),
    }
}

/// Install the process-wide logger from config. Returns the already installed one on repeated calls.
pub fn init_global(config: &RpcConfig) -> crate::Result<Arc<Logger>> {
    if let Some(logger) = GLOBAL_LOGGER.get() {
        return Ok(Arc::clone(logger));
    }
    let logger = Arc::new(Logger::from_config(config)?);
    let logger = GLOBAL_LOGGER.get_or_init(|| logger);
    set_level(logger.level());
    Ok(Arc::clone(logger))
}

pub fn global() -> Option<Arc<Logger>> {
    GLOBAL_LOGGER.get().cloned()
}

/// Buffers formatted lines until `sync`.
pub struct Logger {
    level: LogLevel,
    sync_interval: i64,
    pending: Mutex<Vec<String>>,
    writer: AsyncLogger,
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.sync();
        self.writer.flush();
    }
}

impl Logger {
    pub fn new(level: LogLevel, sync_interval: i64, writer: AsyncLogger) -> Self {
        Self {
            level,
            sync_interval,
            pending: Mutex::new(Vec::new()),
            writer,
        }
    }

    pub fn from_config(config: &RpcConfig) -> crate::Result<Self> {
        let writer = AsyncLogger::new(
            &config.log_file_name,
            &config.log_file_path,
            config.log_max_file_size,
        )?;
        Ok(Self::new(
            LogLevel::from_name(&config.log_level),
            config.log_sync_interval,
            writer,
        ))
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn push(&self, line: String) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(line);
        }
    }

    /// Number of lines not yet handed to the writer.
    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Hand all pending lines to the writer thread.
    pub fn sync(&self) {
        let lines = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return,
        };
        if !lines.is_empty() {
            self.writer.push(lines);
        }
    }

    /// Sync then wait until the writer has written everything and exited.
    pub fn flush(&self) {
        self.sync();
        self.writer.flush();
    }

    /// Arm a repeating timer on `lp` that syncs every `log_sync_interval` ms.
    pub fn start_sync_timer(self: &Arc<Self>, lp: &EventLoop) -> Rc<TimerTask> {
        let logger = Arc::clone(self);
        let task = TimerTask::new(self.sync_interval.max(1), true, move |_| logger.sync());
        lp.schedule_timer(Rc::clone(&task));
        task
    }
}

enum LogCmd {
    Lines(Vec<String>),
    Flush(mpsc::Sender<()>),
}

/// Writer thread appending batches of lines to `<path>/<name>_<yyyymmdd>_log.<n>`.
pub struct AsyncLogger {
    sender: Mutex<Option<mpsc::Sender<LogCmd>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl AsyncLogger {
    pub fn new(file_name: &str, file_path: &str, max_file_size: u64) -> crate::Result<Self> {
        std::fs::create_dir_all(file_path)
            .map_err(|e| RpcError::Config(format!("cannot create log dir {}: {}", file_path, e)))?;
        let mut sink = RotatingFile::new(file_name, file_path, max_file_size);
        let (tx, rx) = mpsc::channel::<LogCmd>();
        let thread = std::thread::Builder::new()
            .name("AsyncLogger".to_owned())
            .spawn(move || {
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        LogCmd::Lines(lines) => sink.write_lines(&lines),
                        LogCmd::Flush(ack) => {
                            sink.flush();
                            let _ = ack.send(());
                        }
                    }
                }
                sink.flush();
            })?;
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn push(&self, lines: Vec<String>) {
        if let Ok(sender) = self.sender.lock() {
            if let Some(sender) = sender.as_ref() {
                let _ = sender.send(LogCmd::Lines(lines));
            }
        }
    }

    /// Block until all queued lines are written and flushed.
    pub fn sync_to_disk(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        let sent = match self.sender.lock() {
            Ok(sender) => sender
                .as_ref()
                .map(|s| s.send(LogCmd::Flush(ack_tx)).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        };
        if sent {
            let _ = ack_rx.recv();
        }
    }

    /// Drain the queue and stop the writer thread.
    pub fn flush(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let thread = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

impl Drop for AsyncLogger {
    fn drop(&mut self) {
        self.flush();
    }
}

struct RotatingFile {
    file_name: String,
    file_path: PathBuf,
    max_file_size: u64,
    date: String,
    no: u32,
    written: u64,
    file: Option<File>,
}

impl RotatingFile {
    fn new(file_name: &str, file_path: &str, max_file_size: u64) -> Self {
        Self {
            file_name: file_name.to_owned(),
            file_path: Path::new(file_path).to_path_buf(),
            max_file_size,
            date: String::new(),
            no: 0,
            written: 0,
            file: None,
        }
    }

    fn current_path(&self) -> PathBuf {
        self.file_path
            .join(format!("{}_{}_log.{}", self.file_name, self.date, self.no))
    }

    fn rotate_if_needed(&mut self) {
        let today = utils::format_date(utils::now_nanos());
        if today != self.date {
            self.date = today;
            self.no = 0;
            self.file = None;
        } else if self.written > self.max_file_size {
            self.no += 1;
            self.file = None;
        }
        if self.file.is_none() {
            let path = self.current_path();
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => {
                    self.written = f.metadata().map(|m| m.len()).unwrap_or(0);
                    self.file = Some(f);
                }
                Err(e) => {
                    eprintln!("failed to open log file {:?}: {}", path, e);
                }
            }
        }
    }

    fn write_lines(&mut self, lines: &[String]) {
        for line in lines {
            self.rotate_if_needed();
            match self.file.as_mut() {
                Some(f) => {
                    if f.write_all(line.as_bytes()).is_ok() {
                        self.written += line.len() as u64;
                    }
                }
                None => print!("{}", line),
            }
        }
    }

    fn flush(&mut self) {
        if let Some(f) = self.file.as_mut() {
            let _ = f.flush();
        }
    }
}

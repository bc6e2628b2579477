//! Buffered logger.
//!
//! Log records go to an in-memory ring buffer (drained over RPC) and, above
//! a separately adjustable level, to the console. Timestamps are relative to
//! daemon start.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Instant;

use log::{Log, LevelFilter};
use log_buffer::LogBuffer;

const BUFFER_SIZE: usize = 64 * 1024;

static LOGGER: OnceLock<BufferLogger> = OnceLock::new();

fn filter_to_usize(filter: LevelFilter) -> usize {
    filter as usize
}

fn filter_from_usize(value: usize) -> LevelFilter {
    match value {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub struct BufferLogger {
    buffer: Mutex<LogBuffer<Box<[u8]>>>,
    console_filter: AtomicUsize,
    buffer_filter: AtomicUsize,
    start: Instant,
}

impl BufferLogger {
    fn new() -> BufferLogger {
        BufferLogger {
            buffer: Mutex::new(LogBuffer::new(vec![0; BUFFER_SIZE].into_boxed_slice())),
            console_filter: AtomicUsize::new(filter_to_usize(LevelFilter::Info)),
            buffer_filter: AtomicUsize::new(filter_to_usize(LevelFilter::Debug)),
            start: Instant::now(),
        }
    }

    /// Installs the process-wide logger. May only be called once.
    pub fn register() {
        let logger = LOGGER.get_or_init(BufferLogger::new);
        log::set_logger(logger).expect("global logger can only be initialized once");
        log::set_max_level(LevelFilter::Debug);
    }

    pub fn get_logger() -> Option<&'static BufferLogger> {
        LOGGER.get()
    }

    pub fn buffer(&self) -> MutexGuard<LogBuffer<Box<[u8]>>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drains the ring buffer.
    pub fn extract(&self) -> String {
        let mut buffer = self.buffer();
        let contents = buffer.extract().to_string();
        buffer.clear();
        contents
    }

    pub fn console_log_level(&self) -> LevelFilter {
        filter_from_usize(self.console_filter.load(Ordering::Relaxed))
    }

    pub fn set_console_log_level(&self, max_level: LevelFilter) {
        self.console_filter
            .store(filter_to_usize(max_level), Ordering::Relaxed);
    }

    pub fn buffer_log_level(&self) -> LevelFilter {
        filter_from_usize(self.buffer_filter.load(Ordering::Relaxed))
    }

    pub fn set_buffer_log_level(&self, max_level: LevelFilter) {
        self.buffer_filter
            .store(filter_to_usize(max_level), Ordering::Relaxed);
    }
}

impl Log for BufferLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let timestamp = self.start.elapsed();
        let seconds = timestamp.as_secs();
        let micros = timestamp.subsec_micros();

        if record.level() <= self.buffer_log_level() {
            let mut buffer = self.buffer();
            let _ = writeln!(
                buffer,
                "[{:6}.{:06}s] {:>5}({}): {}",
                seconds,
                micros,
                record.level(),
                record.target(),
                record.args()
            );
        }

        if record.level() <= self.console_log_level() {
            eprintln!(
                "[{:6}.{:06}s] {:>5}({}): {}",
                seconds,
                micros,
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

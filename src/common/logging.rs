//! Logging infrastructure for pagefs

use log::{Level, LevelFilter};
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

fn level_label(level: Level, colored: bool) -> &'static str {
    match (level, colored) {
        (Level::Error, true) => "\x1b[31mERROR\x1b[0m",
        (Level::Warn, true) => "\x1b[33mWARN\x1b[0m",
        (Level::Info, true) => "\x1b[32mINFO\x1b[0m",
        (Level::Debug, true) => "\x1b[36mDEBUG\x1b[0m",
        (Level::Trace, true) => "\x1b[37mTRACE\x1b[0m",
        (Level::Error, false) => "ERROR",
        (Level::Warn, false) => "WARN",
        (Level::Info, false) => "INFO",
        (Level::Debug, false) => "DEBUG",
        (Level::Trace, false) => "TRACE",
    }
}

fn install(mut builder: env_logger::Builder, colored: bool) {
    builder.format(move |buf, record| {
        writeln!(
            buf,
            "{} [{}] {}: {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level_label(record.level(), colored),
            record.target(),
            record.args()
        )
    });
    // a host may already have installed its own logger
    let _ = builder.try_init();
}

/// Initialize the pagefs logging system
///
/// Call once at application start. `RUST_LOG` is honored; the default level
/// is `Info`.
pub fn init() {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder
            .filter_level(LevelFilter::Info)
            .parse_default_env();
        install(builder, true);
        crate::pagefs_info!("pagefs logging initialized");
    });
}

/// Initialize logging with a fixed level, ignoring `RUST_LOG`.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(level);
        install(builder, false);
        crate::pagefs_info!("pagefs logging initialized at {level:?}");
    });
}

/// Log an error message with pagefs context
#[macro_export]
macro_rules! pagefs_error {
    ($($arg:tt)*) => {
        log::error!(target: "pagefs", $($arg)*)
    };
}

/// Log a warning message with pagefs context
#[macro_export]
macro_rules! pagefs_warn {
    ($($arg:tt)*) => {
        log::warn!(target: "pagefs", $($arg)*)
    };
}

/// Log an info message with pagefs context
#[macro_export]
macro_rules! pagefs_info {
    ($($arg:tt)*) => {
        log::info!(target: "pagefs", $($arg)*)
    };
}

/// Log a debug message with pagefs context
#[macro_export]
macro_rules! pagefs_debug {
    ($($arg:tt)*) => {
        log::debug!(target: "pagefs", $($arg)*)
    };
}

/// Log a trace message with pagefs context
#[macro_export]
macro_rules! pagefs_trace {
    ($($arg:tt)*) => {
        log::trace!(target: "pagefs", $($arg)*)
    };
}

/// Timing helper for flushes and formats; bus transfers are slow, so
/// anything over the threshold is reported at warn level when dropped.
pub struct Timer {
    start: std::time::Instant,
    operation: String,
}

impl Timer {
    /// Slow-operation threshold
    pub const SLOW: std::time::Duration = std::time::Duration::from_millis(250);

    /// Start timing an operation
    pub fn start<S: Into<String>>(operation: S) -> Self {
        let operation = operation.into();
        pagefs_trace!("Starting operation: {}", operation);
        Self {
            start: std::time::Instant::now(),
            operation,
        }
    }

    /// Get elapsed time without stopping the timer
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    /// Stop the timer and log the elapsed time
    pub fn stop(self) -> std::time::Duration {
        let elapsed = self.start.elapsed();
        pagefs_debug!("Operation '{}' completed in {:?}", self.operation, elapsed);
        elapsed
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        if elapsed > Self::SLOW {
            pagefs_warn!("Slow operation '{}' took {:?}", self.operation, elapsed);
        }
    }
}

//! Logging setup and slow-event timing

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::{error, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::config::{GeneralConfig, LoggingConfig, SlowEventConfig};
use crate::errors::{Error, Result};

/// Initialize the tracing subscriber.
///
/// With a log directory configured, output goes to a daily-rolling file in
/// that directory (the returned guard must be held for the lifetime of the
/// process); otherwise everything goes to stdout.
pub fn init_tracing(
    general: &GeneralConfig,
    logging: &LoggingConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let level = parse_log_level(&general.log_level)?;
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if logging.directory.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
        return Ok(None);
    }

    let appender = tracing_appender::rolling::daily(&logging.directory, &logging.base_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Parse a log level name
pub fn parse_log_level(level: &str) -> Result<Level> {
    level
        .parse()
        .map_err(|_| Error::config_error(format!("invalid log level: {level}")))
}

#[derive(Debug, Default)]
pub struct SlowEventStats {
    pub warn_count: AtomicU64,
    pub error_count: AtomicU64,
    pub critical_count: AtomicU64,
    pub max_duration_ms: AtomicU64,
}

/// Logs when an operation exceeds the configured thresholds. Thresholds are
/// atomics so they can be adjusted at runtime.
#[derive(Debug)]
pub struct SlowEventLogger {
    warn_ms: AtomicU64,
    error_ms: AtomicU64,
    critical_ms: AtomicU64,
    stats: SlowEventStats,
}

impl SlowEventLogger {
    pub fn new(config: &SlowEventConfig) -> Self {
        Self {
            warn_ms: AtomicU64::new(config.warn_threshold_ms),
            error_ms: AtomicU64::new(config.error_threshold_ms),
            critical_ms: AtomicU64::new(config.critical_threshold_ms),
            stats: SlowEventStats::default(),
        }
    }

    pub fn set_thresholds(&self, warn_ms: u64, error_ms: u64, critical_ms: u64) {
        self.warn_ms.store(warn_ms, Ordering::Relaxed);
        self.error_ms.store(error_ms, Ordering::Relaxed);
        self.critical_ms.store(critical_ms, Ordering::Relaxed);
    }

    pub fn thresholds(&self) -> (u64, u64, u64) {
        (
            self.warn_ms.load(Ordering::Relaxed),
            self.error_ms.load(Ordering::Relaxed),
            self.critical_ms.load(Ordering::Relaxed),
        )
    }

    pub fn stats(&self) -> &SlowEventStats {
        &self.stats
    }

    /// Start timing one operation; logs on `finish` (or drop)
    pub fn timer<'a>(&'a self, operation: &'static str, context: &str) -> SlowTimer<'a> {
        SlowTimer {
            logger: self,
            operation,
            context: context.to_string(),
            start: Instant::now(),
            finished: false,
        }
    }

    fn check_and_log(&self, operation: &str, context: &str, elapsed_ms: u64) {
        let mut max = self.stats.max_duration_ms.load(Ordering::Relaxed);
        while elapsed_ms > max {
            match self.stats.max_duration_ms.compare_exchange_weak(
                max,
                elapsed_ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => max = current,
            }
        }

        if elapsed_ms >= self.critical_ms.load(Ordering::Relaxed) {
            self.stats.critical_count.fetch_add(1, Ordering::Relaxed);
            error!(operation, context, elapsed_ms, "SLOW_EVENT critical");
        } else if elapsed_ms >= self.error_ms.load(Ordering::Relaxed) {
            self.stats.error_count.fetch_add(1, Ordering::Relaxed);
            error!(operation, context, elapsed_ms, "SLOW_EVENT");
        } else if elapsed_ms >= self.warn_ms.load(Ordering::Relaxed) {
            self.stats.warn_count.fetch_add(1, Ordering::Relaxed);
            warn!(operation, context, elapsed_ms, "SLOW_EVENT");
        }
    }
}

/// RAII timer; logs once, on explicit finish or on drop
pub struct SlowTimer<'a> {
    logger: &'a SlowEventLogger,
    operation: &'static str,
    context: String,
    start: Instant,
    finished: bool,
}

impl SlowTimer<'_> {
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn finish(mut self) -> u64 {
        self.finished = true;
        let elapsed = self.elapsed_ms();
        self.logger.check_and_log(self.operation, &self.context, elapsed);
        elapsed
    }
}

impl Drop for SlowTimer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let elapsed = self.elapsed_ms();
            self.logger.check_and_log(self.operation, &self.context, elapsed);
        }
    }
}

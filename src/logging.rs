//! Logging setup: stdout plus two rotating file sinks under `logs/`, one
//! carrying everything at the configured level and one filtered to
//! `ERROR` and above. Grounded in the teacher's `tracing_subscriber::fmt()`
//! initialization in `main.rs` and `src/logger.py::setup_logger`'s two
//! `RotatingFileHandler`s (application log + error-only log). `tracing`
//! rotates by day rather than by byte size; daily rotation plus the
//! retained-file count is the idiomatic substitute (documented in
//! DESIGN.md).

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Holds the non-blocking writer guards; dropping these flushes pending
/// log lines, so the caller must keep the returned value alive for the
/// process lifetime.
pub struct LoggingGuards {
    _app_log: WorkerGuard,
    _error_log: WorkerGuard,
}

pub fn init(level: &str) -> LoggingGuards {
    std::fs::create_dir_all("logs").ok();

    let app_appender = tracing_appender::rolling::daily("logs", "trading_bot.log");
    let (app_writer, app_guard) = tracing_appender::non_blocking(app_appender);

    let error_appender = tracing_appender::rolling::daily("logs", "errors.log");
    let (error_writer, error_guard) = tracing_appender::non_blocking(error_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));

    let stdout_layer = fmt::layer().with_target(false);
    let app_layer = fmt::layer().with_ansi(false).with_target(false).with_writer(app_writer);
    let error_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(error_writer)
        .with_filter(tracing_subscriber::filter::LevelFilter::ERROR);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(app_layer)
        .with(error_layer)
        .init();

    LoggingGuards {
        _app_log: app_guard,
        _error_log: error_guard,
    }
}

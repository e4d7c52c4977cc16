//! Logging setup
//!
//! Console output always, plus an optional daily rolling file when a log
//! directory is configured. Both use the `timestamp [LEVEL] message` format.

use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{GatewaySrvError, Result};

/// Rolling file name prefix, the date is appended by the appender
const LOG_FILE_PREFIX: &str = "gatewaysrv.log";

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter: `2026-03-02T00:50:44.809123Z [INFO] Serial open`
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
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter directives: `RUST_LOG` wins, otherwise `level` applies to the
/// gateway crates and everything else logs at info
pub fn filter_directives(level: &str) -> Result<String> {
    if let Ok(env) = std::env::var("RUST_LOG") {
        if !env.trim().is_empty() {
            return Ok(env);
        }
    }
    let level = level.trim().to_ascii_lowercase();
    level
        .parse::<Level>()
        .map_err(|_| GatewaySrvError::ConfigError(format!("Invalid log level '{}'", level)))?;
    Ok(format!("info,gatewaysrv={0},rtu_gateway={0}", level))
}

/// Install the global subscriber
///
/// The returned guard flushes the file writer on drop and must live as long
/// as the service.
pub fn init_logging(level: &str, ansi: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let directives = filter_directives(level)?;
    let env_filter = EnvFilter::try_new(&directives)
        .map_err(|e| GatewaySrvError::ConfigError(format!("Invalid log filter '{}': {}", directives, e)))?;

    let console_layer = fmt::layer()
        .with_ansi(ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed();
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| GatewaySrvError::ConfigError(format!("Logging already initialized: {}", e)))?;

    Ok(guard)
}

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, Location};
use std::path::Path;
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

pub const DEFAULT_LOG_FILTER: &str = "chorus=info";

/// Keeps the non-blocking writers alive; logs stop flushing once this is dropped.
pub struct LogGuards {
    _text: WorkerGuard,
    _ndjson: WorkerGuard,
}

/// Installs the global subscriber: human-readable stderr, a daily text log and a
/// daily NDJSON trace buffer under `log_dir`, plus span traces for errors.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<LogGuards> {
    std::fs::create_dir_all(log_dir)?;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_LOG_FILTER.into(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "chorus.log");
    let (text_writer, text_guard) = tracing_appender::non_blocking(file_appender);

    let ndjson_appender = tracing_appender::rolling::daily(log_dir, "trace_buffer.json");
    let (ndjson_writer, ndjson_guard) = tracing_appender::non_blocking(ndjson_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(text_writer)
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(ndjson_writer),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    Ok(LogGuards {
        _text: text_guard,
        _ndjson: ndjson_guard,
    })
}

/// Routes panics into the log (so they land in the rolling files too) before the
/// default hook prints them.
pub fn setup_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let thread = std::thread::current();
        error!(
            target: "panic",
            message = payload_text(info.payload()),
            location = %location_field(info.location()),
            thread = thread.name().unwrap_or("<unnamed>"),
            backtrace = %Backtrace::capture(),
            "FATAL: chorus panicked"
        );
        default_hook(info);
    }));
}

fn payload_text(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

fn location_field(location: Option<&Location<'_>>) -> String {
    location
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "<unknown>".to_string())
}

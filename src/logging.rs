//! Process-wide tracing setup: console output always, plus an optional
//! daily-rolling file appender when a log directory is configured.

use std::path::Path;

use tracing_subscriber::{fmt::time::UtcTime, layer::Identity, prelude::*};

const LOG_FILE_PREFIX: &str = "world-beacon.log";

/// Installs the global subscriber. The filter comes from `level` when set,
/// otherwise the `RUST_LOG` environment variable, otherwise "info".
pub fn init(level: Option<&str>, log_dir: Option<&Path>) {
    let env_filter = if let Some(level) = level {
        tracing_subscriber::EnvFilter::new(level)
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(std::io::stdout),
    );

    if let Some(dir) = log_dir {
        if let Some(file_layer) = build_file_layer(dir, |writer| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(writer)
        }) {
            let _ = registry.with(file_layer).try_init();
            return;
        }
    }

    let _ = registry.with(Identity::new()).try_init();
}

fn build_file_layer<F, L>(dir: &Path, build_layer: F) -> Option<L>
where
    F: FnOnce(tracing_appender::non_blocking::NonBlocking) -> L,
{
    if std::fs::create_dir_all(dir).is_err() {
        eprintln!(
            "failed to create log directory '{}', continuing with stdout only",
            dir.display()
        );
        return None;
    }

    let appender = tracing_appender::rolling::RollingFileAppender::new(
        tracing_appender::rolling::Rotation::DAILY,
        dir,
        LOG_FILE_PREFIX,
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    // The guard flushes the writer on drop; it has to outlive every log call.
    let _leaked: &'static _ = Box::leak(Box::new(guard));

    Some(build_layer(non_blocking))
}

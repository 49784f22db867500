//! Unified logging setup for LoopSim services
//!
//! Console logging goes through `tracing-subscriber` with an `EnvFilter`;
//! an optional per-service daily log file is attached through a
//! non-blocking `tracing-appender` writer.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Resolve the effective filter directive.
///
/// Priority: `RUST_LOG` env > `verbose` flag (debug) > info.
fn build_filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Initialize console logging for a service.
///
/// `verbose` lowers the default level to debug (the `enable_verbose_logging`
/// runtime setting); `RUST_LOG` always wins when set.
pub fn init_console(verbose: bool) {
    tracing_subscriber::registry()
        .with(build_filter(verbose))
        .with(fmt::layer().with_target(false))
        .init();
}

/// Initialize console logging plus a daily-rolling file under `log_dir`.
///
/// File names follow `{service}.{YYYY-MM-DD}` via the appender's daily
/// rotation. The returned guard must be held for the lifetime of the
/// service, otherwise buffered log lines are lost on exit.
pub fn init_with_file(
    service_name: &str,
    log_dir: impl AsRef<Path>,
    verbose: bool,
) -> std::io::Result<WorkerGuard> {
    let dir: PathBuf = log_dir.as_ref().to_path_buf();
    std::fs::create_dir_all(&dir)?;

    let appender = tracing_appender::rolling::daily(&dir, format!("{service_name}.log"));
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(build_filter(verbose))
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_defaults_to_info() {
        // RUST_LOG may leak in from the environment of the test runner;
        // only assert when it is absent.
        if std::env::var("RUST_LOG").is_err() {
            let filter = build_filter(false);
            assert_eq!(filter.to_string(), "info");
        }
    }

    #[test]
    fn verbose_filter_is_debug() {
        if std::env::var("RUST_LOG").is_err() {
            let filter = build_filter(true);
            assert_eq!(filter.to_string(), "debug");
        }
    }
}

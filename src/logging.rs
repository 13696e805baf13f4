//! Process diagnostics via `tracing`.
//!
//! `start` and `serve` call [`init_production`]: daily-rotated JSON files
//! under the runtime `logs/` directory plus readable stderr output. The
//! one-shot subcommands call [`init_cli`]. Delivery history is not kept
//! here; it goes to the job log in [`crate::joblog`].

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Rotated files are named `filemailer.log.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "filemailer.log";

/// Used when `RUST_LOG` is unset. sqlx logs every statement at `info`.
const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn,hyper=warn";

/// Keeps the background file writer alive; dropping it flushes the file.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Filter from explicit directives, or [`DEFAULT_DIRECTIVES`] when they are
/// absent or do not parse.
pub fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

fn env_filter() -> EnvFilter {
    filter_from(std::env::var("RUST_LOG").ok().as_deref())
}

/// Install the file + stderr subscriber for the long-running modes.
///
/// # Errors
///
/// Returns an error if `logs_dir` cannot be created or a global subscriber
/// is already installed.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LoggingGuard { _guard: guard })
}

/// Stderr-only logging for `init`, `token` and `send`. A second call is a
/// no-op.
pub fn init_cli() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init();
}

//! Process-wide tracing setup

use anyhow::Context;
use chrono::NaiveDate;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_PREFIX: &str = "spectrograph.log";

/// Install the global subscriber. Filter comes from `RUST_LOG`, default `info`.
///
/// With a log directory, output also goes to a daily rolling file there and
/// files older than `keep_days` are deleted. The returned guard must be held
/// until shutdown or buffered file output is lost.
pub fn init_logging(log_dir: Option<&Path>, keep_days: i64) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer().with_target(false);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()
            .context("Installing tracing subscriber")?;
        tracing::info!("Logging to console only");
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Creating log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Installing tracing subscriber")?;

    tracing::info!("Logging to {}", log_dir.display());
    cleanup_old_logs(log_dir, keep_days);
    Ok(Some(guard))
}

fn cleanup_old_logs(log_dir: &Path, keep_days: i64) {
    let cutoff = chrono::Local::now().date_naive() - chrono::Duration::days(keep_days);

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot read log directory for cleanup: {}", e);
            return;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_expired(name, cutoff) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Deleted old log file {:?}", path),
            Err(e) => tracing::warn!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
}

/// Whether `name` is one of our rolled files (`spectrograph.log.YYYY-MM-DD`)
/// dated before `cutoff`
fn is_expired(name: &str, cutoff: NaiveDate) -> bool {
    name.strip_prefix(LOG_FILE_PREFIX)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
        .is_some_and(|date| date < cutoff)
}

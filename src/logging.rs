//! Console + file logging with daily rotation and retention cleanup.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging with both console and file output.
///
/// `log` macros used across the crate are bridged to `tracing` so both
/// layers see everything.
pub fn init_logging(
    log_dir: &Path,
    retention_days: u64,
    verbose: bool,
    level_override: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(log_dir)?;
    clean_old_logs(log_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "tablo-proxy.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer guard alive for the program lifetime.
    let _ = Box::leak(Box::new(Arc::new(guard)));

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = match level_override {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level)),
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(io::stdout)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_timer(LocalTimeTimer),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_timer(LocalTimeTimer),
        );

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to set default subscriber: {}", e))?;

    tracing_log::LogTracer::init()
        .map_err(|e| format!("Failed to initialize LogTracer: {}", e))?;

    Ok(())
}

/// Remove log files older than the retention window.
fn clean_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<()> {
    if !log_dir.exists() {
        return Ok(());
    }

    let cutoff = Local::now() - chrono::Duration::days(retention_days as i64);

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let is_ours = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.contains("tablo-proxy.log"))
            .unwrap_or(false);
        if !is_ours {
            continue;
        }

        if let Ok(metadata) = entry.metadata() {
            if let Ok(modified) = metadata.modified() {
                let modified: chrono::DateTime<Local> = modified.into();
                if modified < cutoff {
                    if let Err(e) = fs::remove_file(&path) {
                        eprintln!("Failed to remove old log file {:?}: {}", path, e);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Local-time timestamps for log lines.
#[derive(Debug, Clone, Copy)]
struct LocalTimeTimer;

impl fmt::time::FormatTime for LocalTimeTimer {
    fn format_time(&self, w: &mut fmt::format::Writer) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}

/// Map the gateway log level onto ffmpeg's `-loglevel` scale.
pub fn ffmpeg_log_level(verbose: bool, level_override: Option<&str>) -> &'static str {
    match level_override {
        Some("debug") => "debug",
        Some("warn") => "warning",
        Some("error") => "panic",
        Some("info") => "info",
        _ if verbose => "debug",
        _ => "error",
    }
}

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Local};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use crate::config;

const LOG_FILE: &str = "pangolin.log";
const RETAIN_DAYS: i64 = 3;

/// Initialize tracing for the whole process: stderr plus the shared log file
/// under ProgramData, with a dated rename rotation at startup. Every entry
/// point calls this first; failures fall back to stderr-only logging.
pub fn init() {
    let filter = EnvFilter::try_new(config::log_level())
        .unwrap_or_else(|_| EnvFilter::new("debug"));

    let log_dir = config::log_dir();
    if std::fs::create_dir_all(&log_dir).is_err() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return;
    }

    let log_path = log_dir.join(LOG_FILE);
    if let Err(err) = rotate(&log_dir, &log_path) {
        eprintln!("log rotation failed: {err}");
    }

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file).and(std::io::stderr))
                .init();
        }
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

/// Rename yesterday's (or older) log to `pangolin-YYYY-MM-DD.log` and prune
/// rotations past the retention window.
fn rotate(log_dir: &Path, log_path: &Path) -> std::io::Result<()> {
    let meta = match std::fs::metadata(log_path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    let modified: DateTime<Local> = meta.modified()?.into();
    let today = Local::now().date_naive();
    if modified.date_naive() == today {
        return Ok(());
    }

    let rotated = log_dir.join(format!(
        "pangolin-{}.log",
        modified.format("%Y-%m-%d")
    ));
    std::fs::rename(log_path, rotated)?;

    cleanup_old(log_dir, RETAIN_DAYS);
    Ok(())
}

fn cleanup_old(log_dir: &Path, days_to_keep: i64) {
    let cutoff = Local::now() - chrono::Duration::days(days_to_keep);
    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("pangolin-") || !name.ends_with(".log") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(modified) = meta.modified() else { continue };
        let modified: DateTime<Local> = modified.into();
        if modified < cutoff {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_is_noop_without_log_file() {
        let dir = tempfile::tempdir().unwrap();
        rotate(dir.path(), &dir.path().join(LOG_FILE)).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn cleanup_keeps_recent_rotations() {
        let dir = tempfile::tempdir().unwrap();
        let recent = dir.path().join("pangolin-2099-01-01.log");
        std::fs::write(&recent, b"x").unwrap();
        cleanup_old(dir.path(), RETAIN_DAYS);
        assert!(recent.exists());
    }
}

use chrono::{DateTime, Utc};
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

use crate::config::Config;

const LEVEL_ENV: &str = "FLEET_LOG_LEVEL";

/// Holds the day's log file open for the lifetime of the process.
pub struct LogGuard {
    file: Option<(PathBuf, Arc<File>)>,
}

impl LogGuard {
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|(path, _)| path.as_path())
    }
}

/// `--debug` wins, then `RUST_LOG`, then `FLEET_LOG_LEVEL`, then `info`.
fn filter_directive(debug: bool, rust_log: Option<String>, fleet_level: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    rust_log
        .or(fleet_level)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

fn log_file_name(now: DateTime<Utc>) -> String {
    format!("fleet-hub-{}.log", now.format("%Y%m%d"))
}

fn open_log_file(log_dir: &str, now: DateTime<Utc>) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(log_file_name(now));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(LogGuard {
        file: Some((path, Arc::new(file))),
    })
}

pub fn init_logging(config: &Config) -> Option<LogGuard> {
    let directive = filter_directive(
        config.debug,
        std::env::var("RUST_LOG").ok(),
        std::env::var(LEVEL_ENV).ok(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("log_filter_invalid: {directive}: {err}");
        EnvFilter::new("info")
    });
    let guard = open_log_file(&config.log_dir, Utc::now()).unwrap_or_else(|err| {
        eprintln!("log_file_error: {err}");
        LogGuard { file: None }
    });

    let (writer, ansi) = match &guard.file {
        Some((_, file)) => (BoxMakeWriter::new(io::stdout.and(file.clone())), false),
        None => (BoxMakeWriter::new(io::stdout), true),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_writer(writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::tempdir;
    use tracing_subscriber::fmt::MakeWriter;

    fn day() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, 17, 45, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn debug_flag_beats_environment_levels() {
        assert_eq!(filter_directive(true, Some("warn".into()), None), "debug");
        assert_eq!(
            filter_directive(false, Some("fleet_hub=trace".into()), Some("warn".into())),
            "fleet_hub=trace"
        );
        assert_eq!(filter_directive(false, None, Some(" warn ".into())), "warn");
        assert_eq!(filter_directive(false, Some("  ".into()), None), "info");
        assert_eq!(filter_directive(false, None, None), "info");
    }

    #[test]
    fn log_file_is_named_by_day_and_appended() {
        let dir = tempdir().expect("temp dir");
        let log_dir = dir.path().join("logs");
        let guard = open_log_file(&log_dir.to_string_lossy(), day()).expect("open log");
        let path = guard.path().expect("file configured").to_path_buf();
        assert_eq!(path, log_dir.join("fleet-hub-20260309.log"));

        let (_, file) = guard.file.as_ref().expect("file");
        let make_writer = io::sink.and(file.clone());
        make_writer.make_writer().write_all(b"first\n").expect("write");
        make_writer.make_writer().write_all(b"second\n").expect("write");

        let reopened = open_log_file(&log_dir.to_string_lossy(), day()).expect("reopen");
        let (_, file) = reopened.file.as_ref().expect("file");
        file.as_ref().write_all(b"third\n").expect("append");

        let contents = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(contents, "first\nsecond\nthird\n");
    }

    #[test]
    fn empty_log_dir_disables_file_output() {
        let guard = open_log_file("  ", day()).expect("no file");
        assert!(guard.path().is_none());
    }
}

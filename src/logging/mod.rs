//! Tracing subscriber setup for the plugin binaries.
//!
//! Stdout carries the CNI result, so logs go to a file or to stderr.

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::LogOptions;

pub const DEFAULT_LOG_LEVEL: &str = "debug";
pub const VETH_LOG_FILE: &str = "/var/log/meta-plugins/veth.log";
pub const ROUTER_LOG_FILE: &str = "/var/log/meta-plugins/router.log";

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn env_filter(level: Option<&str>) -> EnvFilter {
    let level = level.filter(|l| !l.is_empty()).unwrap_or(DEFAULT_LOG_LEVEL);
    EnvFilter::try_new(level.to_lowercase()).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
}

/// Install the global subscriber. Returns false when one is already set.
/// A file that cannot be opened is not an error: logging falls back to
/// stderr.
pub fn init(options: &LogOptions, default_file: &str) -> bool {
    let filter = env_filter(options.log_level.as_deref());
    let path = options
        .log_file
        .as_deref()
        .filter(|p| !p.is_empty())
        .unwrap_or(default_file);

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false);

    let installed = match open_log_file(Path::new(path)) {
        Ok(file) => builder.with_writer(Mutex::new(file)).try_init(),
        Err(err) => builder.with_writer(std::io::stderr).try_init().map(|()| {
            warn!(path, error = %err, "cannot open log file, logging to stderr");
        }),
    };
    match installed {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, "global subscriber already installed, keeping it");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_log_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta-plugins").join("veth.log");
        open_log_file(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_env_filter_falls_back_to_default() {
        assert_eq!(env_filter(None).to_string(), DEFAULT_LOG_LEVEL);
        assert_eq!(env_filter(Some("")).to_string(), DEFAULT_LOG_LEVEL);
        assert_eq!(env_filter(Some("INFO")).to_string(), "info");
    }

    #[test]
    fn test_second_init_keeps_first_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let options = LogOptions {
            log_level: Some("info".to_string()),
            log_file: Some(dir.path().join("router.log").to_string_lossy().into_owned()),
        };
        init(&options, ROUTER_LOG_FILE);
        assert!(!init(&options, ROUTER_LOG_FILE));
    }
}

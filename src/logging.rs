//! Logging infrastructure.
//!
//! Structured logging for worker processes:
//! - Writes to a rotating-free log file under the given directory
//! - Also prints to stdout for container log collection
//! - Configurable via the RUST_LOG environment variable

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping this guard flushes and closes the log file writer.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initializes the logging system.
///
/// Creates the log directory if needed, truncates the previous log file,
/// and sets up dual output to both file and stdout.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or the log file
/// cannot be truncated.
pub fn init_logging(log_dir: &str, log_file: &str) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;

    // Truncate any previous session's log
    let log_path = Path::new(log_dir).join(log_file);
    fs::write(&log_path, "")?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,geoscout=debug"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_creates_log_file() {
        let dir = std::env::temp_dir().join(format!("geoscout-log-test-{}", std::process::id()));
        let dir_str = dir.to_string_lossy().to_string();

        // First init in the process wins the global subscriber; this test
        // only asserts the filesystem side effects.
        let result = init_logging(&dir_str, "geoscout.log");
        assert!(dir.join("geoscout.log").exists());
        drop(result);

        let _ = fs::remove_dir_all(&dir);
    }
}

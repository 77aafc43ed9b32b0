//! Tracing subscriber setup for the `tool-bridge` binary.
//!
//! The library only emits events; installing a subscriber is the
//! application's job. Logs go either to stderr or to a rotating file in the
//! platform data directory.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "tool_bridge=info,warn";

/// Name of the log file inside [`data_dir`].
pub const LOG_FILE_NAME: &str = "tool-bridge.log";

/// Rotated copies kept next to the live log file.
const LOG_FILES_KEPT: u32 = 3;

/// Where log output should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// Append to `tool-bridge.log` in this directory after rotating.
    File(PathBuf),
}

/// Platform data directory for this application.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tool-bridge")
}

/// Install the global subscriber.
///
/// `verbose` raises the crate's own level to `debug` when `RUST_LOG` is
/// unset. Returns the log file path when logging to a file.
pub fn init_tracing(target: LogTarget, verbose: bool) -> std::io::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("tool_bridge=debug,warn")
        } else {
            EnvFilter::new(DEFAULT_FILTER)
        }
    });

    let log_path = match target {
        LogTarget::Stderr => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .init();
            None
        }
        LogTarget::File(dir) => {
            std::fs::create_dir_all(&dir)?;
            let log_path = dir.join(LOG_FILE_NAME);
            rotate_log_file(&log_path, LOG_FILES_KEPT);

            let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(FlushingWriter::new(file))
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .init();
            Some(log_path)
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== tool-bridge starting ==="
    );
    Ok(log_path)
}

/// Rotate `tool-bridge.log` → `.1` → `.2` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Gaps in the chain are skipped.
pub fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// File writer that flushes after every write so log lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        f.flush()
    }
}

impl<'a> MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_log_file_shifts_chain() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&base, "current").unwrap();
        std::fs::write(dir.path().join("tool-bridge.log.1"), "one").unwrap();
        std::fs::write(dir.path().join("tool-bridge.log.3"), "three").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |suffix: &str| {
            std::fs::read_to_string(dir.path().join(format!("tool-bridge.log.{suffix}"))).ok()
        };
        assert_eq!(read("1").as_deref(), Some("current"));
        assert_eq!(read("2").as_deref(), Some("one"));
        assert_eq!(read("3"), None);
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = OpenOptions::new().create(true).append(true).open(&path).unwrap();
        let writer = FlushingWriter::new(file);

        let mut w = writer.make_writer();
        w.write_all(b"hello\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
    }

    #[test]
    fn test_data_dir_is_app_specific() {
        assert!(data_dir().ends_with("tool-bridge"));
    }
}

//! Append-only, size-rotated log file, one per serving port.
//!
//! Logging must never be able to crash the serving path: every write failure
//! here is swallowed. Rotation keeps the current file plus at most one `.1`
//! backup. The sink is an explicit value handed to whoever needs it; there is
//! no process-wide static logger.

use crate::config::BridgeConfig;
use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub struct LogSink {
    // Single serialization point: rotation and append never interleave.
    inner: Mutex<SinkInner>,
}

struct SinkInner {
    path: PathBuf,
    max_bytes: u64,
}

impl LogSink {
    /// Create or truncate the log file for `port` under `logs_dir`.
    ///
    /// Failures (unwritable directory, permission problems) are swallowed;
    /// the sink still exists and later appends become no-ops on the same
    /// failing path.
    pub fn init(logs_dir: &Path, port: u16) -> LogSink {
        Self::init_with_max(logs_dir, port, BridgeConfig::LOG_FILE_MAX_BYTES)
    }

    /// Same as `init` with an explicit rotation threshold.
    pub fn init_with_max(logs_dir: &Path, port: u16, max_bytes: u64) -> LogSink {
        let _ = fs::create_dir_all(logs_dir);
        let path = logs_dir.join(format!("bridge_{}.log", port));
        // Fresh file per server start.
        let _ = fs::write(&path, b"");
        LogSink {
            inner: Mutex::new(SinkInner { path, max_bytes }),
        }
    }

    /// Current log file path.
    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    /// Path of the single rotated backup.
    pub fn backup_path(&self) -> PathBuf {
        let inner = self.lock();
        rotated_path(&inner.path)
    }

    /// Append one timestamped line, rotating first if the current file has
    /// grown past the threshold. Never panics, never returns an error.
    pub fn append(&self, line: &str) {
        let inner = self.lock();

        if let Ok(meta) = fs::metadata(&inner.path) {
            if meta.len() > inner.max_bytes {
                let backup = rotated_path(&inner.path);
                // A previous backup is expendable; the rename must not fail
                // because the target exists.
                let _ = fs::remove_file(&backup);
                let _ = fs::rename(&inner.path, &backup);
            }
        }

        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&inner.path)
        {
            let stamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(file, "{} {}", stamp, line);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".1");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_truncates_previous_file() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::init(dir.path(), 5210);
        sink.append("first run");
        assert!(fs::read_to_string(sink.path()).unwrap().contains("first run"));

        let sink = LogSink::init(dir.path(), 5210);
        let body = fs::read_to_string(sink.path()).unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_append_is_timestamped_line() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::init(dir.path(), 5211);
        sink.append("rpc method=health outcome=ok");

        let body = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(body.lines().count(), 1);
        assert!(body.trim().ends_with("rpc method=health outcome=ok"));
        // Leading timestamp, not the raw line.
        assert!(!body.starts_with("rpc"));
    }

    #[test]
    fn test_rotation_to_single_backup() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::init_with_max(dir.path(), 5212, 64);

        // Stay under the threshold: no backup yet.
        sink.append("short");
        assert!(!sink.backup_path().exists());

        // Push past the threshold, then write again to trigger rotation.
        sink.append(&"x".repeat(128));
        sink.append("after rotation");

        assert!(sink.backup_path().exists());
        let live = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(live.lines().count(), 1);
        assert!(live.contains("after rotation"));

        // Rotate again: the old backup is replaced, never a `.2`.
        sink.append(&"y".repeat(128));
        sink.append("second rotation");
        let backup = fs::read_to_string(sink.backup_path()).unwrap();
        assert!(backup.contains("y"));
        assert!(!dir.path().join("bridge_5212.log.2").exists());
    }

    #[test]
    fn test_write_failures_are_swallowed() {
        // Point the sink at a directory that cannot exist as a file path.
        let dir = TempDir::new().unwrap();
        let blocked = dir.path().join("blocked");
        fs::create_dir_all(blocked.join("bridge_5213.log")).unwrap();

        let sink = LogSink::init(&blocked, 5213);
        // The log path is occupied by a directory: appends must not panic.
        sink.append("goes nowhere");
    }

    #[test]
    fn test_concurrent_appends_produce_whole_lines() {
        use std::sync::Arc;
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(LogSink::init(dir.path(), 5214));

        let mut handles = Vec::new();
        for t in 0..4 {
            let sink = sink.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    sink.append(&format!("thread={} line={}", t, i));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let body = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(body.lines().count(), 200);
        for line in body.lines() {
            assert!(line.contains("thread="));
        }
    }
}

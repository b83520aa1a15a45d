//! Port negotiation via OS-level lock records plus a real bind check.
//!
//! The lock file is the serialization point across *process* boundaries:
//! exclusivity comes from `flock`/`LockFileEx` semantics (via `fs2`), which
//! evaporate when the holder dies. Because a crashed owner can leave its
//! record behind, a successful lock is never trusted on its own - the port
//! must also prove bindable on loopback before it is claimed.

use crate::config::PortConfig;
use crate::error::{BridgeError, Result};
use crate::platform::is_process_alive;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Persisted contents of one lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub port: u16,
    /// Process identity of the controller that requested the server; stop
    /// requests are authorized against this.
    pub owner_pid: u32,
    /// The serving process itself.
    pub server_pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// A successfully negotiated port.
///
/// Holds the locked file handle open for the lifetime of the serving
/// process; dropping the claim unlocks and removes the record.
#[derive(Debug)]
pub struct PortClaim {
    port: u16,
    path: PathBuf,
    file: Option<File>,
}

impl PortClaim {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Explicit release; equivalent to dropping the claim.
    pub fn release(self) {}
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        // Unlock before unlinking so the rename/delete works on Windows too.
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
        let _ = fs::remove_file(&self.path);
        debug!("Released port claim {}", self.port);
    }
}

/// Negotiates a free, lockable port out of the preferred-then-fallback list.
pub struct PortLocker {
    locks_dir: PathBuf,
    range: RangeInclusive<u16>,
}

impl PortLocker {
    pub fn new(locks_dir: impl Into<PathBuf>) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            range: PortConfig::fallback_range(),
        }
    }

    /// Locker with a non-default fallback range (tests, embedded hosts).
    pub fn with_range(locks_dir: impl Into<PathBuf>, range: RangeInclusive<u16>) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            range,
        }
    }

    pub fn locks_dir(&self) -> &Path {
        &self.locks_dir
    }

    /// Find and claim a port: the preferred one first (if positive), then
    /// the fallback range in ascending order. Fails with `Unavailable` only
    /// once every candidate has been tried.
    pub fn acquire_available_port(&self, preferred: u16, owner_pid: u32) -> Result<PortClaim> {
        fs::create_dir_all(&self.locks_dir)
            .map_err(|e| BridgeError::io_with_path(e, &self.locks_dir))?;

        for port in self.candidates(preferred) {
            if let Some(claim) = self.try_claim(port, owner_pid) {
                debug!("Claimed port {} (lock {})", port, claim.path.display());
                return Ok(claim);
            }
        }

        Err(BridgeError::Unavailable {
            preferred,
            start: *self.range.start(),
            end: *self.range.end(),
        })
    }

    /// Ordered candidate list: preferred first, then the fallback range
    /// minus duplicates.
    fn candidates(&self, preferred: u16) -> Vec<u16> {
        let mut candidates = Vec::with_capacity(self.range.clone().count() + 1);
        if preferred > 0 {
            candidates.push(preferred);
        }
        for port in self.range.clone() {
            if !candidates.contains(&port) {
                candidates.push(port);
            }
        }
        candidates
    }

    /// One candidate attempt: lock record, then bind check, then persist.
    /// Any failure means "skip this candidate", never an abort.
    fn try_claim(&self, port: u16, owner_pid: u32) -> Option<PortClaim> {
        let path = self.lock_path(port);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) => {
                warn!("Cannot open lock record {}: {}", path.display(), e);
                return None;
            }
        };

        // A live process holds this record; the candidate is taken.
        if file.try_lock_exclusive().is_err() {
            return None;
        }

        // The lock succeeded, but a crashed owner may have left it behind
        // while something else grabbed the port out-of-band. The bind check
        // is authoritative: a held lock with an unbindable port is the
        // previous owner's bug, not evidence of a live server.
        if !port_bindable(port) {
            let _ = FileExt::unlock(&file);
            drop(file);
            let _ = fs::remove_file(&path);
            return None;
        }

        let record = LockRecord {
            port,
            owner_pid,
            server_pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        if write_record(&file, &record).is_err() {
            warn!("Cannot persist lock record {}", path.display());
            let _ = FileExt::unlock(&file);
            drop(file);
            let _ = fs::remove_file(&path);
            return None;
        }

        Some(PortClaim {
            port,
            path,
            file: Some(file),
        })
    }

    /// Parse the record for `port` without taking the lock. Returns `None`
    /// for a missing or unreadable record.
    pub fn read_lock_record(&self, port: u16) -> Option<LockRecord> {
        let raw = fs::read_to_string(self.lock_path(port)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Parse every readable record in the locks directory, ascending by port.
    pub fn lock_records(&self) -> Vec<LockRecord> {
        let Ok(entries) = fs::read_dir(&self.locks_dir) else {
            return Vec::new();
        };
        let mut records: Vec<LockRecord> = entries
            .flatten()
            .filter_map(|entry| {
                let raw = fs::read_to_string(entry.path()).ok()?;
                serde_json::from_str(&raw).ok()
            })
            .collect();
        records.sort_by_key(|r| r.port);
        records
    }

    /// Remove the record for `port` regardless of who wrote it. Used by the
    /// lifecycle manager after the recorded server has been stopped; a claim
    /// held by this process releases itself on drop instead.
    pub fn release(&self, port: u16) {
        let _ = fs::remove_file(self.lock_path(port));
    }

    /// Sweep the locks directory, deleting records whose server process no
    /// longer exists (and records too corrupt to parse). Returns the number
    /// of records removed.
    pub fn cleanup_stale_locks(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.locks_dir) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("server_") || !name.ends_with(".lock") {
                continue;
            }

            let stale = match fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<LockRecord>(&raw).ok())
            {
                Some(record) => !is_process_alive(record.server_pid),
                None => true,
            };

            if stale && fs::remove_file(&path).is_ok() {
                debug!("Removed stale lock record {}", path.display());
                removed += 1;
            }
        }
        removed
    }

    fn lock_path(&self, port: u16) -> PathBuf {
        self.locks_dir.join(format!("server_{}.lock", port))
    }
}

/// Open and immediately close a loopback listener; short and bounded.
fn port_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

fn write_record(mut file: &File, record: &LockRecord) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    let body = serde_json::to_string_pretty(record)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    file.write_all(body.as_bytes())?;
    file.flush()
}

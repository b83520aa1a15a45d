//! Centralized configuration for the Maquette bridge.
//!
//! Compile-time constants live in const-holder structs; the per-process knobs
//! (preferred port, directory overrides) come from an optional JSON settings
//! file whose absence always means "use defaults".

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application-level configuration.
pub struct BridgeConfig;

impl BridgeConfig {
    pub const APP_NAME: &'static str = "maquette";
    pub const LOG_FILE_MAX_BYTES: u64 = 1_000_000;
    pub const LOCKS_DIR_NAME: &'static str = "locks";
    pub const LOGS_DIR_NAME: &'static str = "logs";

    /// Per-request parameter a caller must set to `true` before any
    /// write-kind command is allowed to execute.
    pub const SMOKE_PARAM: &'static str = "__smoke_ok";
    /// The self-test method that bypasses the smoke gate so the gate
    /// itself can be satisfied.
    pub const SMOKE_METHOD: &'static str = "smoke_test";

    // Network bounds for lifecycle operations
    pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
    pub const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_millis(300);
    pub const SERVER_START_TIMEOUT: Duration = Duration::from_secs(10);
    pub const STOP_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const TERMINATE_TIMEOUT_MS: u64 = 2_000;
}

/// Port negotiation configuration.
///
/// The fallback range is a compile-time constant on purpose: every bridge on
/// a machine must negotiate over the same range or the lock protocol cannot
/// guarantee a single owner per port. Only the *preferred* port is a settings
/// surface.
pub struct PortConfig;

impl PortConfig {
    pub const BASE_PORT: u16 = 5210;
    pub const RANGE_WIDTH: u16 = 10;

    pub fn fallback_range() -> std::ops::RangeInclusive<u16> {
        Self::BASE_PORT..=Self::BASE_PORT + Self::RANGE_WIDTH - 1
    }
}

/// Per-process settings loaded from an optional JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Port tried first by the locker; fallback range applies after it.
    pub preferred_port: u16,
    /// Override for the lock-record directory (tests, portable installs).
    pub locks_dir: Option<PathBuf>,
    /// Override for the per-port log directory.
    pub logs_dir: Option<PathBuf>,
    /// Path to the server binary the lifecycle manager spawns; defaults to
    /// `maquette-rpc` next to the current executable.
    pub server_binary: Option<PathBuf>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            preferred_port: PortConfig::BASE_PORT,
            locks_dir: None,
            logs_dir: None,
            server_binary: None,
        }
    }
}

impl BridgeSettings {
    /// Load settings from `path`.
    ///
    /// A missing file is the normal case and yields defaults. A malformed
    /// file is logged and also yields defaults - settings are never fatal,
    /// unlike the command registry.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&raw) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(
                    "Ignoring malformed settings file {}: {}",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Root data directory for bridge state (locks, logs).
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(BridgeConfig::APP_NAME)
    }

    /// Directory holding per-port lock records.
    pub fn locks_dir(&self) -> PathBuf {
        self.locks_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join(BridgeConfig::LOCKS_DIR_NAME))
    }

    /// Directory holding per-port log files.
    pub fn logs_dir(&self) -> PathBuf {
        self.logs_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join(BridgeConfig::LOGS_DIR_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fallback_range_shape() {
        let range = PortConfig::fallback_range();
        assert_eq!(*range.start(), 5210);
        assert_eq!(*range.end(), 5219);
        assert_eq!(range.count(), 10);
    }

    #[test]
    fn test_settings_default_when_missing() {
        let temp_dir = TempDir::new().unwrap();
        let settings = BridgeSettings::load(&temp_dir.path().join("settings.json"));
        assert_eq!(settings.preferred_port, PortConfig::BASE_PORT);
        assert!(settings.locks_dir.is_none());
    }

    #[test]
    fn test_settings_default_when_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let settings = BridgeSettings::load(&path);
        assert_eq!(settings.preferred_port, PortConfig::BASE_PORT);
    }

    #[test]
    fn test_settings_parse() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"preferred_port": 5215, "locks_dir": "/tmp/maquette-locks"}"#,
        )
        .unwrap();
        let settings = BridgeSettings::load(&path);
        assert_eq!(settings.preferred_port, 5215);
        assert_eq!(
            settings.locks_dir(),
            PathBuf::from("/tmp/maquette-locks")
        );
    }

    #[test]
    fn test_timeouts_are_bounded() {
        // The cooperative shutdown ping must stay in the hundreds of
        // milliseconds so stop_by_lock never hangs on a dead peer.
        assert!(BridgeConfig::SHUTDOWN_REQUEST_TIMEOUT < Duration::from_secs(1));
        assert!(BridgeConfig::HEALTH_PROBE_TIMEOUT < Duration::from_secs(1));
    }
}

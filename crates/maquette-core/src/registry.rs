//! Declarative command metadata, loaded once per process.
//!
//! The registry file is a JSON map of command name to `{kind, category}`.
//! It is the source of truth for risk classification at dispatch time, so a
//! missing or malformed file is a fatal configuration error - the bridge
//! must not start with an empty registry and silently treat every command
//! as ungated.

use crate::command::CommandKind;
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Metadata declared for one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMeta {
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Point-in-time command metadata table, keyed by lowercased name.
#[derive(Debug)]
pub struct CommandRegistry {
    entries: HashMap<String, CommandMeta>,
}

// Process-wide cache: loaded once, read by many. Concurrent cold loads queue
// behind this mutex so nobody ever observes a partially populated table.
static CACHE: Mutex<Option<(PathBuf, Arc<CommandRegistry>)>> = Mutex::new(None);

impl CommandRegistry {
    /// Load the registry from `path`, caching the result for the process
    /// lifetime. Repeated calls with the same path return the cached table
    /// without touching storage; a different path forces a reload.
    pub fn load(path: &Path) -> Result<Arc<CommandRegistry>> {
        let mut cache = CACHE.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached_path, registry)) = cache.as_ref() {
            if cached_path == path {
                return Ok(registry.clone());
            }
        }

        let registry = Arc::new(Self::load_uncached(path)?);
        *cache = Some((path.to_path_buf(), registry.clone()));
        Ok(registry)
    }

    /// Drop the cached table so the next `load` re-reads storage.
    pub fn invalidate() {
        let mut cache = CACHE.lock().unwrap_or_else(PoisonError::into_inner);
        *cache = None;
    }

    /// Read and parse the registry file without consulting the cache.
    pub fn load_uncached(path: &Path) -> Result<CommandRegistry> {
        let raw = std::fs::read_to_string(path).map_err(|e| BridgeError::Fatal {
            message: format!("Cannot read command registry {}: {}", path.display(), e),
        })?;

        let parsed: HashMap<String, CommandMeta> =
            serde_json::from_str(&raw).map_err(|e| BridgeError::Fatal {
                message: format!("Malformed command registry {}: {}", path.display(), e),
            })?;

        // Keys are folded to lowercase; duplicates differing only in case
        // collapse with last write wins, same as router re-registration.
        let mut entries = HashMap::with_capacity(parsed.len());
        for (name, meta) in parsed {
            entries.insert(name.to_lowercase(), meta);
        }

        Ok(CommandRegistry { entries })
    }

    /// Case-insensitive metadata lookup.
    pub fn get(&self, name: &str) -> Option<&CommandMeta> {
        self.entries.get(&name.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted command names, for enumeration surfaces.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a registry directly from entries (tests, embedded hosts).
    pub fn from_entries(entries: HashMap<String, CommandMeta>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(name, meta)| (name.to_lowercase(), meta))
            .collect();
        Self { entries }
    }
}

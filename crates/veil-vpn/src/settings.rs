//! User Settings
//!
//! Persisted user configuration: chosen transport, custom bridges, node
//! restrictions, advanced tor lines and the relay's session counter.
//!
//! # Invariant
//!
//! Choosing a transport explicitly turns Smart Connect off. `transport`
//! is private, so every write goes through [`Settings::set_transport`].

use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// User configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    transport: Transport,
    /// Bridge lines used with [`Transport::Custom`]
    pub custom_bridges: Vec<String>,
    /// Only route onion-service traffic
    pub onion_only: bool,
    /// Local port excluded from the tunnel
    pub bypass_port: Option<u16>,
    pub entry_nodes: Option<String>,
    pub exit_nodes: Option<String>,
    pub exclude_nodes: Option<String>,
    pub strict_nodes: bool,
    /// Raw `Key value` lines appended to the tor configuration
    pub advanced_config: Vec<String>,
    smart_connect: bool,
    /// Sessions relayed by the volunteer proxy
    pub sessions_helped: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transport: Transport::None,
            custom_bridges: Vec::new(),
            onion_only: false,
            bypass_port: None,
            entry_nodes: None,
            exit_nodes: None,
            exclude_nodes: None,
            strict_nodes: false,
            advanced_config: Vec::new(),
            smart_connect: true,
            sessions_helped: 0,
        }
    }
}

impl Settings {
    /// Selected transport
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Pick a transport automatically
    pub fn smart_connect(&self) -> bool {
        self.smart_connect
    }

    /// Select a transport; this always disables Smart Connect
    pub fn set_transport(&mut self, transport: Transport) {
        self.transport = transport;
        self.smart_connect = false;
    }

    pub fn set_smart_connect(&mut self, enabled: bool) {
        self.smart_connect = enabled;
    }

    /// Parse TOML
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(|e| SettingsError::Serialize(e.to_string()))
    }
}

/// Shared, optionally file-backed settings
///
/// Reads are cheap snapshots. A write changes memory and serializes under
/// the lock, then saves the file after releasing it, so readers never wait
/// on the disk. Each change gets a revision and an older revision never
/// overwrites a newer file.
pub struct SettingsStore {
    settings: RwLock<Revised>,
    path: Option<PathBuf>,
    /// Revision currently on disk
    saved: Mutex<u64>,
}

struct Revised {
    settings: Settings,
    revision: u64,
}

/// Serialized settings waiting to be saved
struct Pending {
    content: String,
    revision: u64,
}

impl SettingsStore {
    /// Store that never touches the disk
    pub fn in_memory(settings: Settings) -> Self {
        Self::with_path(settings, None)
    }

    fn with_path(settings: Settings, path: Option<PathBuf>) -> Self {
        Self {
            settings: RwLock::new(Revised {
                settings,
                revision: 0,
            }),
            path,
            saved: Mutex::new(0),
        }
    }

    /// Load from `path`, starting from defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let settings = match std::fs::read_to_string(path) {
            Ok(content) => Settings::from_toml(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings at {}, using defaults", path.display());
                Settings::default()
            }
            Err(e) => return Err(SettingsError::Io(e)),
        };

        Ok(Self::with_path(settings, Some(path.to_path_buf())))
    }

    /// Copy of the current settings
    pub fn snapshot(&self) -> Settings {
        self.read().settings.clone()
    }

    pub fn transport(&self) -> Transport {
        self.read().settings.transport()
    }

    pub fn smart_connect(&self) -> bool {
        self.read().settings.smart_connect()
    }

    pub fn sessions_helped(&self) -> u64 {
        self.read().settings.sessions_helped
    }

    /// Select a transport (clears Smart Connect) and persist
    pub fn set_transport(&self, transport: Transport) -> Result<(), SettingsError> {
        self.update(|s| s.set_transport(transport))
    }

    pub fn set_smart_connect(&self, enabled: bool) -> Result<(), SettingsError> {
        self.update(|s| s.set_smart_connect(enabled))
    }

    pub fn set_custom_bridges(&self, bridges: Vec<String>) -> Result<(), SettingsError> {
        self.update(|s| s.custom_bridges = bridges)
    }

    /// Count one relayed session and return the new total
    pub fn increment_sessions_helped(&self) -> Result<u64, SettingsError> {
        let mut total = 0;
        self.update(|s| {
            s.sessions_helped += 1;
            total = s.sessions_helped;
        })?;
        Ok(total)
    }

    /// Apply an arbitrary change and persist
    pub fn update<F>(&self, change: F) -> Result<(), SettingsError>
    where
        F: FnOnce(&mut Settings),
    {
        let pending = {
            let mut current = self.write();
            change(&mut current.settings);
            current.revision += 1;

            match &self.path {
                Some(_) => Some(Pending {
                    content: current.settings.to_toml()?,
                    revision: current.revision,
                }),
                None => None,
            }
        };

        match pending {
            Some(pending) => self.persist(pending),
            None => Ok(()),
        }
    }

    /// Write through a sibling file and rename it into place
    fn persist(&self, pending: Pending) -> Result<(), SettingsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut saved = self.saved.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *saved >= pending.revision {
            debug!(revision = pending.revision, "Skipping stale settings write");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let staging = path.with_extension("toml.tmp");
        std::fs::write(&staging, pending.content)?;
        std::fs::rename(&staging, path)?;

        *saved = pending.revision;
        debug!("Settings saved to {}", path.display());
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Revised> {
        self.settings.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Revised> {
        self.settings.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::in_memory(Settings::default())
    }
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Settings I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings file: {0}")]
    Parse(String),

    #[error("Settings could not be serialized: {0}")]
    Serialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_transport_clears_smart_connect() {
        let store = SettingsStore::default();
        assert!(store.smart_connect());

        store.set_transport(Transport::Obfs4).unwrap();

        assert_eq!(store.transport(), Transport::Obfs4);
        assert!(!store.smart_connect());
    }

    #[test]
    fn test_rewriting_same_transport_still_clears() {
        let store = SettingsStore::default();
        store.set_transport(Transport::Snowflake).unwrap();
        store.set_smart_connect(true).unwrap();

        store.set_transport(Transport::Snowflake).unwrap();
        assert!(!store.smart_connect());
    }

    #[test]
    fn test_update_cannot_keep_smart_connect_with_transport() {
        let store = SettingsStore::default();

        store.update(|s| s.set_transport(Transport::MeekAzure)).unwrap();

        assert_eq!(store.transport(), Transport::MeekAzure);
        assert!(!store.smart_connect());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut settings = Settings::default();
        settings.set_transport(Transport::Custom);
        settings.custom_bridges = vec!["obfs4 1.2.3.4:443 AAAA cert=x iat-mode=0".into()];
        settings.exclude_nodes = Some("{ru},{by}".into());
        settings.strict_nodes = true;

        let parsed = Settings::from_toml(&settings.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(&dir.path().join("settings.toml")).unwrap();

        assert_eq!(store.snapshot(), Settings::default());
    }

    #[test]
    fn test_counter_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let store = SettingsStore::load(&path).unwrap();
        assert_eq!(store.increment_sessions_helped().unwrap(), 1);
        assert_eq!(store.increment_sessions_helped().unwrap(), 2);

        let reloaded = SettingsStore::load(&path).unwrap();
        assert_eq!(reloaded.sessions_helped(), 2);
    }

    #[test]
    fn test_readers_do_not_wait_for_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SettingsStore::load(&dir.path().join("settings.toml")).unwrap());

        // Holding the file side stalls the writer after its in-memory change
        let saved = store.saved.lock().unwrap();
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.update(|s| s.onion_only = true))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while !store.snapshot().onion_only {
            assert!(Instant::now() < deadline, "change never became visible");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(store.sessions_helped(), 0);

        drop(saved);
        writer.join().unwrap().unwrap();

        let reloaded = SettingsStore::load(&dir.path().join("settings.toml")).unwrap();
        assert!(reloaded.snapshot().onion_only);
    }

    #[test]
    fn test_concurrent_writes_keep_latest_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let store = Arc::new(SettingsStore::load(&path).unwrap());

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        store.increment_sessions_helped().unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(store.sessions_helped(), 80);
        assert_eq!(SettingsStore::load(&path).unwrap().sessions_helped(), 80);
        assert!(!path.with_extension("toml.tmp").exists());
    }
}

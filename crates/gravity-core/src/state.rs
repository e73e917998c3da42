// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State store.
//!
//! Persists the registered config sources and the topology recorded by the
//! last successful reconciliation. All access goes through a [`StateGuard`],
//! which holds an exclusive advisory lock on the state directory for its
//! lifetime. Writes replace the state file atomically.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::topology::{Instance, ServiceKind, ServiceType, Topology};

/// Current on-disk format version.
pub const STATE_VERSION: u32 = 1;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stored view of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Reload semantics
    pub kind: ServiceKind,
    /// What program runs
    pub service_type: ServiceType,
    /// Fingerprint of the command template
    pub fingerprint: String,
    /// Pool membership
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
}

/// Stored view of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Sources that contributed to the instance
    pub sources: BTreeSet<PathBuf>,
    /// Services by name
    pub services: BTreeMap<String, ServiceRecord>,
}

impl From<&Instance> for InstanceRecord {
    fn from(instance: &Instance) -> Self {
        Self {
            sources: instance.sources.clone(),
            services: instance
                .services
                .iter()
                .map(|(name, service)| {
                    (
                        name.clone(),
                        ServiceRecord {
                            kind: service.kind,
                            service_type: service.service_type,
                            fingerprint: service.fingerprint.clone(),
                            pool: service.pool.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

/// A registered config source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Instance the source contributes to
    pub instance_name: String,
    /// Fingerprint of the file at the last successful read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Root given at registration, for files that do not name one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub galaxy_root: Option<PathBuf>,
    /// When the source was registered
    pub registered_at: DateTime<Utc>,
    /// When the source was last read successfully
    pub updated_at: DateTime<Utc>,
}

/// Snapshot persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTopology {
    /// Format version
    pub version: u32,
    /// Registered sources by absolute path
    #[serde(default)]
    pub sources: BTreeMap<PathBuf, SourceRecord>,
    /// Instances as of the last reconciliation
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceRecord>,
}

impl Default for StoredTopology {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            sources: BTreeMap::new(),
            instances: BTreeMap::new(),
        }
    }
}

impl StoredTopology {
    /// Record every instance of a topology, replacing what was stored.
    pub fn record_topology(&mut self, topology: &Topology) {
        self.instances = topology
            .instances
            .values()
            .map(|i| (i.name.clone(), InstanceRecord::from(i)))
            .collect();
    }

    /// Registered sources that resolve to `instance`.
    pub fn sources_referencing(&self, instance: &str) -> Vec<PathBuf> {
        self.sources
            .iter()
            .filter(|(_, record)| record.instance_name == instance)
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Names of every known instance, registered or awaiting teardown.
    pub fn instance_names(&self) -> BTreeSet<String> {
        self.instances
            .keys()
            .cloned()
            .chain(self.sources.values().map(|r| r.instance_name.clone()))
            .collect()
    }

    /// Whether the given path is registered.
    pub fn is_registered(&self, path: &Path) -> bool {
        self.sources.contains_key(path)
    }
}

/// Handle on the state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_file: PathBuf,
    lock_file: PathBuf,
    lock_timeout: Duration,
}

impl StateStore {
    /// Create a store for the configured state directory.
    pub fn new(config: &Config) -> Self {
        let state_file = config.state_file();
        Self {
            lock_file: state_file.with_extension("json.lock"),
            state_file,
            lock_timeout: config.lock_timeout,
        }
    }

    /// Path of the state file.
    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Acquire the exclusive lock, waiting at most the configured timeout.
    pub async fn lock(&self) -> Result<StateGuard> {
        if let Some(dir) = self.state_file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)?;

        let started = Instant::now();
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => {
                    debug!(lock = %self.lock_file.display(), "Acquired state lock");
                    return Ok(StateGuard {
                        _lock: lock,
                        state_file: self.state_file.clone(),
                    });
                }
                Err((returned, errno)) if errno == Errno::EWOULDBLOCK => {
                    if started.elapsed() >= self.lock_timeout {
                        return Err(Error::LockContention {
                            path: self.lock_file.clone(),
                            waited: started.elapsed(),
                        });
                    }
                    file = returned;
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err((_, errno)) => return Err(Error::Io(errno.into())),
            }
        }
    }
}

/// Exclusive access to the state file; the lock is released on drop.
#[derive(Debug)]
pub struct StateGuard {
    _lock: Flock<File>,
    state_file: PathBuf,
}

impl StateGuard {
    /// Load the stored state; a missing file is an empty state.
    pub fn load(&self) -> Result<StoredTopology> {
        let text = match std::fs::read_to_string(&self.state_file) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoredTopology::default());
            }
            Err(e) => return Err(e.into()),
        };
        let state: StoredTopology =
            serde_json::from_str(&text).map_err(|e| Error::StateCorrupt {
                path: self.state_file.clone(),
                reason: e.to_string(),
            })?;
        if state.version > STATE_VERSION {
            return Err(Error::StateCorrupt {
                path: self.state_file.clone(),
                reason: format!("unsupported state version {}", state.version),
            });
        }
        Ok(state)
    }

    /// Atomically replace the stored state.
    pub fn save(&self, state: &StoredTopology) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.state_file.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.state_file)?;
        debug!(path = %self.state_file.display(), "Saved state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir, timeout: Duration) -> StateStore {
        let mut config = Config::with_state_dir(dir.path());
        config.lock_timeout = timeout;
        StateStore::new(&config)
    }

    #[tokio::test]
    async fn test_missing_state_is_empty() {
        let dir = TempDir::new().unwrap();
        let guard = store(&dir, Duration::from_secs(1)).lock().await.unwrap();
        assert_eq!(guard.load().unwrap(), StoredTopology::default());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, Duration::from_secs(1));
        let mut state = StoredTopology::default();
        let now = Utc::now();
        state.sources.insert(
            PathBuf::from("/srv/galaxy.yml"),
            SourceRecord {
                instance_name: "main".to_string(),
                fingerprint: Some("abc".to_string()),
                galaxy_root: Some(PathBuf::from("/srv/galaxy")),
                registered_at: now,
                updated_at: now,
            },
        );
        state.instances.insert(
            "main".to_string(),
            InstanceRecord {
                sources: [PathBuf::from("/srv/galaxy.yml")].into(),
                services: [(
                    "gunicorn".to_string(),
                    ServiceRecord {
                        kind: ServiceKind::SignalReloadableGateway,
                        service_type: ServiceType::Gunicorn,
                        fingerprint: "123".to_string(),
                        pool: None,
                    },
                )]
                .into(),
            },
        );

        {
            let guard = store.lock().await.unwrap();
            guard.save(&state).unwrap();
        }
        let guard = store.lock().await.unwrap();
        assert_eq!(guard.load().unwrap(), state);
        assert_eq!(
            state.sources_referencing("main"),
            vec![PathBuf::from("/srv/galaxy.yml")]
        );
    }

    #[tokio::test]
    async fn test_lock_contention_fails_fast() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, Duration::from_millis(200));
        let _held = store.lock().await.unwrap();

        let started = Instant::now();
        let err = store.lock().await.unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_corrupt_state() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, Duration::from_secs(1));
        std::fs::write(store.state_file(), "{not json").unwrap();
        let guard = store.lock().await.unwrap();
        assert!(matches!(guard.load(), Err(Error::StateCorrupt { .. })));
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for gravity-core integration tests.
//!
//! Provides TestContext with a temporary state directory, config file
//! helpers and a manager wired to the in-memory gateway and probe.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gravity_core::backoff::BackoffPolicy;
use gravity_core::gateway::{GatewayCall, MockGateway};
use gravity_core::probe::MockProbe;
use gravity_core::state::{StateStore, StoredTopology};
use gravity_core::{AddMemberPolicy, Config, ProcessManager};

/// Test context owning a temp directory, a mock gateway and a manager.
pub struct TestContext {
    pub config: Config,
    pub gateway: Arc<MockGateway>,
    pub probe: Arc<MockProbe>,
    pub manager: ProcessManager,
    pub root: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Create a context with the default add-member policy.
    pub fn new() -> Self {
        Self::with_policy(AddMemberPolicy::Restart)
    }

    /// Create a context with the given add-member policy.
    pub fn with_policy(policy: AddMemberPolicy) -> Self {
        Self::with_config(|config| config.add_member_policy = policy)
    }

    /// Create a context, adjusting the test configuration with `tweak`.
    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().join("galaxy");
        std::fs::create_dir_all(root.join("config")).expect("Failed to create config dir");

        let mut config = Config::with_state_dir(temp_dir.path().join("state"));
        config.lock_timeout = Duration::from_millis(300);
        config.member_ready_timeout = Duration::from_millis(300);
        tweak(&mut config);

        let gateway = Arc::new(MockGateway::new());
        let probe = Arc::new(MockProbe::new());
        let manager = ProcessManager::with_gateway(config.clone(), gateway.clone(), probe.clone())
            .with_backoff(BackoffPolicy {
                first: Duration::from_millis(10),
                max: Duration::from_millis(40),
                factor: 2.0,
            });

        Self {
            config,
            gateway,
            probe,
            manager,
            root,
            _temp_dir: temp_dir,
        }
    }

    /// Write a config file under the Galaxy root's `config` directory.
    ///
    /// `lines` are placed inside the `galaxy` section, after `galaxy_root`.
    pub fn write_config(&self, name: &str, lines: &[&str]) -> PathBuf {
        let mut body = format!("galaxy:\n  galaxy_root: {}\n", self.root.display());
        for line in lines {
            body.push_str("  ");
            body.push_str(line);
            body.push('\n');
        }
        let path = self.root.join("config").join(name);
        std::fs::write(&path, body).expect("Failed to write config");
        path
    }

    /// Write a config file that names no Galaxy root, outside the root.
    pub fn write_rootless_config(&self, name: &str, lines: &[&str]) -> PathBuf {
        let dir = self._temp_dir.path().join("etc");
        std::fs::create_dir_all(&dir).expect("Failed to create config dir");
        let mut body = String::from("galaxy:\n");
        for line in lines {
            body.push_str("  ");
            body.push_str(line);
            body.push('\n');
        }
        let path = dir.join(name);
        std::fs::write(&path, body).expect("Failed to write config");
        path
    }

    /// Write a job configuration declaring the given handler ids.
    pub fn write_job_conf(&self, name: &str, handlers: &[&str]) -> PathBuf {
        let mut body = String::from("<?xml version=\"1.0\"?>\n<job_conf>\n  <handlers>\n");
        for id in handlers {
            body.push_str(&format!("    <handler id=\"{}\"/>\n", id));
        }
        body.push_str("  </handlers>\n</job_conf>\n");
        let path = self.root.join("config").join(name);
        std::fs::write(&path, body).expect("Failed to write job conf");
        path
    }

    /// Load the persisted state.
    pub async fn stored(&self) -> StoredTopology {
        StateStore::new(&self.config)
            .lock()
            .await
            .expect("Failed to lock state")
            .load()
            .expect("Failed to load state")
    }

    /// Recorded gateway commands matching `pred`.
    pub async fn count_commands(&self, pred: impl Fn(&GatewayCall) -> bool) -> usize {
        self.gateway
            .commands()
            .await
            .iter()
            .filter(|c| pred(c))
            .count()
    }
}

/// Owned instance-name filter from string literals.
pub fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process manager - the public operation surface.
//!
//! Every operation takes the exclusive state lock for its whole duration,
//! loads the stored state, and writes it back atomically when it changed.
//! Registry operations (`remove_source`, `rename_source`, listings) never
//! talk to the supervisor. `add_source`, `update` and the lifecycle
//! operations run a full reconciliation pass first.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::gateway::{SupervisorGateway, SupervisorctlGateway};
use crate::probe::{GatewayProbe, LivenessProbe};
use crate::reconcile::{Action, ActionOutcome, ActionReport, Reconciler, RunSummary};
use crate::source::{ConfigSource, absolute_path};
use crate::state::{InstanceRecord, ServiceRecord, SourceRecord, StateStore, StoredTopology};
use crate::topology::{self, BuildDefaults};

/// A registered source as shown by `list-sources`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceListing {
    /// Absolute path
    pub path: PathBuf,
    /// Registration record
    pub record: SourceRecord,
}

/// An instance as shown by `list-instances`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceListing {
    /// Instance name
    pub name: String,
    /// Registered sources resolving to this instance
    pub sources: Vec<PathBuf>,
    /// Services as of the last reconciliation
    pub services: BTreeMap<String, ServiceRecord>,
    /// Whether the instance has been reconciled
    pub reconciled: bool,
}

/// Everything known about one registered source.
#[derive(Debug, Clone)]
pub struct SourceDetails {
    /// Absolute path
    pub path: PathBuf,
    /// Registration record
    pub record: SourceRecord,
    /// Freshly parsed content, when the file is readable
    pub current: Option<ConfigSource>,
    /// Why the file could not be parsed
    pub load_error: Option<String>,
    /// Stored record of the instance the source contributes to
    pub instance: Option<InstanceRecord>,
}

/// Registry and lifecycle operations over one state directory.
pub struct ProcessManager {
    config: Config,
    store: StateStore,
    gateway: Arc<dyn SupervisorGateway>,
    probe: Arc<dyn LivenessProbe>,
    backoff: BackoffPolicy,
}

impl ProcessManager {
    /// Create a manager driving `supervisorctl`.
    pub fn new(config: Config) -> Self {
        let gateway: Arc<dyn SupervisorGateway> = Arc::new(SupervisorctlGateway::new(&config));
        let probe = Arc::new(GatewayProbe::new(gateway.clone()));
        Self::with_gateway(config, gateway, probe)
    }

    /// Create a manager with an explicit gateway and probe.
    pub fn with_gateway(
        config: Config,
        gateway: Arc<dyn SupervisorGateway>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            store: StateStore::new(&config),
            config,
            gateway,
            probe,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Set the readiness poll backoff used by graceful restarts.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.run_timeout
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register config files and run one reconciliation pass.
    ///
    /// Every path is validated before anything is registered; already
    /// registered paths are skipped with a warning.
    pub async fn add_source(&self, paths: &[PathBuf]) -> Result<RunSummary> {
        self.add_source_with_root(paths, None).await
    }

    /// Register config files with a Galaxy root for those that do not set
    /// one, then run one reconciliation pass.
    pub async fn add_source_with_root(
        &self,
        paths: &[PathBuf],
        galaxy_root: Option<&Path>,
    ) -> Result<RunSummary> {
        let deadline = self.deadline();
        let guard = self.store.lock().await?;
        let mut state = guard.load()?;
        let galaxy_root = galaxy_root.map(absolute_path).transpose()?;

        let mut fresh = Vec::new();
        for path in paths {
            let path = absolute_path(path)?;
            let pending = fresh.iter().any(|s: &ConfigSource| s.path == path);
            if pending || state.is_registered(&path) {
                warn!(source = %path.display(), "Already registered, skipping");
                continue;
            }
            fresh.push(ConfigSource::load_with_root(&path, galaxy_root.as_deref())?);
        }

        let now = Utc::now();
        for source in fresh {
            info!(
                source = %source.path.display(),
                instance = %source.instance_name(),
                "Registered config source"
            );
            state.sources.insert(
                source.path.clone(),
                SourceRecord {
                    instance_name: source.instance_name().to_string(),
                    fingerprint: Some(source.fingerprint.clone()),
                    galaxy_root: galaxy_root.clone(),
                    registered_at: now,
                    updated_at: now,
                },
            );
        }

        let summary = self.reconcile_locked(&mut state, deadline, false).await;
        guard.save(&state)?;
        Ok(summary)
    }

    /// Deregister sources by path or by instance name.
    ///
    /// Instances left without sources are torn down by the next
    /// reconciliation pass. Entries matching nothing are warned about.
    pub async fn remove_source(&self, entries: &[String]) -> Result<Vec<PathBuf>> {
        let guard = self.store.lock().await?;
        let mut state = guard.load()?;

        let mut removed = Vec::new();
        for entry in entries {
            let by_instance = state.sources_referencing(entry);
            let targets = if !by_instance.is_empty() {
                by_instance
            } else {
                let path = absolute_path(Path::new(entry))?;
                if state.is_registered(&path) {
                    vec![path]
                } else {
                    warn!(entry = %entry, "Not a registered config file or instance name");
                    continue;
                }
            };
            for path in targets {
                if state.sources.remove(&path).is_some() {
                    info!(source = %path.display(), "Removed config source");
                    removed.push(path);
                }
            }
        }

        if !removed.is_empty() {
            guard.save(&state)?;
        }
        Ok(removed)
    }

    /// Move a registration to a new path.
    ///
    /// The new path must parse as a config source; the registration time is
    /// kept.
    pub async fn rename_source(&self, old: &Path, new: &Path) -> Result<()> {
        let guard = self.store.lock().await?;
        let mut state = guard.load()?;

        let old = absolute_path(old)?;
        let new = absolute_path(new)?;
        if state.is_registered(&new) {
            return Err(Error::AlreadyRegistered(new));
        }
        let Some(mut record) = state.sources.remove(&old) else {
            return Err(Error::NotRegistered(old));
        };

        let source = ConfigSource::load_with_root(&new, record.galaxy_root.as_deref())?;
        record.instance_name = source.instance_name().to_string();
        record.fingerprint = Some(source.fingerprint);
        record.updated_at = Utc::now();
        state.sources.insert(new.clone(), record);
        guard.save(&state)?;

        info!(from = %old.display(), to = %new.display(), "Renamed config source");
        Ok(())
    }

    /// Registered sources in path order.
    pub async fn list_sources(&self) -> Result<Vec<SourceListing>> {
        let guard = self.store.lock().await?;
        let state = guard.load()?;
        Ok(state
            .sources
            .into_iter()
            .map(|(path, record)| SourceListing { path, record })
            .collect())
    }

    /// Known instances in name order, reconciled or not.
    pub async fn list_instances(&self) -> Result<Vec<InstanceListing>> {
        let guard = self.store.lock().await?;
        let state = guard.load()?;
        Ok(state
            .instance_names()
            .into_iter()
            .map(|name| {
                let stored = state.instances.get(&name);
                InstanceListing {
                    sources: state.sources_referencing(&name),
                    services: stored.map(|r| r.services.clone()).unwrap_or_default(),
                    reconciled: stored.is_some(),
                    name,
                }
            })
            .collect())
    }

    /// Details of one registered source.
    pub async fn get_source_details(&self, path: &Path) -> Result<SourceDetails> {
        let guard = self.store.lock().await?;
        let state = guard.load()?;
        let path = absolute_path(path)?;
        let record = state
            .sources
            .get(&path)
            .cloned()
            .ok_or_else(|| Error::NotRegistered(path.clone()))?;

        let (current, load_error) =
            match ConfigSource::load_with_root(&path, record.galaxy_root.as_deref()) {
                Ok(source) => (Some(source), None),
                Err(e) => (None, Some(e.to_string())),
            };
        let instance = state.instances.get(&record.instance_name).cloned();
        Ok(SourceDetails {
            path,
            record,
            current,
            load_error,
            instance,
        })
    }

    // ========================================================================
    // Reconciliation and lifecycle
    // ========================================================================

    /// Run one reconciliation pass.
    pub async fn update(&self) -> Result<RunSummary> {
        self.run_update(false).await
    }

    /// Run one reconciliation pass that rewrites and reapplies every
    /// instance, changed or not.
    pub async fn force_update(&self) -> Result<RunSummary> {
        self.run_update(true).await
    }

    async fn run_update(&self, force: bool) -> Result<RunSummary> {
        let deadline = self.deadline();
        let guard = self.store.lock().await?;
        let mut state = guard.load()?;
        let summary = self.reconcile_locked(&mut state, deadline, force).await;
        guard.save(&state)?;
        Ok(summary)
    }

    /// Start instances, all when `filter` is empty.
    pub async fn start(&self, filter: &[String]) -> Result<RunSummary> {
        self.lifecycle(Action::Start, filter).await
    }

    /// Stop instances, all when `filter` is empty.
    pub async fn stop(&self, filter: &[String]) -> Result<RunSummary> {
        self.lifecycle(Action::Stop, filter).await
    }

    /// Restart instances, all when `filter` is empty.
    pub async fn restart(&self, filter: &[String]) -> Result<RunSummary> {
        self.lifecycle(Action::Restart, filter).await
    }

    /// Reload instances, all when `filter` is empty.
    pub async fn reload(&self, filter: &[String]) -> Result<RunSummary> {
        self.lifecycle(Action::Reload, filter).await
    }

    /// Gracefully reload instances, all when `filter` is empty.
    pub async fn graceful(&self, filter: &[String]) -> Result<RunSummary> {
        self.lifecycle(Action::Graceful, filter).await
    }

    /// Stop every known instance, then the supervisory daemon.
    pub async fn shutdown(&self) -> Result<RunSummary> {
        let guard = self.store.lock().await?;
        let state = guard.load()?;

        let mut summary = RunSummary::default();
        for name in state.instances.keys() {
            let outcome = match self.gateway.stop_group(name).await {
                Ok(()) => ActionOutcome::Done,
                Err(e) => ActionOutcome::Failed {
                    reason: e.to_string(),
                },
            };
            summary.actions.push(ActionReport {
                instance: name.clone(),
                action: Action::Stop,
                outcome,
            });
        }
        if let Err(e) = self.gateway.shutdown().await {
            warn!(error = %e, "Supervisor shutdown failed");
            summary.errors.push(format!("supervisor shutdown failed: {}", e));
        }
        info!(gateway = self.gateway.gateway_type(), "Shut down");
        Ok(summary)
    }

    /// Run a lifecycle action after a reconciliation pass.
    pub async fn lifecycle(&self, action: Action, filter: &[String]) -> Result<RunSummary> {
        let deadline = self.deadline();
        let guard = self.store.lock().await?;
        let mut state = guard.load()?;
        if state.sources.is_empty() && state.instances.is_empty() {
            return Err(Error::NoInstancesRegistered);
        }

        let mut summary = self.reconcile_locked(&mut state, deadline, false).await;
        guard.save(&state)?;

        let targets = self.targets(&state, filter, &mut summary);
        let dispatcher = Dispatcher::new(
            self.gateway.clone(),
            self.probe.clone(),
            self.config.member_ready_timeout,
        )
        .with_backoff(self.backoff);

        for name in targets {
            let blocked = summary
                .instance(&name)
                .filter(|r| r.state.is_blocked())
                .map(|r| r.state.to_string());
            let outcome = match (blocked, state.instances.get(&name)) {
                (Some(reason), _) => ActionOutcome::Failed {
                    reason: format!("not converged ({})", reason),
                },
                (None, Some(record)) => dispatcher.dispatch(action, &name, record, deadline).await,
                (None, None) => continue,
            };
            summary.actions.push(ActionReport {
                instance: name,
                action,
                outcome,
            });
        }
        Ok(summary)
    }

    fn targets(
        &self,
        state: &StoredTopology,
        filter: &[String],
        summary: &mut RunSummary,
    ) -> Vec<String> {
        if filter.is_empty() {
            return state.instances.keys().cloned().collect();
        }
        let mut targets = Vec::new();
        for name in filter {
            if state.instances.contains_key(name) {
                if !targets.contains(name) {
                    targets.push(name.clone());
                }
            } else {
                warn!(instance = %name, "Unknown instance, skipping");
                summary.unknown_instances.push(name.clone());
            }
        }
        targets
    }

    /// Reconcile the registered sources against `state`, updating it in
    /// place. The caller saves.
    async fn reconcile_locked(
        &self,
        state: &mut StoredTopology,
        deadline: Instant,
        force: bool,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut sources = Vec::new();
        let mut held = BTreeMap::new();

        for (path, record) in state.sources.iter_mut() {
            match ConfigSource::load_with_root(path, record.galaxy_root.as_deref()) {
                Ok(source) => {
                    if record.fingerprint.as_deref() != Some(source.fingerprint.as_str()) {
                        debug!(source = %path.display(), "Config source changed");
                        record.fingerprint = Some(source.fingerprint.clone());
                        record.updated_at = Utc::now();
                    }
                    if record.instance_name != source.instance_name() {
                        info!(
                            source = %path.display(),
                            from = %record.instance_name,
                            to = %source.instance_name(),
                            "Config source moved to another instance"
                        );
                        record.instance_name = source.instance_name().to_string();
                    }
                    if !source.diagnostics.is_empty() {
                        summary
                            .degraded
                            .push((path.clone(), source.diagnostics.clone()));
                    }
                    sources.push(source);
                }
                Err(e) => {
                    warn!(
                        source = %path.display(),
                        instance = %record.instance_name,
                        error = %e,
                        "Config source unreadable, leaving its instance untouched"
                    );
                    held.insert(
                        record.instance_name.clone(),
                        format!("config source {} unreadable: {}", path.display(), e),
                    );
                    summary.pinned.push((path.clone(), e.to_string()));
                }
            }
        }

        let build = topology::build(&sources, &BuildDefaults::from_config(&self.config));

        // Conflicted instances are held by the reconciler with the conflict
        // as their reason.
        let built: BTreeSet<&String> = build
            .topology
            .instances
            .keys()
            .chain(build.conflicts.iter().map(|c| &c.instance))
            .collect();
        for name in state.instances.keys() {
            if built.contains(name) || held.contains_key(name) {
                continue;
            }
            let referencing = state.sources_referencing(name);
            if !referencing.is_empty() {
                held.insert(
                    name.clone(),
                    format!("still referenced by {} config source(s)", referencing.len()),
                );
            }
        }

        let reconciler = Reconciler::new(self.gateway.clone(), self.config.add_member_policy)
            .with_force(force);
        let run = reconciler
            .reconcile(&state.instances, &build, &held, deadline)
            .await;

        state.instances = run.records;
        summary.instances = run.reports;
        summary.errors.extend(run.errors);
        summary
    }
}


// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation pass execution.
//!
//! Drives every changed instance through its planned operations against the
//! supervisor gateway. Instances are independent: a gateway failure blocks
//! only the instance it happened in. Once every instance is converged or
//! blocked the daemon re-reads its configuration one last time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AddMemberPolicy;
use crate::error::{Error, Result};
use crate::gateway::{ProgramState, SupervisorGateway};
use crate::state::InstanceRecord;
use crate::topology::{Build, Instance, Topology};

use super::diff::{ChangeSet, diff};
use super::plan::{Classification, InstancePlan, Operation, plan_instance};
use super::summary::{InstanceReport, InstanceState};

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Changes computed against the stored topology
    pub changes: ChangeSet,
    /// Per-instance outcome, in instance name order
    pub reports: Vec<InstanceReport>,
    /// Instance records to persist: converged instances take their new
    /// shape, everything else keeps what was stored
    pub records: BTreeMap<String, InstanceRecord>,
    /// Failures not tied to a single instance
    pub errors: Vec<String>,
}

/// Applies change sets through a supervisor gateway.
pub struct Reconciler {
    gateway: Arc<dyn SupervisorGateway>,
    policy: AddMemberPolicy,
    force: bool,
}

impl Reconciler {
    /// Create a reconciler.
    pub fn new(gateway: Arc<dyn SupervisorGateway>, policy: AddMemberPolicy) -> Self {
        Self {
            gateway,
            policy,
            force: false,
        }
    }

    /// Treat every member of a stored instance as modified, so each
    /// fragment is rewritten and applied.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Run one pass.
    ///
    /// `held` names instances that must be left exactly as stored this run,
    /// with the reason; instances with a name conflict in `build` are held
    /// automatically, and the conflict is the reason reported for them.
    pub async fn reconcile(
        &self,
        stored: &BTreeMap<String, InstanceRecord>,
        build: &Build,
        held: &BTreeMap<String, String>,
        deadline: Instant,
    ) -> Reconciliation {
        let mut held = held.clone();
        for conflict in &build.conflicts {
            let sources: Vec<String> = conflict
                .sources
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            held.insert(
                conflict.instance.clone(),
                Error::NameConflict {
                    instance: conflict.instance.clone(),
                    sources: conflict.sources.clone(),
                }
                .to_string(),
            );
            debug!(instance = %conflict.instance, sources = ?sources, "Holding conflicted instance");
        }

        let baseline: BTreeMap<String, InstanceRecord> = stored
            .iter()
            .filter(|(name, _)| !held.contains_key(*name))
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect();
        let desired = Topology {
            instances: build
                .topology
                .instances
                .iter()
                .filter(|(name, _)| !held.contains_key(*name))
                .map(|(name, instance)| (name.clone(), instance.clone()))
                .collect(),
        };

        let mut changes = diff(&baseline, &desired);
        if self.force {
            changes.mark_all_modified();
        }
        let mut result = Reconciliation {
            records: stored.clone(),
            ..Default::default()
        };

        let names: BTreeSet<&String> = baseline
            .keys()
            .chain(desired.instances.keys())
            .chain(held.keys())
            .collect();

        for name in names {
            if let Some(reason) = held.get(name) {
                error!(instance = %name, reason = %reason, "Instance blocked");
                result.reports.push(InstanceReport {
                    instance: name.clone(),
                    classification: Classification::Unchanged,
                    state: InstanceState::Blocked(reason.clone()),
                    warnings: Vec::new(),
                });
                continue;
            }

            let instance = desired.instances.get(name);
            let plan = plan_instance(&changes, name, instance, self.policy);
            let report = self.converge(&plan, instance, deadline).await;

            if report.state == InstanceState::Converged {
                match instance {
                    Some(instance) if plan.classification != Classification::Empty => {
                        result
                            .records
                            .insert(name.clone(), InstanceRecord::from(instance));
                    }
                    _ => {
                        result.records.remove(name);
                    }
                }
            }
            result.reports.push(report);
        }

        if let Err(e) = self.gateway.reload_daemon_config().await {
            error!(error = %e, "Final daemon config reload failed");
            result
                .errors
                .push(format!("final daemon config reload failed: {}", e));
        }

        result.changes = changes;
        result
    }

    async fn converge(
        &self,
        plan: &InstancePlan,
        instance: Option<&Instance>,
        deadline: Instant,
    ) -> InstanceReport {
        let mut report = InstanceReport {
            instance: plan.instance.clone(),
            classification: plan.classification,
            state: InstanceState::Unchanged,
            warnings: plan.warnings.clone(),
        };

        for warning in &plan.warnings {
            warn!(instance = %plan.instance, "{}", warning);
        }

        if let Some(reason) = &plan.deferred {
            warn!(instance = %plan.instance, reason = %reason, "Instance change deferred");
            report.state = InstanceState::Blocked(reason.clone());
            return report;
        }

        if plan.operations.is_empty() {
            debug!(instance = %plan.instance, "Instance unchanged");
            report.state = InstanceState::Converged;
            return report;
        }

        info!(
            instance = %plan.instance,
            classification = %plan.classification,
            operations = plan.operations.len(),
            "Converging instance"
        );

        let mut state = InstanceState::Unchanged;
        let sequence = self.execute(plan, instance, &mut state);
        let outcome = match tokio::time::timeout_at(deadline, sequence).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Other("run deadline exceeded".to_string())),
        };

        report.state = match outcome {
            Ok(()) => {
                info!(instance = %plan.instance, "Instance converged");
                InstanceState::Converged
            }
            Err(e) => {
                error!(instance = %plan.instance, state = %state, error = %e, "Instance blocked");
                if plan.classification == Classification::New && state == InstanceState::Applying {
                    self.discard_new(&plan.instance).await;
                }
                InstanceState::Blocked(e.to_string())
            }
        };
        report
    }

    /// Take back the fragment of a new instance that never converged. It has
    /// no stored record, so no later pass would remove it.
    async fn discard_new(&self, group: &str) {
        if let Err(e) = self.gateway.stop_group(group).await {
            debug!(instance = %group, error = %e, "Group of failed new instance not stopped");
        }
        match self.gateway.remove_fragment(group).await {
            Ok(()) => info!(instance = %group, "Removed fragment of failed new instance"),
            Err(e) => {
                warn!(instance = %group, error = %e, "Failed to remove fragment of failed new instance")
            }
        }
    }

    async fn execute(
        &self,
        plan: &InstancePlan,
        instance: Option<&Instance>,
        state: &mut InstanceState,
    ) -> Result<()> {
        let group = plan.instance.as_str();
        transition(group, state, InstanceState::Regenerating);

        for operation in &plan.operations {
            debug!(instance = %group, operation = ?operation, "Applying operation");
            match operation {
                Operation::StopGroup => {
                    info!(instance = %group, "Stopping group");
                    self.gateway.stop_group(group).await?;
                    let status = self.gateway.group_status(group).await?;
                    if !status.all_down() {
                        let up: Vec<&str> = status
                            .members
                            .iter()
                            .filter(|m| !m.state.is_down())
                            .map(|m| m.name.as_str())
                            .collect();
                        return Err(Error::Other(format!(
                            "members still running after group stop: {}",
                            up.join(", ")
                        )));
                    }
                }
                Operation::ApplyFragment => {
                    let programs = instance.map(Instance::program_specs).unwrap_or_default();
                    self.gateway.apply_fragment(group, &programs).await?;
                    transition(group, state, InstanceState::Applying);
                }
                Operation::RemoveFragment => {
                    self.gateway.remove_fragment(group).await?;
                    transition(group, state, InstanceState::Applying);
                }
                Operation::ReloadDaemonConfig => {
                    self.gateway.reload_daemon_config().await?;
                }
                Operation::StartGroup => {
                    info!(instance = %group, "Starting group");
                    self.gateway.start_group(group).await?;
                }
                Operation::Signal { member, signal } => {
                    let status = self.gateway.group_status(group).await?;
                    if status.state_of(member) == Some(ProgramState::Running) {
                        info!(instance = %group, member = %member, signal = %signal, "Signalling member");
                        self.gateway.signal_process(group, member, *signal).await?;
                    } else {
                        debug!(instance = %group, member = %member, "Member not running, nothing to signal");
                    }
                }
            }
        }
        transition(group, state, InstanceState::Converged);
        Ok(())
    }
}

fn transition(instance: &str, state: &mut InstanceState, to: InstanceState) {
    debug!(instance = %instance, from = %state, to = %to, "Instance state");
    *state = to;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayCall, MockGateway, ProgramState};
    use crate::state::StoredTopology;
    use crate::topology::{NameConflict, Service, ServiceId, ServiceKind, ServiceType};
    use crate::gateway::ProgramSpec;
    use std::path::PathBuf;
    use std::time::Duration;

    fn service(instance: &str, name: &str, kind: ServiceKind, command: &str) -> Service {
        let program = ProgramSpec {
            name: name.to_string(),
            command: command.to_string(),
            directory: PathBuf::from("/srv"),
            environment: BTreeMap::new(),
            log_file: PathBuf::from("/log"),
            autostart: true,
            start_secs: 10,
            stop_wait_secs: 10,
            stop_signal: "TERM".to_string(),
        };
        Service {
            id: ServiceId::new(instance, name),
            kind,
            service_type: ServiceType::Handler,
            pool: None,
            source: PathBuf::from(format!("/{}.yml", instance)),
            fingerprint: crate::topology::fingerprint(&program),
            program,
            desired_running: true,
        }
    }

    fn build(instances: Vec<(&str, Vec<Service>)>) -> Build {
        let mut build = Build::default();
        for (name, services) in instances {
            build.topology.instances.insert(
                name.to_string(),
                Instance {
                    name: name.to_string(),
                    sources: [PathBuf::from(format!("/{}.yml", name))].into(),
                    services: services
                        .into_iter()
                        .map(|s| (s.id.service.clone(), s))
                        .collect(),
                },
            );
        }
        build
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    async fn converged(
        reconciler: &Reconciler,
        build: &Build,
    ) -> BTreeMap<String, InstanceRecord> {
        let run = reconciler
            .reconcile(&BTreeMap::new(), build, &BTreeMap::new(), deadline())
            .await;
        assert!(run.reports.iter().all(|r| r.state == InstanceState::Converged));
        run.records
    }

    #[tokio::test]
    async fn test_new_instance_is_started() {
        let gateway = Arc::new(MockGateway::new());
        let reconciler = Reconciler::new(gateway.clone(), AddMemberPolicy::Restart);
        let desired = build(vec![(
            "main",
            vec![service("main", "handler0", ServiceKind::JobHandler, "run 0")],
        )]);

        let records = converged(&reconciler, &desired).await;
        assert!(records.contains_key("main"));
        assert_eq!(
            gateway.commands().await,
            vec![
                GatewayCall::ApplyFragment("main".to_string(), vec!["handler0".to_string()]),
                GatewayCall::ReloadDaemonConfig,
                GatewayCall::StartGroup("main".to_string()),
                GatewayCall::ReloadDaemonConfig,
            ]
        );
        assert_eq!(
            gateway.member_state("main", "handler0").await,
            Some(ProgramState::Running)
        );
    }

    #[tokio::test]
    async fn test_reapplying_same_topology_is_a_no_op() {
        let gateway = Arc::new(MockGateway::new());
        let reconciler = Reconciler::new(gateway.clone(), AddMemberPolicy::Restart);
        let desired = build(vec![(
            "main",
            vec![service("main", "handler0", ServiceKind::JobHandler, "run 0")],
        )]);
        let records = converged(&reconciler, &desired).await;
        gateway.clear_calls().await;

        let run = reconciler
            .reconcile(&records, &desired, &BTreeMap::new(), deadline())
            .await;
        assert!(run.changes.is_empty());
        assert_eq!(run.records, records);
        assert!(!gateway.commands().await.iter().any(GatewayCall::is_disruptive));
    }

    #[tokio::test]
    async fn test_records_rebuild_to_desired_topology() {
        let gateway = Arc::new(MockGateway::new());
        let reconciler = Reconciler::new(gateway, AddMemberPolicy::Restart);
        let desired = build(vec![
            ("a", vec![service("a", "handler0", ServiceKind::JobHandler, "run 0")]),
            (
                "b",
                vec![
                    service("b", "gunicorn", ServiceKind::SignalReloadableGateway, "g"),
                    service("b", "celery", ServiceKind::StandaloneApplication, "c"),
                ],
            ),
        ]);
        let records = converged(&reconciler, &desired).await;

        let mut expected = StoredTopology::default();
        expected.record_topology(&desired.topology);
        assert_eq!(records, expected.instances);
    }

    #[tokio::test]
    async fn test_blocked_instance_keeps_stored_state() {
        let gateway = Arc::new(MockGateway::new());
        let reconciler = Reconciler::new(gateway.clone(), AddMemberPolicy::Restart);
        let first = build(vec![
            ("a", vec![service("a", "handler0", ServiceKind::JobHandler, "run 0")]),
            ("b", vec![service("b", "handler0", ServiceKind::JobHandler, "run 0")]),
        ]);
        let stored = converged(&reconciler, &first).await;

        let second = build(vec![
            ("a", vec![service("a", "handler0", ServiceKind::JobHandler, "run 1")]),
            ("b", vec![service("b", "handler0", ServiceKind::JobHandler, "run 1")]),
        ]);
        gateway.make_unreachable("a").await;
        let run = reconciler
            .reconcile(&stored, &second, &BTreeMap::new(), deadline())
            .await;

        assert!(run.reports[0].state.is_blocked());
        assert_eq!(run.reports[1].state, InstanceState::Converged);
        assert_eq!(run.records["a"], stored["a"]);
        assert_ne!(run.records["b"], stored["b"]);
    }

    #[tokio::test]
    async fn test_rejected_fragment_blocks_new_instance() {
        let gateway = Arc::new(MockGateway::new());
        gateway.reject_fragments("main").await;
        let reconciler = Reconciler::new(gateway.clone(), AddMemberPolicy::Restart);
        let desired = build(vec![(
            "main",
            vec![service("main", "handler0", ServiceKind::JobHandler, "run 0")],
        )]);
        let run = reconciler
            .reconcile(&BTreeMap::new(), &desired, &BTreeMap::new(), deadline())
            .await;
        assert!(run.reports[0].state.is_blocked());
        assert!(run.records.is_empty());
        assert!(!gateway.commands().await.iter().any(GatewayCall::is_disruptive));
    }

    #[tokio::test]
    async fn test_conflicted_instance_is_not_torn_down() {
        let gateway = Arc::new(MockGateway::new());
        let reconciler = Reconciler::new(gateway.clone(), AddMemberPolicy::Restart);
        let first = build(vec![(
            "_default_",
            vec![service("_default_", "main", ServiceKind::StandaloneApplication, "m")],
        )]);
        let stored = converged(&reconciler, &first).await;
        gateway.clear_calls().await;

        let mut second = Build::default();
        second.conflicts.push(NameConflict {
            instance: "_default_".to_string(),
            sources: vec![PathBuf::from("/a.yml"), PathBuf::from("/b.yml")],
        });
        let run = reconciler
            .reconcile(&stored, &second, &BTreeMap::new(), deadline())
            .await;
        assert!(run.reports[0].state.is_blocked());
        assert_eq!(run.records, stored);
        assert!(!gateway.commands().await.iter().any(GatewayCall::is_disruptive));
    }

    #[tokio::test]
    async fn test_members_still_up_after_stop_blocks() {
        let gateway = Arc::new(MockGateway::new());
        let reconciler = Reconciler::new(gateway.clone(), AddMemberPolicy::Restart);
        let first = build(vec![(
            "main",
            vec![service("main", "handler0", ServiceKind::JobHandler, "run 0")],
        )]);
        let stored = converged(&reconciler, &first).await;

        // Simulates a daemon that acknowledges the stop without acting on it.
        struct StickyGateway(Arc<MockGateway>);

        #[async_trait::async_trait]
        impl SupervisorGateway for StickyGateway {
            fn gateway_type(&self) -> &'static str {
                "sticky"
            }
            async fn apply_fragment(
                &self,
                group: &str,
                programs: &[ProgramSpec],
            ) -> crate::gateway::Result<()> {
                self.0.apply_fragment(group, programs).await
            }
            async fn remove_fragment(&self, group: &str) -> crate::gateway::Result<()> {
                self.0.remove_fragment(group).await
            }
            async fn reload_daemon_config(&self) -> crate::gateway::Result<()> {
                self.0.reload_daemon_config().await
            }
            async fn has_pending_definition(&self, group: &str) -> crate::gateway::Result<bool> {
                self.0.has_pending_definition(group).await
            }
            async fn load_group(&self, group: &str) -> crate::gateway::Result<()> {
                self.0.load_group(group).await
            }
            async fn group_status(
                &self,
                group: &str,
            ) -> crate::gateway::Result<crate::gateway::GroupStatus> {
                self.0.group_status(group).await
            }
            async fn start_group(&self, group: &str) -> crate::gateway::Result<()> {
                self.0.start_group(group).await
            }
            async fn stop_group(&self, _group: &str) -> crate::gateway::Result<()> {
                Ok(())
            }
            async fn start_program(&self, group: &str, member: &str) -> crate::gateway::Result<()> {
                self.0.start_program(group, member).await
            }
            async fn stop_program(&self, group: &str, member: &str) -> crate::gateway::Result<()> {
                self.0.stop_program(group, member).await
            }
            async fn signal_process(
                &self,
                group: &str,
                member: &str,
                signal: nix::sys::signal::Signal,
            ) -> crate::gateway::Result<()> {
                self.0.signal_process(group, member, signal).await
            }
        }

        let sticky = Reconciler::new(
            Arc::new(StickyGateway(gateway.clone())),
            AddMemberPolicy::Restart,
        );
        let second = build(vec![(
            "main",
            vec![service("main", "handler0", ServiceKind::JobHandler, "run 1")],
        )]);
        let run = sticky
            .reconcile(&stored, &second, &BTreeMap::new(), deadline())
            .await;
        match &run.reports[0].state {
            InstanceState::Blocked(reason) => assert!(reason.contains("handler0")),
            other => panic!("unexpected state: {:?}", other),
        }
        assert_eq!(run.records, stored);
    }

    #[tokio::test]
    async fn test_stopped_member_is_not_signalled() {
        let gateway = Arc::new(MockGateway::new());
        let reconciler = Reconciler::new(gateway.clone(), AddMemberPolicy::Restart);
        let first = build(vec![(
            "main",
            vec![service("main", "gunicorn", ServiceKind::SignalReloadableGateway, "g -w 1")],
        )]);
        let stored = converged(&reconciler, &first).await;
        gateway.stop_group("main").await.unwrap();
        gateway.clear_calls().await;

        let second = build(vec![(
            "main",
            vec![service("main", "gunicorn", ServiceKind::SignalReloadableGateway, "g -w 4")],
        )]);
        let run = reconciler
            .reconcile(&stored, &second, &BTreeMap::new(), deadline())
            .await;
        assert_eq!(run.reports[0].classification, Classification::SignalReload);
        assert_eq!(run.reports[0].state, InstanceState::Converged);
        assert!(
            !gateway
                .commands()
                .await
                .iter()
                .any(|c| matches!(c, GatewayCall::Signal(..)))
        );
        assert_ne!(run.records["main"], stored["main"]);
        assert_eq!(
            gateway.loaded_program("main", "gunicorn").await.unwrap().command,
            "g -w 4"
        );
    }

    #[tokio::test]
    async fn test_failed_new_instance_leaves_no_fragment() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_starts("main").await;
        let reconciler = Reconciler::new(gateway.clone(), AddMemberPolicy::Restart);
        let desired = build(vec![(
            "main",
            vec![service("main", "handler0", ServiceKind::JobHandler, "run 0")],
        )]);
        let run = reconciler
            .reconcile(&BTreeMap::new(), &desired, &BTreeMap::new(), deadline())
            .await;

        assert!(run.reports[0].state.is_blocked());
        assert!(run.records.is_empty());
        assert!(gateway.fragment("main").await.is_none());
        assert!(gateway.loaded_groups().await.is_empty());
    }

    #[tokio::test]
    async fn test_force_reapplies_unchanged_instance() {
        let gateway = Arc::new(MockGateway::new());
        let reconciler = Reconciler::new(gateway.clone(), AddMemberPolicy::Restart);
        let desired = build(vec![(
            "main",
            vec![service("main", "handler0", ServiceKind::JobHandler, "run 0")],
        )]);
        let stored = converged(&reconciler, &desired).await;
        gateway.clear_calls().await;

        let run = Reconciler::new(gateway.clone(), AddMemberPolicy::Restart)
            .with_force(true)
            .reconcile(&stored, &desired, &BTreeMap::new(), deadline())
            .await;
        assert_eq!(run.reports[0].classification, Classification::FullRestart);
        assert_eq!(run.reports[0].state, InstanceState::Converged);
        assert_eq!(run.records, stored);
        assert_eq!(
            gateway.commands().await,
            vec![
                GatewayCall::StopGroup("main".to_string()),
                GatewayCall::ApplyFragment("main".to_string(), vec!["handler0".to_string()]),
                GatewayCall::ReloadDaemonConfig,
                GatewayCall::StartGroup("main".to_string()),
                GatewayCall::ReloadDaemonConfig,
            ]
        );
    }

    #[tokio::test]
    async fn test_conflict_is_the_reported_reason() {
        let gateway = Arc::new(MockGateway::new());
        let reconciler = Reconciler::new(gateway.clone(), AddMemberPolicy::Restart);
        let mut conflicted = Build::default();
        conflicted.conflicts.push(NameConflict {
            instance: "_default_".to_string(),
            sources: vec![PathBuf::from("/a.yml"), PathBuf::from("/b.yml")],
        });
        let held: BTreeMap<String, String> = [(
            "_default_".to_string(),
            "still referenced by 2 config source(s)".to_string(),
        )]
        .into();

        let run = reconciler
            .reconcile(&BTreeMap::new(), &conflicted, &held, deadline())
            .await;
        match &run.reports[0].state {
            InstanceState::Blocked(reason) => assert!(reason.contains("conflict"), "{}", reason),
            other => panic!("unexpected state: {:?}", other),
        }
    }
}

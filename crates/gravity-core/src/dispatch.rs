// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle command dispatch.
//!
//! Runs an [`Action`] against one converged instance. `reload` signals
//! members whose kind supports SIGHUP and restarts the others one at a
//! time; `graceful` additionally waits for each signal-reloadable member to
//! pass the liveness probe before cycling the next one.
//!
//! The daemon swaps in a changed group definition only while the whole
//! group is down. `restart` loads it between stop and start, and so does
//! `reload` when one is pending. `graceful` never has the whole group down,
//! so it refuses to run over a pending definition.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::backoff::BackoffPolicy;
use crate::gateway::{GatewayError, ProgramState, SupervisorGateway};
use crate::probe::LivenessProbe;
use crate::reconcile::{Action, ActionOutcome, ReadinessBounds, cycle_members};
use crate::state::InstanceRecord;

/// Executes lifecycle actions through the gateway.
pub struct Dispatcher {
    gateway: Arc<dyn SupervisorGateway>,
    probe: Arc<dyn LivenessProbe>,
    backoff: BackoffPolicy,
    member_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        gateway: Arc<dyn SupervisorGateway>,
        probe: Arc<dyn LivenessProbe>,
        member_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            probe,
            backoff: BackoffPolicy::default(),
            member_timeout,
        }
    }

    /// Set the readiness poll backoff.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run `action` on the instance described by `record`.
    pub async fn dispatch(
        &self,
        action: Action,
        instance: &str,
        record: &InstanceRecord,
        deadline: Instant,
    ) -> ActionOutcome {
        info!(instance = %instance, action = %action, "Dispatching");
        let result = match action {
            Action::Start => self.gateway.start_group(instance).await,
            Action::Stop => self.gateway.stop_group(instance).await,
            Action::Restart => self.restart(instance).await,
            Action::Reload => return self.reload(instance, record, deadline).await,
            Action::Graceful => return self.graceful(instance, record, deadline).await,
        };
        match result {
            Ok(()) => ActionOutcome::Done,
            Err(e) => {
                warn!(instance = %instance, action = %action, error = %e, "Action failed");
                ActionOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Stop the group, load its current definition, start it again.
    async fn restart(&self, instance: &str) -> Result<(), GatewayError> {
        self.gateway.stop_group(instance).await?;
        self.gateway.load_group(instance).await?;
        self.gateway.start_group(instance).await
    }

    fn bounds(&self, deadline: Instant) -> ReadinessBounds {
        ReadinessBounds {
            backoff: self.backoff,
            member_timeout: self.member_timeout,
            deadline,
        }
    }

    async fn reload(
        &self,
        instance: &str,
        record: &InstanceRecord,
        deadline: Instant,
    ) -> ActionOutcome {
        match self.gateway.has_pending_definition(instance).await {
            Ok(false) => {}
            Ok(true) => {
                info!(instance = %instance, "Group definition changed, reloading through a restart");
                return match self.restart(instance).await {
                    Ok(()) => ActionOutcome::Done,
                    Err(e) => {
                        warn!(instance = %instance, error = %e, "Restart failed");
                        ActionOutcome::Failed {
                            reason: e.to_string(),
                        }
                    }
                };
            }
            Err(e) => {
                return ActionOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        }

        let (reloadable, others) = split_members(record);
        if let Err(e) = self.signal_members(instance, &reloadable).await {
            warn!(instance = %instance, error = %e, "Signal reload failed");
            return ActionOutcome::Failed {
                reason: e.to_string(),
            };
        }
        cycle_members(
            self.gateway.as_ref(),
            self.probe.as_ref(),
            instance,
            &others,
            false,
            &self.bounds(deadline),
        )
        .await
    }

    async fn graceful(
        &self,
        instance: &str,
        record: &InstanceRecord,
        deadline: Instant,
    ) -> ActionOutcome {
        match self.gateway.has_pending_definition(instance).await {
            Ok(false) => {}
            Ok(true) => {
                warn!(instance = %instance, "Group definition changed, graceful reload cannot load it");
                return ActionOutcome::Failed {
                    reason: "group definition changed since the last start, restart to apply it"
                        .to_string(),
                };
            }
            Err(e) => {
                return ActionOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        }

        let (reloadable, others) = split_members(record);
        let bounds = self.bounds(deadline);
        let gateway = self.gateway.as_ref();
        let probe = self.probe.as_ref();

        match cycle_members(gateway, probe, instance, &reloadable, true, &bounds).await {
            ActionOutcome::Done => {}
            ActionOutcome::Partial {
                updated,
                failed,
                mut untouched,
                reason,
            } => {
                untouched.extend(others);
                return ActionOutcome::Partial {
                    updated,
                    failed,
                    untouched,
                    reason,
                };
            }
            failed => return failed,
        }
        match cycle_members(gateway, probe, instance, &others, false, &bounds).await {
            ActionOutcome::Partial {
                updated,
                failed,
                untouched,
                reason,
            } => ActionOutcome::Partial {
                updated: reloadable.into_iter().chain(updated).collect(),
                failed,
                untouched,
                reason,
            },
            outcome => outcome,
        }
    }

    /// HUP running members; start members that are down.
    async fn signal_members(
        &self,
        instance: &str,
        members: &[String],
    ) -> Result<(), GatewayError> {
        if members.is_empty() {
            return Ok(());
        }
        let status = self.gateway.group_status(instance).await?;
        for member in members {
            if status.state_of(member) == Some(ProgramState::Running) {
                self.gateway
                    .signal_process(instance, member, Signal::SIGHUP)
                    .await?;
            } else {
                info!(instance = %instance, member = %member, "Member not running, starting it");
                self.gateway.start_program(instance, member).await?;
            }
        }
        Ok(())
    }
}

/// Split members into signal-reloadable and other kinds, in name order.
fn split_members(record: &InstanceRecord) -> (Vec<String>, Vec<String>) {
    let (reloadable, others): (Vec<_>, Vec<_>) = record
        .services
        .iter()
        .partition(|(_, service)| service.kind.is_signal_reloadable());
    (
        reloadable.into_iter().map(|(name, _)| name.clone()).collect(),
        others.into_iter().map(|(name, _)| name.clone()).collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayCall, MockGateway, ProgramSpec};
    use crate::probe::MockProbe;
    use crate::state::ServiceRecord;
    use crate::topology::{ServiceId, ServiceKind, ServiceType};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn record(members: &[(&str, ServiceKind)]) -> InstanceRecord {
        InstanceRecord {
            sources: [PathBuf::from("/a.yml")].into(),
            services: members
                .iter()
                .map(|(name, kind)| {
                    (
                        name.to_string(),
                        ServiceRecord {
                            kind: *kind,
                            service_type: ServiceType::Gunicorn,
                            fingerprint: "f".to_string(),
                            pool: None,
                        },
                    )
                })
                .collect(),
        }
    }

    async fn running(gateway: &MockGateway, record: &InstanceRecord) {
        let programs: Vec<ProgramSpec> = record
            .services
            .keys()
            .map(|name| ProgramSpec {
                name: name.clone(),
                command: "run".to_string(),
                directory: PathBuf::from("/srv"),
                environment: BTreeMap::new(),
                log_file: PathBuf::from("/log"),
                autostart: true,
                start_secs: 10,
                stop_wait_secs: 10,
                stop_signal: "TERM".to_string(),
            })
            .collect();
        gateway.apply_fragment("main", &programs).await.unwrap();
        gateway.reload_daemon_config().await.unwrap();
        gateway.start_group("main").await.unwrap();
        gateway.clear_calls().await;
    }

    fn dispatcher(gateway: Arc<MockGateway>, probe: Arc<MockProbe>) -> Dispatcher {
        Dispatcher::new(gateway, probe, Duration::from_millis(200)).with_backoff(BackoffPolicy {
            first: Duration::from_millis(10),
            max: Duration::from_millis(20),
            factor: 2.0,
        })
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_reload_signals_only_reloadable_members() {
        let gateway = Arc::new(MockGateway::new());
        let probe = Arc::new(MockProbe::new());
        let record = record(&[
            ("gunicorn", ServiceKind::SignalReloadableGateway),
            ("handler0", ServiceKind::JobHandler),
        ]);
        running(&gateway, &record).await;

        let outcome = dispatcher(gateway.clone(), probe)
            .dispatch(Action::Reload, "main", &record, deadline())
            .await;
        assert!(outcome.is_done());
        assert_eq!(
            gateway.commands().await,
            vec![
                GatewayCall::Signal("main".to_string(), "gunicorn".to_string(), Signal::SIGHUP),
                GatewayCall::StopProgram("main".to_string(), "handler0".to_string()),
                GatewayCall::StartProgram("main".to_string(), "handler0".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_stops_before_starting() {
        let gateway = Arc::new(MockGateway::new());
        let probe = Arc::new(MockProbe::new());
        let record = record(&[("gunicorn", ServiceKind::SignalReloadableGateway)]);
        running(&gateway, &record).await;

        let outcome = dispatcher(gateway.clone(), probe)
            .dispatch(Action::Restart, "main", &record, deadline())
            .await;
        assert!(outcome.is_done());
        assert_eq!(
            gateway.commands().await,
            vec![
                GatewayCall::StopGroup("main".to_string()),
                GatewayCall::LoadGroup("main".to_string()),
                GatewayCall::StartGroup("main".to_string()),
            ]
        );
    }

    async fn stage_change(gateway: &MockGateway, record: &InstanceRecord) {
        let programs: Vec<ProgramSpec> = record
            .services
            .keys()
            .map(|name| ProgramSpec {
                name: name.clone(),
                command: "run --changed".to_string(),
                directory: PathBuf::from("/srv"),
                environment: BTreeMap::new(),
                log_file: PathBuf::from("/log"),
                autostart: true,
                start_secs: 10,
                stop_wait_secs: 10,
                stop_signal: "TERM".to_string(),
            })
            .collect();
        gateway.apply_fragment("main", &programs).await.unwrap();
        gateway.reload_daemon_config().await.unwrap();
        gateway.clear_calls().await;
    }

    #[tokio::test]
    async fn test_restart_loads_changed_definition() {
        let gateway = Arc::new(MockGateway::new());
        let probe = Arc::new(MockProbe::new());
        let record = record(&[("gunicorn", ServiceKind::SignalReloadableGateway)]);
        running(&gateway, &record).await;
        stage_change(&gateway, &record).await;
        assert_eq!(
            gateway.loaded_program("main", "gunicorn").await.unwrap().command,
            "run"
        );

        let outcome = dispatcher(gateway.clone(), probe)
            .dispatch(Action::Restart, "main", &record, deadline())
            .await;
        assert!(outcome.is_done());
        assert_eq!(
            gateway.loaded_program("main", "gunicorn").await.unwrap().command,
            "run --changed"
        );
        assert_eq!(
            gateway.member_state("main", "gunicorn").await,
            Some(ProgramState::Running)
        );
    }

    #[tokio::test]
    async fn test_reload_with_changed_definition_restarts_group() {
        let gateway = Arc::new(MockGateway::new());
        let probe = Arc::new(MockProbe::new());
        let record = record(&[
            ("gunicorn", ServiceKind::SignalReloadableGateway),
            ("handler0", ServiceKind::JobHandler),
        ]);
        running(&gateway, &record).await;
        stage_change(&gateway, &record).await;

        let outcome = dispatcher(gateway.clone(), probe)
            .dispatch(Action::Reload, "main", &record, deadline())
            .await;
        assert!(outcome.is_done());
        assert_eq!(
            gateway.commands().await,
            vec![
                GatewayCall::StopGroup("main".to_string()),
                GatewayCall::LoadGroup("main".to_string()),
                GatewayCall::StartGroup("main".to_string()),
            ]
        );
        assert_eq!(
            gateway.loaded_program("main", "handler0").await.unwrap().command,
            "run --changed"
        );
    }

    #[tokio::test]
    async fn test_graceful_refuses_changed_definition() {
        let gateway = Arc::new(MockGateway::new());
        let probe = Arc::new(MockProbe::new());
        let record = record(&[
            ("gunicorn_0", ServiceKind::SignalReloadableGateway),
            ("gunicorn_1", ServiceKind::SignalReloadableGateway),
        ]);
        running(&gateway, &record).await;
        stage_change(&gateway, &record).await;

        let outcome = dispatcher(gateway.clone(), probe)
            .dispatch(Action::Graceful, "main", &record, deadline())
            .await;
        match outcome {
            ActionOutcome::Failed { reason } => assert!(reason.contains("restart")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(gateway.commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_graceful_reports_partial_progress() {
        let gateway = Arc::new(MockGateway::new());
        let probe = Arc::new(MockProbe::new());
        let record = record(&[
            ("gunicorn_0", ServiceKind::SignalReloadableGateway),
            ("gunicorn_1", ServiceKind::SignalReloadableGateway),
            ("gunicorn_2", ServiceKind::SignalReloadableGateway),
            ("handler0", ServiceKind::JobHandler),
        ]);
        running(&gateway, &record).await;
        probe.never_ready(ServiceId::new("main", "gunicorn_1")).await;

        let outcome = dispatcher(gateway.clone(), probe)
            .dispatch(Action::Graceful, "main", &record, deadline())
            .await;
        match outcome {
            ActionOutcome::Partial {
                updated,
                failed,
                untouched,
                ..
            } => {
                assert_eq!(updated, vec!["gunicorn_0"]);
                assert_eq!(failed, "gunicorn_1");
                assert_eq!(untouched, vec!["gunicorn_2", "handler0"]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(gateway.max_down("main").await, 1);
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let gateway = Arc::new(MockGateway::new());
        let probe = Arc::new(MockProbe::new());
        let record = record(&[("handler0", ServiceKind::JobHandler)]);

        let outcome = dispatcher(gateway, probe)
            .dispatch(Action::Start, "main", &record, deadline())
            .await;
        assert!(matches!(outcome, ActionOutcome::Failed { .. }));
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Member-by-member restarts.
//!
//! A graceful restart cycles the members of a pool one at a time: stop the
//! member, start it again, then poll the liveness probe until the
//! replacement reports ready before moving on. At most one member of the
//! pool is down at any instant. A member that does not become ready in
//! time ends the sequence for its instance; members before it stay
//! updated and members after it are left untouched.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};
use crate::gateway::SupervisorGateway;
use crate::probe::LivenessProbe;
use crate::topology::ServiceId;

use super::summary::ActionOutcome;

/// Bounds for readiness waits.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessBounds {
    /// Poll backoff
    pub backoff: BackoffPolicy,
    /// Per-member readiness timeout
    pub member_timeout: Duration,
    /// Run-level deadline
    pub deadline: Instant,
}

impl ReadinessBounds {
    fn remaining(&self) -> Duration {
        self.member_timeout
            .min(self.deadline.saturating_duration_since(Instant::now()))
    }
}

/// Poll `probe` until `service` is ready or the bounds elapse.
pub async fn wait_ready(
    probe: &dyn LivenessProbe,
    service: &ServiceId,
    bounds: &ReadinessBounds,
) -> Result<()> {
    let limit = bounds.remaining();
    let poll = async {
        let mut attempt = 0;
        loop {
            if probe.is_ready(service).await {
                return;
            }
            let delay = bounds.backoff.next(attempt);
            debug!(service = %service, attempt, delay_ms = delay.as_millis() as u64, "Not ready yet");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    };
    tokio::time::timeout(limit, poll)
        .await
        .map_err(|_| Error::LivenessTimeout {
            service: service.to_string(),
            timeout: limit,
        })
}

/// Cycle `members` of `instance` one at a time.
///
/// With `gated`, each restarted member must pass the probe before the next
/// one is stopped.
pub async fn cycle_members(
    gateway: &dyn SupervisorGateway,
    probe: &dyn LivenessProbe,
    instance: &str,
    members: &[String],
    gated: bool,
    bounds: &ReadinessBounds,
) -> ActionOutcome {
    for (index, member) in members.iter().enumerate() {
        let id = ServiceId::new(instance, member.as_str());
        if let Err(e) = cycle_one(gateway, probe, &id, gated, bounds).await {
            warn!(service = %id, error = %e, "Member restart sequence aborted");
            return ActionOutcome::Partial {
                updated: members[..index].to_vec(),
                failed: member.clone(),
                untouched: members[index + 1..].to_vec(),
                reason: e.to_string(),
            };
        }
        info!(service = %id, "Member restarted");
    }
    ActionOutcome::Done
}

async fn cycle_one(
    gateway: &dyn SupervisorGateway,
    probe: &dyn LivenessProbe,
    id: &ServiceId,
    gated: bool,
    bounds: &ReadinessBounds,
) -> Result<()> {
    if Instant::now() >= bounds.deadline {
        return Err(Error::Other("run deadline exceeded".to_string()));
    }
    gateway.stop_program(&id.instance, &id.service).await?;
    gateway.start_program(&id.instance, &id.service).await?;
    if gated {
        wait_ready(probe, id, bounds).await?;
    }
    Ok(())
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Liveness probes used by graceful restarts.
//!
//! A probe answers whether a restarted service is ready to take over. It
//! must be cheap and safe to poll repeatedly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::gateway::{ProgramState, SupervisorGateway};
use crate::topology::ServiceId;

/// Readiness check for one service.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Whether the service is ready.
    async fn is_ready(&self, service: &ServiceId) -> bool;
}

/// Probe that treats a member as ready once the daemon reports it running.
pub struct GatewayProbe {
    gateway: Arc<dyn SupervisorGateway>,
}

impl GatewayProbe {
    /// Create a probe backed by the gateway's status query.
    pub fn new(gateway: Arc<dyn SupervisorGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl LivenessProbe for GatewayProbe {
    async fn is_ready(&self, service: &ServiceId) -> bool {
        match self.gateway.group_status(&service.instance).await {
            Ok(status) => status.state_of(&service.service) == Some(ProgramState::Running),
            Err(e) => {
                tracing::debug!(service = %service, error = %e, "Readiness query failed");
                false
            }
        }
    }
}

/// Scripted probe for testing.
///
/// Services are ready immediately unless configured otherwise.
#[derive(Default)]
pub struct MockProbe {
    /// Remaining not-ready answers per service; `None` means never ready.
    pending: Mutex<HashMap<ServiceId, Option<u32>>>,
    polls: Mutex<Vec<ServiceId>>,
}

impl MockProbe {
    /// Create a probe that reports every service ready.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `service` not ready for the next `polls` queries.
    pub async fn ready_after(&self, service: ServiceId, polls: u32) {
        self.pending.lock().await.insert(service, Some(polls));
    }

    /// Never report `service` ready.
    pub async fn never_ready(&self, service: ServiceId) {
        self.pending.lock().await.insert(service, None);
    }

    /// Services polled, in order.
    pub async fn polls(&self) -> Vec<ServiceId> {
        self.polls.lock().await.clone()
    }
}

#[async_trait]
impl LivenessProbe for MockProbe {
    async fn is_ready(&self, service: &ServiceId) -> bool {
        self.polls.lock().await.push(service.clone());
        let mut pending = self.pending.lock().await;
        match pending.get_mut(service) {
            None => true,
            Some(None) => false,
            Some(Some(0)) => true,
            Some(Some(remaining)) => {
                *remaining -= 1;
                false
            }
        }
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock gateway for testing.
//!
//! Simulates a supervisory daemon in memory and records every call so
//! tests can assert on the exact command sequence. Like supervisord, it
//! keeps written fragments apart from the definitions it has loaded: a
//! changed fragment only replaces the loaded definition of a group whose
//! members are all down.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::sync::Mutex;

use super::*;

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// `apply_fragment(group, members)`
    ApplyFragment(String, Vec<String>),
    /// `remove_fragment(group)`
    RemoveFragment(String),
    /// `reload_daemon_config()`
    ReloadDaemonConfig,
    /// `load_group(group)`
    LoadGroup(String),
    /// `group_status(group)`
    GroupStatus(String),
    /// `start_group(group)`
    StartGroup(String),
    /// `stop_group(group)`
    StopGroup(String),
    /// `start_program(group, member)`
    StartProgram(String, String),
    /// `stop_program(group, member)`
    StopProgram(String, String),
    /// `signal_process(group, member, signal)`
    Signal(String, String, Signal),
    /// `shutdown()`
    Shutdown,
}

impl GatewayCall {
    /// Whether the call stops or starts processes.
    pub fn is_disruptive(&self) -> bool {
        matches!(
            self,
            GatewayCall::StartGroup(_)
                | GatewayCall::StopGroup(_)
                | GatewayCall::StartProgram(..)
                | GatewayCall::StopProgram(..)
        )
    }
}

#[derive(Debug, Default)]
struct MockState {
    /// Written fragments
    fragments: BTreeMap<String, Vec<ProgramSpec>>,
    /// Definitions the daemon runs
    loaded: BTreeMap<String, Vec<ProgramSpec>>,
    groups: BTreeMap<String, BTreeMap<String, ProgramState>>,
    calls: Vec<GatewayCall>,
    /// Largest number of simultaneously down members seen per group.
    max_down: HashMap<String, usize>,
}

impl MockState {
    fn record_down(&mut self, group: &str) {
        if let Some(members) = self.groups.get(group) {
            let down = members.values().filter(|s| s.is_down()).count();
            let max = self.max_down.entry(group.to_string()).or_default();
            *max = (*max).max(down);
        }
    }

    fn all_down(&self, group: &str) -> bool {
        self.groups
            .get(group)
            .is_none_or(|members| members.values().all(|s| s.is_down()))
    }

    /// Replace the loaded definition of `group` with its fragment.
    fn load(&mut self, group: &str) {
        let Some(programs) = self.fragments.get(group).cloned() else {
            return;
        };
        let members = self.groups.entry(group.to_string()).or_default();
        members.retain(|name, _| programs.iter().any(|p| &p.name == name));
        for program in &programs {
            members
                .entry(program.name.clone())
                .or_insert(ProgramState::Stopped);
        }
        self.loaded.insert(group.to_string(), programs);
    }

    fn group_mut(&mut self, group: &str) -> Result<&mut BTreeMap<String, ProgramState>> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| GatewayError::Rejected(format!("{}: ERROR (no such group)", group)))
    }
}

/// Mock gateway for testing.
pub struct MockGateway {
    state: Arc<Mutex<MockState>>,
    unreachable: Arc<Mutex<HashSet<String>>>,
    rejected: Arc<Mutex<HashSet<String>>>,
    failing_starts: Arc<Mutex<HashSet<String>>>,
    delay: Arc<Mutex<Duration>>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    /// Create a mock gateway with no groups loaded.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            unreachable: Arc::new(Mutex::new(HashSet::new())),
            rejected: Arc::new(Mutex::new(HashSet::new())),
            failing_starts: Arc::new(Mutex::new(HashSet::new())),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Every call for `group` fails as unreachable.
    pub async fn make_unreachable(&self, group: &str) {
        self.unreachable.lock().await.insert(group.to_string());
    }

    /// Fragments for `group` are rejected.
    pub async fn reject_fragments(&self, group: &str) {
        self.rejected.lock().await.insert(group.to_string());
    }

    /// Starting `group` or any of its members fails.
    pub async fn fail_starts(&self, group: &str) {
        self.failing_starts.lock().await.insert(group.to_string());
    }

    /// Every group-scoped call waits `delay` before answering.
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.lock().await = delay;
    }

    /// Clear injected failures and delays.
    pub async fn heal(&self) {
        self.unreachable.lock().await.clear();
        self.rejected.lock().await.clear();
        self.failing_starts.lock().await.clear();
        *self.delay.lock().await = Duration::ZERO;
    }

    /// Recorded calls, oldest first.
    pub async fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().await.calls.clone()
    }

    /// Recorded calls touching processes or fragments, status queries
    /// excluded.
    pub async fn commands(&self) -> Vec<GatewayCall> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| !matches!(c, GatewayCall::GroupStatus(_)))
            .collect()
    }

    /// Forget recorded calls and down-count history.
    pub async fn clear_calls(&self) {
        let mut state = self.state.lock().await;
        state.calls.clear();
        state.max_down.clear();
    }

    /// The written fragment of a group.
    pub async fn fragment(&self, group: &str) -> Option<Vec<ProgramSpec>> {
        self.state.lock().await.fragments.get(group).cloned()
    }

    /// The definition of a member the daemon currently runs.
    pub async fn loaded_program(&self, group: &str, member: &str) -> Option<ProgramSpec> {
        let state = self.state.lock().await;
        state
            .loaded
            .get(group)
            .and_then(|programs| programs.iter().find(|p| p.name == member))
            .cloned()
    }

    /// Current state of a loaded member.
    pub async fn member_state(&self, group: &str, member: &str) -> Option<ProgramState> {
        let state = self.state.lock().await;
        state.groups.get(group).and_then(|g| g.get(member)).copied()
    }

    /// Names of the groups currently loaded by the daemon.
    pub async fn loaded_groups(&self) -> Vec<String> {
        self.state.lock().await.groups.keys().cloned().collect()
    }

    /// Largest number of members of `group` that were down at once since
    /// the last [`clear_calls`](Self::clear_calls).
    pub async fn max_down(&self, group: &str) -> usize {
        self.state
            .lock()
            .await
            .max_down
            .get(group)
            .copied()
            .unwrap_or(0)
    }

    /// Force a member into a state, e.g. to simulate a crash.
    pub async fn set_member_state(&self, group: &str, member: &str, to: ProgramState) {
        let mut state = self.state.lock().await;
        if let Some(members) = state.groups.get_mut(group) {
            members.insert(member.to_string(), to);
        }
    }

    async fn check(&self, group: &str) -> Result<()> {
        let delay = *self.delay.lock().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.lock().await.contains(group) {
            return Err(GatewayError::Unreachable(format!(
                "connection refused while controlling {}",
                group
            )));
        }
        Ok(())
    }

    async fn check_start(&self, group: &str, member: &str) -> Result<()> {
        if self.failing_starts.lock().await.contains(group) {
            return Err(GatewayError::Rejected(format!("{}: ERROR (spawn error)", member)));
        }
        Ok(())
    }
}

#[async_trait]
impl SupervisorGateway for MockGateway {
    fn gateway_type(&self) -> &'static str {
        "mock"
    }

    async fn apply_fragment(&self, group: &str, programs: &[ProgramSpec]) -> Result<()> {
        self.check(group).await?;
        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::ApplyFragment(
            group.to_string(),
            programs.iter().map(|p| p.name.clone()).collect(),
        ));
        if self.rejected.lock().await.contains(group) {
            return Err(GatewayError::Rejected(format!("invalid fragment for {}", group)));
        }
        state.fragments.insert(group.to_string(), programs.to_vec());
        Ok(())
    }

    async fn remove_fragment(&self, group: &str) -> Result<()> {
        self.check(group).await?;
        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::RemoveFragment(group.to_string()));
        state.fragments.remove(group);
        Ok(())
    }

    async fn reload_daemon_config(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::ReloadDaemonConfig);

        let staged: Vec<String> = state.fragments.keys().cloned().collect();
        state.groups.retain(|name, _| staged.contains(name));
        state.loaded.retain(|name, _| staged.contains(name));
        for group in staged {
            let changed = state.loaded.get(&group) != state.fragments.get(&group);
            if changed && state.all_down(&group) {
                state.load(&group);
            }
        }
        Ok(())
    }

    async fn has_pending_definition(&self, group: &str) -> Result<bool> {
        self.check(group).await?;
        let state = self.state.lock().await;
        Ok(match (state.fragments.get(group), state.loaded.get(group)) {
            (Some(staged), Some(loaded)) => staged != loaded,
            _ => false,
        })
    }

    async fn load_group(&self, group: &str) -> Result<()> {
        self.check(group).await?;
        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::LoadGroup(group.to_string()));
        if !state.all_down(group) {
            return Err(GatewayError::Rejected(format!(
                "{}: ERROR (group still running)",
                group
            )));
        }
        state.load(group);
        Ok(())
    }

    async fn group_status(&self, group: &str) -> Result<GroupStatus> {
        self.check(group).await?;
        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::GroupStatus(group.to_string()));
        let members = state.group_mut(group)?;
        Ok(GroupStatus {
            members: members
                .iter()
                .map(|(name, state)| MemberStatus {
                    name: name.clone(),
                    state: *state,
                })
                .collect(),
        })
    }

    async fn start_group(&self, group: &str) -> Result<()> {
        self.check(group).await?;
        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::StartGroup(group.to_string()));
        state.group_mut(group)?;
        self.check_start(group, group).await?;
        for member in state.group_mut(group)?.values_mut() {
            *member = ProgramState::Running;
        }
        Ok(())
    }

    async fn stop_group(&self, group: &str) -> Result<()> {
        self.check(group).await?;
        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::StopGroup(group.to_string()));
        for member in state.group_mut(group)?.values_mut() {
            *member = ProgramState::Stopped;
        }
        state.record_down(group);
        Ok(())
    }

    async fn start_program(&self, group: &str, member: &str) -> Result<()> {
        self.check(group).await?;
        let mut state = self.state.lock().await;
        state
            .calls
            .push(GatewayCall::StartProgram(group.to_string(), member.to_string()));
        self.check_start(group, member).await?;
        let slot = state
            .group_mut(group)?
            .get_mut(member)
            .ok_or_else(|| GatewayError::Rejected(format!("{}: ERROR (no such process)", member)))?;
        *slot = ProgramState::Running;
        Ok(())
    }

    async fn stop_program(&self, group: &str, member: &str) -> Result<()> {
        self.check(group).await?;
        let mut state = self.state.lock().await;
        state
            .calls
            .push(GatewayCall::StopProgram(group.to_string(), member.to_string()));
        let slot = state
            .group_mut(group)?
            .get_mut(member)
            .ok_or_else(|| GatewayError::Rejected(format!("{}: ERROR (no such process)", member)))?;
        *slot = ProgramState::Stopped;
        state.record_down(group);
        Ok(())
    }

    async fn signal_process(&self, group: &str, member: &str, signal: Signal) -> Result<()> {
        self.check(group).await?;
        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::Signal(
            group.to_string(),
            member.to_string(),
            signal,
        ));
        match state.group_mut(group)?.get(member) {
            Some(ProgramState::Running) => Ok(()),
            _ => Err(GatewayError::Rejected(format!(
                "{}: ERROR (not running)",
                member
            ))),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::Shutdown);
        for members in state.groups.values_mut() {
            for member in members.values_mut() {
                *member = ProgramState::Stopped;
            }
        }
        Ok(())
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor gateway - the control surface of the supervisory daemon.
//!
//! The reconciler never spawns processes itself. It writes one config
//! fragment per instance and drives the daemon through this trait.

pub mod mock;
pub mod supervisor;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::{GatewayCall, MockGateway};
pub use supervisor::SupervisorctlGateway;

/// Errors from gateway operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// The daemon could not be reached.
    #[error("Supervisor unreachable: {0}")]
    Unreachable(String),

    /// The daemon refused the request.
    #[error("Supervisor rejected request: {0}")]
    Rejected(String),

    /// A blocking call did not reach its terminal state in time.
    #[error("Supervisor operation timed out: {0}")]
    Timeout(String),

    /// Writing or removing a fragment failed.
    #[error("Fragment I/O failed: {0}")]
    Io(String),
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Io(e.to_string())
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Supervisor definition of one program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSpec {
    /// Member name within the group
    pub name: String,
    /// Command line
    pub command: String,
    /// Working directory
    pub directory: PathBuf,
    /// Environment variables
    pub environment: BTreeMap<String, String>,
    /// Combined stdout/stderr log file
    pub log_file: PathBuf,
    /// Start with the daemon
    pub autostart: bool,
    /// Seconds a process must stay up to count as started
    pub start_secs: u32,
    /// Seconds to wait after the stop signal before killing
    pub stop_wait_secs: u32,
    /// Signal used to stop the program
    pub stop_signal: String,
}

/// State of one group member as reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramState {
    /// Not running
    Stopped,
    /// Spawned, not yet considered up
    Starting,
    /// Up
    Running,
    /// Stop signal sent, not yet exited
    Stopping,
    /// Could not be started
    Fatal,
}

impl ProgramState {
    /// Whether the member is in a state a stop request leaves it in.
    pub fn is_down(self) -> bool {
        matches!(self, ProgramState::Stopped | ProgramState::Fatal)
    }
}

/// Status of one group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    /// Member name
    pub name: String,
    /// Current state
    pub state: ProgramState,
}

/// Status of a process group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    /// Members of the group
    pub members: Vec<MemberStatus>,
}

impl GroupStatus {
    /// True when every member is stopped or fatal.
    pub fn all_down(&self) -> bool {
        self.members.iter().all(|m| m.state.is_down())
    }

    /// State of a member, if the group has it.
    pub fn state_of(&self, member: &str) -> Option<ProgramState> {
        self.members
            .iter()
            .find(|m| m.name == member)
            .map(|m| m.state)
    }
}

/// Trait for supervisory daemon control surfaces.
///
/// Gateways are pure control adapters - they know nothing about topology
/// or stored state. Blocking calls return once the daemon reports the
/// terminal state or a bounded timeout elapses.
#[async_trait]
pub trait SupervisorGateway: Send + Sync {
    /// Gateway type identifier (e.g., "supervisorctl", "mock")
    fn gateway_type(&self) -> &'static str;

    /// Idempotently write the configuration of one group.
    async fn apply_fragment(&self, group: &str, programs: &[ProgramSpec]) -> Result<()>;

    /// Delete a previously applied fragment.
    async fn remove_fragment(&self, group: &str) -> Result<()>;

    /// Make the daemon re-read all fragments.
    ///
    /// New groups are added and removed ones dropped. A changed fragment
    /// only takes effect for a group whose members are all down; running
    /// groups keep their loaded definition until [`load_group`](Self::load_group).
    async fn reload_daemon_config(&self) -> Result<()>;

    /// Whether the daemon runs an older definition of `group` than its
    /// fragment declares.
    async fn has_pending_definition(&self, group: &str) -> Result<bool>;

    /// Load the fragment of a fully stopped group into the daemon.
    async fn load_group(&self, group: &str) -> Result<()>;

    /// Query the state of every member of a group.
    async fn group_status(&self, group: &str) -> Result<GroupStatus>;

    /// Start every member of a group.
    async fn start_group(&self, group: &str) -> Result<()>;

    /// Stop every member of a group.
    async fn stop_group(&self, group: &str) -> Result<()>;

    /// Start one member.
    async fn start_program(&self, group: &str, member: &str) -> Result<()>;

    /// Stop one member.
    async fn stop_program(&self, group: &str, member: &str) -> Result<()>;

    /// Deliver a signal to one member's process.
    async fn signal_process(&self, group: &str, member: &str, signal: Signal) -> Result<()>;

    /// Stop the daemon itself.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

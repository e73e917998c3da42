// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run reporting.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use super::plan::Classification;

/// State of an instance during a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "kebab-case")]
pub enum InstanceState {
    /// Nothing was done yet
    Unchanged,
    /// Fragment being written or removed
    Regenerating,
    /// Daemon being driven
    Applying,
    /// Reached the desired state
    Converged,
    /// Gave up for this run
    Blocked(String),
}

impl InstanceState {
    /// Whether the instance ended up blocked.
    pub fn is_blocked(&self) -> bool {
        matches!(self, InstanceState::Blocked(_))
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Unchanged => write!(f, "unchanged"),
            InstanceState::Regenerating => write!(f, "regenerating"),
            InstanceState::Applying => write!(f, "applying"),
            InstanceState::Converged => write!(f, "converged"),
            InstanceState::Blocked(reason) => write!(f, "blocked: {}", reason),
        }
    }
}

/// Outcome of reconciling one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceReport {
    /// Instance name
    pub instance: String,
    /// How the instance changed
    pub classification: Classification,
    /// Terminal state
    pub state: InstanceState,
    /// Warnings raised while planning or applying
    pub warnings: Vec<String>,
}

/// Lifecycle action requested after reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Start every member
    Start,
    /// Stop every member
    Stop,
    /// Stop then start every member
    Restart,
    /// Signal-reload where possible, restart otherwise
    Reload,
    /// Like reload, one readiness-gated member at a time
    Graceful,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::Reload => "reload",
            Action::Graceful => "graceful",
        };
        f.pad(s)
    }
}

/// Outcome of a lifecycle action on one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ActionOutcome {
    /// Every member handled
    Done,
    /// The action failed before touching any member, or all at once
    Failed {
        /// Error message
        reason: String,
    },
    /// A member-by-member sequence stopped part way
    Partial {
        /// Members that were cycled successfully
        updated: Vec<String>,
        /// Member the sequence stopped at
        failed: String,
        /// Members not reached
        untouched: Vec<String>,
        /// Error message
        reason: String,
    },
}

impl ActionOutcome {
    /// Whether the action completed.
    pub fn is_done(&self) -> bool {
        matches!(self, ActionOutcome::Done)
    }
}

/// Lifecycle action result for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReport {
    /// Instance name
    pub instance: String,
    /// Requested action
    pub action: Action,
    /// What happened
    pub outcome: ActionOutcome,
}

/// Everything an invocation reports to the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Per-instance reconciliation results
    pub instances: Vec<InstanceReport>,
    /// Per-instance lifecycle action results
    pub actions: Vec<ActionReport>,
    /// Sources whose declarations were partly replaced by defaults
    pub degraded: Vec<(PathBuf, Vec<String>)>,
    /// Sources that could not be read; their instances were left alone
    pub pinned: Vec<(PathBuf, String)>,
    /// Instance filter entries that matched nothing
    pub unknown_instances: Vec<String>,
    /// Failures not tied to a single instance
    pub errors: Vec<String>,
}

impl RunSummary {
    /// True when no instance is blocked and every action completed.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
            && self.instances.iter().all(|r| !r.state.is_blocked())
            && self.actions.iter().all(|a| a.outcome.is_done())
    }

    /// Names of blocked instances.
    pub fn blocked(&self) -> Vec<&str> {
        self.instances
            .iter()
            .filter(|r| r.state.is_blocked())
            .map(|r| r.instance.as_str())
            .collect()
    }

    /// Report for one instance.
    pub fn instance(&self, name: &str) -> Option<&InstanceReport> {
        self.instances.iter().find(|r| r.instance == name)
    }

    /// Action result for one instance.
    pub fn action(&self, name: &str) -> Option<&ActionReport> {
        self.actions.iter().find(|r| r.instance == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, state: InstanceState) -> InstanceReport {
        InstanceReport {
            instance: name.to_string(),
            classification: Classification::Unchanged,
            state,
            warnings: Vec::new(),
        }
    }

    #[test]
    fn test_blocked_instance_fails_the_run() {
        let mut summary = RunSummary::default();
        summary.instances.push(report("a", InstanceState::Converged));
        assert!(summary.is_success());

        summary
            .instances
            .push(report("b", InstanceState::Blocked("unreachable".to_string())));
        assert!(!summary.is_success());
        assert_eq!(summary.blocked(), vec!["b"]);
    }

    #[test]
    fn test_partial_action_fails_the_run() {
        let mut summary = RunSummary::default();
        summary.actions.push(ActionReport {
            instance: "a".to_string(),
            action: Action::Graceful,
            outcome: ActionOutcome::Partial {
                updated: vec!["g0".to_string()],
                failed: "g1".to_string(),
                untouched: vec!["g2".to_string()],
                reason: "timeout".to_string(),
            },
        });
        assert!(!summary.is_success());
        assert_eq!(summary.action("a").map(|a| a.action), Some(Action::Graceful));
    }
}

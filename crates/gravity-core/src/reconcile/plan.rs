// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance classification and operation planning.
//!
//! Each changed instance is put into exactly one [`Classification`], which
//! fixes the ordered list of gateway operations that converge it:
//!
//! | Classification | Operations |
//! |----------------|------------|
//! | `New` | apply fragment, reload daemon config, start group |
//! | `MembersAdded` | stop group, apply fragment, reload daemon config, start group |
//! | `SignalReload` | apply fragment, SIGHUP each modified member |
//! | `FullRestart` | stop group, apply fragment, reload daemon config, start group |
//! | `Empty` | stop group, remove fragment |
//!
//! The daemon only adds or removes programs of a group that is fully
//! stopped, which is why every membership change of a running group goes
//! through a group stop.

use std::fmt;

use nix::sys::signal::Signal;
use serde::Serialize;

use crate::config::AddMemberPolicy;
use crate::topology::Instance;

use super::diff::{ChangeSet, InstanceDelta};

/// How an instance changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    /// Nothing to do
    Unchanged,
    /// Not present in the stored topology
    New,
    /// Only new members, nothing removed or modified
    MembersAdded,
    /// Only modifications of signal-reloadable members
    SignalReload,
    /// Anything else that changes a running group
    FullRestart,
    /// No members left; torn down and dropped
    Empty,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::Unchanged => "unchanged",
            Classification::New => "new",
            Classification::MembersAdded => "members-added",
            Classification::SignalReload => "signal-reload",
            Classification::FullRestart => "full-restart",
            Classification::Empty => "empty",
        };
        f.pad(s)
    }
}

/// One gateway operation of an instance sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Stop the group and confirm every member is down
    StopGroup,
    /// Write the instance's fragment
    ApplyFragment,
    /// Delete the instance's fragment
    RemoveFragment,
    /// Have the daemon re-read its fragments
    ReloadDaemonConfig,
    /// Start the group
    StartGroup,
    /// Signal one member
    Signal {
        /// Member name
        member: String,
        /// Signal to deliver
        signal: Signal,
    },
}

/// Planned sequence for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePlan {
    /// Instance name
    pub instance: String,
    /// How the instance changed
    pub classification: Classification,
    /// Operations, in execution order
    pub operations: Vec<Operation>,
    /// Operator-visible warnings
    pub warnings: Vec<String>,
    /// Set when the instance must not be touched this run
    pub deferred: Option<String>,
}

/// Classify one instance of a change set.
pub fn classify(
    changes: &ChangeSet,
    instance: &str,
    desired: Option<&Instance>,
) -> Classification {
    if changes.instances_empty.contains(instance) {
        return Classification::Empty;
    }
    if changes.instances_new.contains(instance) {
        return Classification::New;
    }
    if !changes.instances_touched.contains(instance) {
        return Classification::Unchanged;
    }

    let delta = changes.delta(instance);
    if delta.removed.is_empty() && delta.modified.is_empty() {
        return Classification::MembersAdded;
    }
    if delta.same_members() && all_signal_reloadable(&delta, desired) {
        return Classification::SignalReload;
    }
    Classification::FullRestart
}

fn all_signal_reloadable(delta: &InstanceDelta, desired: Option<&Instance>) -> bool {
    let Some(instance) = desired else {
        return false;
    };
    delta.modified.iter().all(|name| {
        instance
            .services
            .get(name)
            .is_some_and(|s| s.kind.is_signal_reloadable())
    })
}

/// Plan the operations converging one instance.
pub fn plan_instance(
    changes: &ChangeSet,
    instance: &str,
    desired: Option<&Instance>,
    policy: AddMemberPolicy,
) -> InstancePlan {
    let classification = classify(changes, instance, desired);
    let mut plan = InstancePlan {
        instance: instance.to_string(),
        classification,
        operations: Vec::new(),
        warnings: Vec::new(),
        deferred: None,
    };

    match classification {
        Classification::Unchanged => {}
        Classification::New => {
            plan.operations = vec![
                Operation::ApplyFragment,
                Operation::ReloadDaemonConfig,
                Operation::StartGroup,
            ];
        }
        Classification::MembersAdded => {
            let added = changes.delta(instance).added.join(", ");
            match policy {
                AddMemberPolicy::Restart => {
                    plan.warnings.push(format!(
                        "adding members ({}) requires stopping and restarting the whole group",
                        added
                    ));
                    plan.operations = restart_sequence();
                }
                AddMemberPolicy::Defer => {
                    plan.deferred = Some(format!(
                        "adding members ({}) requires a group restart, deferred by policy",
                        added
                    ));
                }
            }
        }
        Classification::SignalReload => {
            plan.operations.push(Operation::ApplyFragment);
            plan.operations.extend(
                changes
                    .delta(instance)
                    .modified
                    .into_iter()
                    .map(|member| Operation::Signal {
                        member,
                        signal: Signal::SIGHUP,
                    }),
            );
        }
        Classification::FullRestart => {
            plan.operations = restart_sequence();
        }
        Classification::Empty => {
            plan.operations = vec![Operation::StopGroup, Operation::RemoveFragment];
        }
    }
    plan
}

fn restart_sequence() -> Vec<Operation> {
    vec![
        Operation::StopGroup,
        Operation::ApplyFragment,
        Operation::ReloadDaemonConfig,
        Operation::StartGroup,
    ]
}

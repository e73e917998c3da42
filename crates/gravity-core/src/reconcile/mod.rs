// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation engine.
//!
//! A pass diffs the freshly built topology against the stored one
//! ([`diff`]), classifies every changed instance and plans its gateway
//! operations ([`plan`]), then drives the gateway through those plans
//! ([`executor`]). Member-by-member restarts used by graceful reloads live
//! in [`graceful`].

pub mod diff;
pub mod executor;
pub mod graceful;
pub mod plan;
pub mod summary;

pub use diff::{ChangeSet, InstanceDelta, diff, diff_records};
pub use executor::{Reconciler, Reconciliation};
pub use graceful::{ReadinessBounds, cycle_members, wait_ready};
pub use plan::{Classification, InstancePlan, Operation, classify, plan_instance};
pub use summary::{
    Action, ActionOutcome, ActionReport, InstanceReport, InstanceState, RunSummary,
};

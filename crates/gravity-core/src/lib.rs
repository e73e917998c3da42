// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gravity Core - Declarative Process Management for Galaxy Servers
//!
//! This crate keeps the processes of one or more Galaxy server instances in
//! line with their configuration files. Operators register YAML config
//! files; every run rebuilds the desired set of services from them, diffs it
//! against the topology recorded by the previous run, and drives a
//! supervisord daemon to converge with as few disruptive restarts as
//! possible.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐     ┌────────────────────┐
//! │  Config sources    │────►│  Topology builder  │
//! │  (galaxy.yml)      │     │  (pure)            │
//! └────────────────────┘     └─────────┬──────────┘
//!                                      │ desired
//!                                      ▼
//! ┌────────────────────┐     ┌────────────────────┐     ┌──────────────────┐
//! │  State store       │◄───►│    Reconciler      │────►│ Supervisor       │
//! │  (locked JSON)     │     │ diff / plan / run  │◄────│ gateway          │
//! └────────────────────┘     └─────────┬──────────┘     └──────────────────┘
//!                                      │ graceful only
//!                                      ▼
//!                            ┌────────────────────┐
//!                            │  Liveness probe    │
//!                            └────────────────────┘
//! ```
//!
//! # Instance State Machine
//!
//! ```text
//!   ┌───────────┐     ┌──────────────┐     ┌──────────┐     ┌───────────┐
//!   │ UNCHANGED │────►│ REGENERATING │────►│ APPLYING │────►│ CONVERGED │
//!   └───────────┘     └──────┬───────┘     └────┬─────┘     └───────────┘
//!                            │                  │
//!                            └────────┬─────────┘
//!                                     ▼
//!                               ┌──────────┐
//!                               │ BLOCKED  │
//!                               └──────────┘
//! ```
//!
//! A blocked instance keeps its previously stored record, so the next run
//! retries it from the same baseline. Other instances are unaffected.
//!
//! # Operations
//!
//! | Operation | Supervisor | Description |
//! |-----------|------------|-------------|
//! | `add_source` | Yes | Register config files (optionally with a default Galaxy root), then reconcile |
//! | `remove_source` | No | Deregister by path or instance name |
//! | `rename_source` | No | Move a registration to a new path |
//! | `list_sources` / `list_instances` | No | Inspect the registry |
//! | `get_source_details` | No | Inspect one registered file |
//! | `update` | Yes | Reconcile only |
//! | `force_update` | Yes | Reconcile, reapplying every instance |
//! | `start` / `stop` / `restart` | Yes | Reconcile, then act on groups; `restart` loads changed definitions |
//! | `reload` | Yes | Reconcile, SIGHUP where supported, restart the rest |
//! | `graceful` | Yes | Like reload, one readiness-gated member at a time |
//! | `shutdown` | Yes | Stop every group and the daemon |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GRAVITY_STATE_DIR` | `~/.config/galaxy-gravity` | State directory |
//! | `GRAVITY_LOCK_TIMEOUT_SECS` | `10` | Bounded wait for the state lock |
//! | `GRAVITY_COMMAND_TIMEOUT_SECS` | `60` | Bound for supervisor commands |
//! | `GRAVITY_MEMBER_READY_TIMEOUT_SECS` | `30` | Graceful per-member readiness bound |
//! | `GRAVITY_RUN_TIMEOUT_SECS` | `600` | Overall run deadline |
//! | `GRAVITY_ADD_MEMBER_POLICY` | `restart` | `restart` or `defer` |
//! | `GRAVITY_SUPERVISORCTL` | `supervisorctl` | Control binary |
//! | `GRAVITY_SUPERVISORD` | `supervisord` | Daemon binary |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types
//! - [`source`]: Config file parsing
//! - [`topology`]: Desired instances and services
//! - [`state`]: Locked, persisted state
//! - [`reconcile`]: Diffing, planning and applying changes
//! - [`dispatch`]: Lifecycle actions on converged instances
//! - [`gateway`]: Supervisor control surface
//! - [`probe`]: Readiness checks
//! - [`manager`]: The public operation surface

#![deny(missing_docs)]

/// Readiness poll backoff.
pub mod backoff;

/// Configuration loaded from environment variables.
pub mod config;

/// Lifecycle actions on converged instances.
pub mod dispatch;

/// Error types for gravity operations.
pub mod error;

/// Supervisor control surface (supervisorctl, mock).
pub mod gateway;

/// Registry and lifecycle operations.
pub mod manager;

/// Readiness checks for graceful restarts.
pub mod probe;

/// Topology diffing, planning and execution.
pub mod reconcile;

/// Config source parsing.
pub mod source;

/// Persisted state and its lock.
pub mod state;

/// Desired instances and services.
pub mod topology;

pub use config::{AddMemberPolicy, Config};
pub use error::{Error, Result};
pub use manager::ProcessManager;
pub use reconcile::RunSummary;

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for gravity-core.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Gravity errors.
///
/// Only global preconditions surface as `Err`; per-instance failures are
/// accumulated into a [`RunSummary`](crate::reconcile::RunSummary).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML deserialization failed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Supervisor gateway call failed outside of a per-instance sequence.
    #[error("Gateway error: {0}")]
    Gateway(#[from] crate::gateway::GatewayError),

    /// The state lock could not be acquired within the bounded wait.
    #[error("State directory {path} is locked by another run (waited {waited:?})")]
    LockContention {
        /// Path of the lock file.
        path: PathBuf,
        /// How long we waited before giving up.
        waited: Duration,
    },

    /// The persisted state could not be decoded.
    #[error("State file {path} is corrupt: {reason}")]
    StateCorrupt {
        /// Path of the state file.
        path: PathBuf,
        /// Decoder message.
        reason: String,
    },

    /// The config file is not registered.
    #[error("{0} is not registered")]
    NotRegistered(PathBuf),

    /// The config file is already registered.
    #[error("{0} is already registered")]
    AlreadyRegistered(PathBuf),

    /// The file does not look like a supported configuration file.
    #[error("Cannot register {0}: file does not contain a `galaxy` section")]
    UnknownConfigType(PathBuf),

    /// A lifecycle operation ran with nothing registered.
    #[error("No instances registered (hint: `gravityctl add-source /path/to/galaxy.yml`)")]
    NoInstancesRegistered,

    /// A graceful member did not become ready in time.
    #[error("Service {service} did not become ready within {timeout:?}")]
    LivenessTimeout {
        /// Service identity (`instance/service`).
        service: String,
        /// The bound that elapsed.
        timeout: Duration,
    },

    /// Config sources resolved to an instance identity that must be unique.
    #[error("Instance name conflict for {instance}: {sources:?}")]
    NameConflict {
        /// Contested instance name.
        instance: String,
        /// Sources claiming it.
        sources: Vec<PathBuf>,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using Gravity Error.
pub type Result<T> = std::result::Result<T, Error>;

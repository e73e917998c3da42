// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration sources.
//!
//! A [`ConfigSource`] is one registered YAML file. Loading it extracts the
//! declarations that matter for topology: instance name, root directory,
//! environment, the web-gateway and job-queue sections and the job handlers.
//! Field-level problems degrade to defaults and are recorded as
//! diagnostics; only an unreadable file or a file that is not a Galaxy
//! configuration at all is an error.

mod job_conf;
mod parse;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub use job_conf::read_handler_ids;
pub use parse::parse_declarations;

/// Instance name used when a source does not set one.
pub const DEFAULT_INSTANCE_NAME: &str = "_default_";

/// Name of the top-level section a Galaxy config must contain.
pub const SERVER_SECTION: &str = "galaxy";

/// A web-gateway (gunicorn) declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayDecl {
    /// Server name; also the name of the resulting service
    pub server_name: String,
    /// Address to bind
    pub bind: String,
    /// Worker process count
    pub workers: u32,
    /// Worker timeout in seconds
    pub timeout: u32,
    /// Extra command line arguments
    pub extra_args: String,
    /// Preloading the app disables HUP-based reloads
    pub preload: bool,
    /// Service-specific environment
    pub environment: BTreeMap<String, String>,
}

/// A job-queue (celery) declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueueDecl {
    /// Worker concurrency
    pub concurrency: u32,
    /// Log level passed to the worker
    pub loglevel: String,
    /// Comma separated queue list
    pub queues: String,
    /// Worker pool implementation
    pub pool: String,
    /// Whether to run the periodic task scheduler
    pub enable_beat: bool,
    /// Service-specific environment
    pub environment: BTreeMap<String, String>,
}

/// A job handler declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerDecl {
    /// Handler id, also the service name
    pub name: String,
    /// Pool the handler attaches to, for dynamically numbered handlers
    pub pool: Option<String>,
}

/// Everything a source declares about its topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declarations {
    /// Explicit instance name, if the file sets one
    pub instance_name: Option<String>,
    /// Application root directory
    pub galaxy_root: PathBuf,
    /// Log directory override
    pub log_dir: Option<PathBuf>,
    /// Virtual environment whose `bin` is put first on `PATH`
    pub virtualenv: Option<PathBuf>,
    /// Environment applied to every service of this source
    pub environment: BTreeMap<String, String>,
    /// Web-gateway entries; empty when the section is absent
    pub gateways: Vec<GatewayDecl>,
    /// Job-queue section, if present
    pub job_queue: Option<JobQueueDecl>,
    /// Static and dynamic job handlers, in declaration order
    pub handlers: Vec<HandlerDecl>,
}

impl Declarations {
    /// The instance name this source resolves to.
    pub fn resolved_instance_name(&self) -> &str {
        self.instance_name.as_deref().unwrap_or(DEFAULT_INSTANCE_NAME)
    }

    /// Whether the web-gateway section is present.
    pub fn has_gateway(&self) -> bool {
        !self.gateways.is_empty()
    }
}

/// One registered configuration file, freshly parsed.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// Absolute path of the file
    pub path: PathBuf,
    /// Parsed declarations
    pub declarations: Declarations,
    /// SHA-256 of the file content
    pub fingerprint: String,
    /// Field-level parse problems that fell back to defaults
    pub diagnostics: Vec<String>,
}

impl ConfigSource {
    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_root(path, None)
    }

    /// Read and parse a config file, with the root given at registration
    /// for files that do not name one.
    pub fn load_with_root(path: &Path, default_root: Option<&Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let fingerprint = format!("{:x}", Sha256::digest(&bytes));
        let text = String::from_utf8_lossy(&bytes);
        let document: serde_yaml::Value = serde_yaml::from_str(&text)?;

        let (declarations, diagnostics) = parse_declarations(path, &document, default_root)
            .ok_or_else(|| Error::UnknownConfigType(path.to_path_buf()))?;

        for message in &diagnostics {
            tracing::warn!(source = %path.display(), "{}", message);
        }

        Ok(Self {
            path: path.to_path_buf(),
            declarations,
            fingerprint,
            diagnostics,
        })
    }

    /// The instance name this source resolves to.
    pub fn instance_name(&self) -> &str {
        self.declarations.resolved_instance_name()
    }

    /// Whether the instance name was set explicitly in the file.
    pub fn has_explicit_name(&self) -> bool {
        self.declarations.instance_name.is_some()
    }
}

/// Make a user-supplied path absolute without touching the filesystem.
pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    let expanded = crate::config::Config::expand_home(path);
    Ok(std::path::absolute(expanded)?)
}

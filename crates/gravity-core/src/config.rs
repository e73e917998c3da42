// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for gravity-core.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default directory name under the user's config home.
const STATE_DIR_NAME: &str = "galaxy-gravity";

/// What to do when an existing group gains new members.
///
/// The supervisory daemon cannot add programs to a running group, so adding
/// members forces a full group stop/start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddMemberPolicy {
    /// Stop and restart the group, logging a warning.
    #[default]
    Restart,
    /// Leave the group alone and mark the instance Blocked until an
    /// explicit `restart`.
    Defer,
}

impl std::str::FromStr for AddMemberPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "restart" => Ok(AddMemberPolicy::Restart),
            "defer" => Ok(AddMemberPolicy::Defer),
            _ => Err(ConfigError::InvalidValue {
                var: "GRAVITY_ADD_MEMBER_POLICY",
                value: s.to_string(),
            }),
        }
    }
}

/// Gravity configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the state file, lock and generated supervisor config
    pub state_dir: PathBuf,
    /// Bounded wait for the exclusive state lock
    pub lock_timeout: Duration,
    /// Bound for blocking start/stop calls against the supervisor
    pub command_timeout: Duration,
    /// How long a graceful member may take to report ready
    pub member_ready_timeout: Duration,
    /// Overall deadline for one run
    pub run_timeout: Duration,
    /// Behaviour when members are added to an existing group
    pub add_member_policy: AddMemberPolicy,
    /// `supervisorctl` binary
    pub supervisorctl: PathBuf,
    /// `supervisord` binary
    pub supervisord: PathBuf,
}

impl Config {
    /// Build a configuration with defaults rooted at `state_dir`.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            lock_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(60),
            member_ready_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(600),
            add_member_policy: AddMemberPolicy::Restart,
            supervisorctl: PathBuf::from("supervisorctl"),
            supervisord: PathBuf::from("supervisord"),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let state_dir = match std::env::var("GRAVITY_STATE_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_state_dir()?,
        };

        let mut config = Self::with_state_dir(state_dir);
        config.lock_timeout = secs_var("GRAVITY_LOCK_TIMEOUT_SECS", config.lock_timeout)?;
        config.command_timeout =
            secs_var("GRAVITY_COMMAND_TIMEOUT_SECS", config.command_timeout)?;
        config.member_ready_timeout = secs_var(
            "GRAVITY_MEMBER_READY_TIMEOUT_SECS",
            config.member_ready_timeout,
        )?;
        config.run_timeout = secs_var("GRAVITY_RUN_TIMEOUT_SECS", config.run_timeout)?;

        if let Ok(policy) = std::env::var("GRAVITY_ADD_MEMBER_POLICY") {
            config.add_member_policy = policy.parse()?;
        }
        if let Ok(bin) = std::env::var("GRAVITY_SUPERVISORCTL") {
            config.supervisorctl = PathBuf::from(bin);
        }
        if let Ok(bin) = std::env::var("GRAVITY_SUPERVISORD") {
            config.supervisord = PathBuf::from(bin);
        }

        Ok(config)
    }

    /// Path of the persisted state file.
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("configstate.json")
    }

    /// Default log directory for instances that do not set `log_dir`.
    pub fn default_log_dir(&self) -> PathBuf {
        self.state_dir.join("log")
    }

    /// Directory for generated supervisor configuration.
    pub fn supervisor_dir(&self) -> PathBuf {
        self.state_dir.join("supervisor")
    }

    /// Expand a leading `~` against `$HOME`.
    pub fn expand_home(path: &Path) -> PathBuf {
        match (path.strip_prefix("~"), std::env::var("HOME")) {
            (Ok(rest), Ok(home)) => PathBuf::from(home).join(rest),
            _ => path.to_path_buf(),
        }
    }
}

fn default_state_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join(STATE_DIR_NAME));
    }
    let home = std::env::var("HOME").map_err(|_| ConfigError::MissingEnvVar("HOME"))?;
    Ok(PathBuf::from(home).join(".config").join(STATE_DIR_NAME))
}

fn secs_var(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable holds an unusable value.
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_member_policy_parse() {
        assert_eq!(
            "restart".parse::<AddMemberPolicy>().unwrap(),
            AddMemberPolicy::Restart
        );
        assert_eq!(
            "DEFER".parse::<AddMemberPolicy>().unwrap(),
            AddMemberPolicy::Defer
        );
        assert!("sometimes".parse::<AddMemberPolicy>().is_err());
    }

    #[test]
    fn test_with_state_dir_paths() {
        let config = Config::with_state_dir("/tmp/gravity");
        assert_eq!(
            config.state_file(),
            PathBuf::from("/tmp/gravity/configstate.json")
        );
        assert_eq!(config.default_log_dir(), PathBuf::from("/tmp/gravity/log"));
        assert_eq!(config.add_member_policy, AddMemberPolicy::Restart);
    }
}

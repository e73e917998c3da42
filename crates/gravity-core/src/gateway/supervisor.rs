// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! supervisord gateway.
//!
//! Writes ini fragments into the include directory of a private
//! `supervisord.conf` and drives the daemon with `supervisorctl`.
//! The daemon is started on first use.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::*;
use crate::config::Config;

/// Exit status supervisorctl uses when `status` reports non-running members.
const STATUS_NOT_RUNNING: i32 = 3;

/// Per-process results of `start` and `stop` that already match the request.
const ALREADY_STARTED: &str = "ERROR (already started)";
const NOT_RUNNING: &str = "ERROR (not running)";

/// Gateway backed by a private supervisord instance.
pub struct SupervisorctlGateway {
    supervisor_dir: PathBuf,
    supervisorctl: PathBuf,
    supervisord: PathBuf,
    command_timeout: Duration,
    daemon: OnceCell<()>,
}

impl SupervisorctlGateway {
    /// Create a gateway rooted at the configured supervisor directory.
    pub fn new(config: &Config) -> Self {
        Self {
            supervisor_dir: config.supervisor_dir(),
            supervisorctl: config.supervisorctl.clone(),
            supervisord: config.supervisord.clone(),
            command_timeout: config.command_timeout,
            daemon: OnceCell::new(),
        }
    }

    /// Path of the main daemon configuration.
    pub fn conf_path(&self) -> PathBuf {
        self.supervisor_dir.join("supervisord.conf")
    }

    /// Directory holding per-group fragments.
    pub fn fragment_dir(&self) -> PathBuf {
        self.supervisor_dir.join("supervisord.conf.d")
    }

    fn fragment_path(&self, group: &str) -> PathBuf {
        self.fragment_dir().join(format!("{}.conf", group))
    }

    async fn ensure_daemon(&self) -> Result<()> {
        self.daemon
            .get_or_try_init(|| async {
                tokio::fs::create_dir_all(self.fragment_dir()).await?;
                let conf = render_daemon_conf(&self.supervisor_dir);
                write_atomic(&self.conf_path(), &conf).await?;

                if self.ctl(&["pid"]).await.map(|o| o.status.success()).unwrap_or(false) {
                    return Ok(());
                }

                info!(conf = %self.conf_path().display(), "Starting supervisord");
                let output = Command::new(&self.supervisord)
                    .arg("-c")
                    .arg(self.conf_path())
                    .output()
                    .await
                    .map_err(|e| {
                        GatewayError::Unreachable(format!(
                            "failed to run {}: {}",
                            self.supervisord.display(),
                            e
                        ))
                    })?;
                if !output.status.success() {
                    return Err(GatewayError::Unreachable(combined(&output)));
                }
                Ok::<(), GatewayError>(())
            })
            .await
            .map(|_| ())
    }

    async fn ctl(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, "supervisorctl");
        let run = Command::new(&self.supervisorctl)
            .arg("-c")
            .arg(self.conf_path())
            .args(args)
            .output();
        match tokio::time::timeout(self.command_timeout, run).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(GatewayError::Unreachable(format!(
                "failed to run {}: {}",
                self.supervisorctl.display(),
                e
            ))),
            Err(_) => Err(GatewayError::Timeout(format!(
                "supervisorctl {} after {:?}",
                args.join(" "),
                self.command_timeout
            ))),
        }
    }

    /// Run a control command that must succeed.
    async fn control(&self, args: &[&str]) -> Result<String> {
        self.control_allowing(args, None).await
    }

    /// Run a control command, accepting per-process errors that contain
    /// `settled` (e.g. `already started` for a start).
    async fn control_allowing(&self, args: &[&str], settled: Option<&str>) -> Result<String> {
        self.ensure_daemon().await?;
        let output = self.ctl(args).await?;
        let text = combined(&output);
        if succeeded(output.status.success(), &text, settled) {
            return Ok(text);
        }
        if is_connection_failure(&text) {
            Err(GatewayError::Unreachable(text))
        } else {
            Err(GatewayError::Rejected(text))
        }
    }
}

#[async_trait]
impl SupervisorGateway for SupervisorctlGateway {
    fn gateway_type(&self) -> &'static str {
        "supervisorctl"
    }

    async fn apply_fragment(&self, group: &str, programs: &[ProgramSpec]) -> Result<()> {
        tokio::fs::create_dir_all(self.fragment_dir()).await?;
        let fragment = render_fragment(group, programs);
        write_atomic(&self.fragment_path(group), &fragment).await?;
        debug!(group = %group, programs = programs.len(), "Wrote supervisor fragment");
        Ok(())
    }

    async fn remove_fragment(&self, group: &str) -> Result<()> {
        match tokio::fs::remove_file(self.fragment_path(group)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-read fragments, adding new groups and dropping removed ones.
    ///
    /// Changed groups are only updated while none of their members run:
    /// `supervisorctl update` restarts a changed group, which would undo a
    /// signal-only reload.
    async fn reload_daemon_config(&self) -> Result<()> {
        let reread = self.control(&["reread"]).await?;
        for (group, change) in parse_reread(&reread) {
            match change {
                RereadChange::Available => {
                    self.control(&["add", group]).await?;
                }
                RereadChange::Disappeared => {
                    self.control(&["remove", group]).await?;
                }
                RereadChange::Changed => {
                    let status = self.group_status(group).await?;
                    if status.all_down() {
                        self.control(&["update", group]).await?;
                    } else {
                        warn!(group = %group, "Group is running, new definition applies on next restart");
                    }
                }
            }
        }
        Ok(())
    }

    async fn has_pending_definition(&self, group: &str) -> Result<bool> {
        let reread = self.control(&["reread"]).await?;
        Ok(parse_reread(&reread)
            .iter()
            .any(|(name, change)| *name == group && *change == RereadChange::Changed))
    }

    async fn load_group(&self, group: &str) -> Result<()> {
        let reread = self.control(&["reread"]).await?;
        let change = parse_reread(&reread)
            .into_iter()
            .find(|(name, _)| *name == group)
            .map(|(_, change)| change);
        match change {
            Some(RereadChange::Changed) => {
                if !self.group_status(group).await?.all_down() {
                    return Err(GatewayError::Rejected(format!(
                        "{}: group still running, cannot load its definition",
                        group
                    )));
                }
                self.control(&["update", group]).await?;
            }
            Some(RereadChange::Available) => {
                self.control(&["add", group]).await?;
            }
            Some(RereadChange::Disappeared) | None => {}
        }
        Ok(())
    }

    async fn group_status(&self, group: &str) -> Result<GroupStatus> {
        self.ensure_daemon().await?;
        let target = format!("{}:*", group);
        let output = self.ctl(&["status", &target]).await?;
        let text = combined(&output);
        let acceptable = output.status.success() || output.status.code() == Some(STATUS_NOT_RUNNING);
        if !acceptable || text.contains("no such group") {
            return Err(if is_connection_failure(&text) {
                GatewayError::Unreachable(text)
            } else {
                GatewayError::Rejected(text)
            });
        }
        Ok(parse_status(group, &text))
    }

    async fn start_group(&self, group: &str) -> Result<()> {
        let target = format!("{}:*", group);
        self.control_allowing(&["start", &target], Some(ALREADY_STARTED))
            .await
            .map(|_| ())
    }

    async fn stop_group(&self, group: &str) -> Result<()> {
        let target = format!("{}:*", group);
        self.control_allowing(&["stop", &target], Some(NOT_RUNNING))
            .await
            .map(|_| ())
    }

    async fn start_program(&self, group: &str, member: &str) -> Result<()> {
        let target = process_target(group, member);
        self.control_allowing(&["start", &target], Some(ALREADY_STARTED))
            .await
            .map(|_| ())
    }

    async fn stop_program(&self, group: &str, member: &str) -> Result<()> {
        let target = process_target(group, member);
        self.control_allowing(&["stop", &target], Some(NOT_RUNNING))
            .await
            .map(|_| ())
    }

    async fn signal_process(&self, group: &str, member: &str, signal: Signal) -> Result<()> {
        let name = signal.as_str().trim_start_matches("SIG");
        let target = process_target(group, member);
        self.control(&["signal", name, &target]).await.map(|_| ())
    }

    async fn shutdown(&self) -> Result<()> {
        let output = self.ctl(&["shutdown"]).await?;
        let text = combined(&output);
        if output.status.success() || is_connection_failure(&text) {
            // A daemon that is not running is already shut down.
            return Ok(());
        }
        Err(GatewayError::Rejected(text))
    }
}

fn process_target(group: &str, member: &str) -> String {
    format!("{}:{}_{}", group, group, member)
}

/// A control command succeeded when it reports no process errors other
/// than `settled` ones. Those make supervisorctl exit non-zero, so the exit
/// status only counts when nothing was reported.
fn succeeded(exit_ok: bool, text: &str, settled: Option<&str>) -> bool {
    let errors: Vec<&str> = text.lines().filter(|l| l.contains("ERROR")).collect();
    if errors.is_empty() {
        return exit_ok;
    }
    errors
        .iter()
        .all(|line| settled.is_some_and(|s| line.contains(s)))
}

fn combined(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim().to_string()
}

fn is_connection_failure(text: &str) -> bool {
    text.contains("refused connection")
        || text.contains("no such file")
        || text.contains("Connection refused")
}

async fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Render the private daemon configuration.
pub fn render_daemon_conf(dir: &Path) -> String {
    let dir = dir.display();
    format!(
        "[unix_http_server]\n\
         file = {dir}/supervisor.sock\n\
         \n\
         [supervisord]\n\
         logfile = {dir}/supervisord.log\n\
         pidfile = {dir}/supervisord.pid\n\
         loglevel = info\n\
         nodaemon = false\n\
         \n\
         [rpcinterface:supervisor]\n\
         supervisor.rpcinterface_factory = supervisor.rpcinterface:make_main_rpcinterface\n\
         \n\
         [supervisorctl]\n\
         serverurl = unix://{dir}/supervisor.sock\n\
         \n\
         [include]\n\
         files = {dir}/supervisord.conf.d/*.conf\n"
    )
}

/// Render the ini fragment of one group.
pub fn render_fragment(group: &str, programs: &[ProgramSpec]) -> String {
    let mut out = String::from(
        ";\n; This file is maintained by gravity - CHANGES WILL BE OVERWRITTEN\n;\n",
    );
    for program in programs {
        let environment = program
            .environment
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "\\\"")))
            .collect::<Vec<_>>()
            .join(",");
        let _ = write!(
            out,
            "\n[program:{group}_{name}]\n\
             command = {command}\n\
             directory = {directory}\n\
             autostart = {autostart}\n\
             autorestart = true\n\
             startsecs = {start_secs}\n\
             stopwaitsecs = {stop_wait_secs}\n\
             stopsignal = {stop_signal}\n\
             stopasgroup = true\n\
             killasgroup = true\n\
             redirect_stderr = true\n\
             stdout_logfile = {log_file}\n\
             environment = {environment}\n",
            name = program.name,
            command = program.command,
            directory = program.directory.display(),
            autostart = program.autostart,
            start_secs = program.start_secs,
            stop_wait_secs = program.stop_wait_secs,
            stop_signal = program.stop_signal,
            log_file = program.log_file.display(),
        );
    }
    let members = programs
        .iter()
        .map(|p| format!("{}_{}", group, p.name))
        .collect::<Vec<_>>()
        .join(",");
    let _ = write!(out, "\n[group:{group}]\nprograms = {members}\n");
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RereadChange {
    Available,
    Changed,
    Disappeared,
}

fn parse_reread(text: &str) -> Vec<(&str, RereadChange)> {
    text.lines()
        .filter_map(|line| {
            let (group, change) = line.split_once(':')?;
            let change = match change.trim() {
                "available" => RereadChange::Available,
                "changed" => RereadChange::Changed,
                "disappeared" => RereadChange::Disappeared,
                _ => return None,
            };
            Some((group.trim(), change))
        })
        .collect()
}

fn parse_status(group: &str, text: &str) -> GroupStatus {
    let prefix = format!("{}:{}_", group, group);
    let members = text
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let target = fields.next()?;
            let state = fields.next()?;
            let name = target.strip_prefix(&prefix)?;
            let state = match state {
                "RUNNING" => ProgramState::Running,
                "STOPPING" => ProgramState::Stopping,
                "STARTING" | "BACKOFF" => ProgramState::Starting,
                "STOPPED" | "EXITED" => ProgramState::Stopped,
                _ => ProgramState::Fatal,
            };
            Some(MemberStatus {
                name: name.to_string(),
                state,
            })
        })
        .collect();
    GroupStatus { members }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Topology building.
//!
//! Combines parsed [`ConfigSource`]s into the desired set of instances and
//! services. Building is pure and deterministic: the same sources always
//! produce the same service identities, commands and fingerprints.
//!
//! Per source, the contributed services are:
//! - one web gateway per `gunicorn` entry,
//! - a standalone application (`main`) when there is no `gunicorn` section,
//! - a `celery` worker and `celery-beat` scheduler when `celery` is present,
//! - one job handler per declared handler, except handlers whose id is
//!   already taken by a web gateway of the same instance.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::gateway::ProgramSpec;
use crate::source::{ConfigSource, Declarations, GatewayDecl, HandlerDecl, JobQueueDecl};

/// Server name of the standalone application service.
pub const STANDALONE_SERVER_NAME: &str = "main";

/// How a service reacts to configuration changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// Web gateway that must be restarted to pick up changes
    WebGateway,
    /// Web gateway whose master re-execs workers on SIGHUP
    SignalReloadableGateway,
    /// Application process without live reload
    StandaloneApplication,
    /// Job handler process
    JobHandler,
}

impl ServiceKind {
    /// Whether SIGHUP-based reload is valid for this kind.
    pub fn is_signal_reloadable(self) -> bool {
        matches!(self, ServiceKind::SignalReloadableGateway)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::WebGateway => write!(f, "web-gateway"),
            ServiceKind::SignalReloadableGateway => write!(f, "signal-reloadable-gateway"),
            ServiceKind::StandaloneApplication => write!(f, "standalone-application"),
            ServiceKind::JobHandler => write!(f, "job-handler"),
        }
    }
}

/// What program a service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    /// gunicorn web server
    Gunicorn,
    /// Standalone application server
    Standalone,
    /// celery worker
    Celery,
    /// celery beat scheduler
    CeleryBeat,
    /// Job handler
    Handler,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceType::Gunicorn => write!(f, "gunicorn"),
            ServiceType::Standalone => write!(f, "standalone"),
            ServiceType::Celery => write!(f, "celery"),
            ServiceType::CeleryBeat => write!(f, "celery-beat"),
            ServiceType::Handler => write!(f, "handler"),
        }
    }
}

/// Stable identity of a service: instance name plus service name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    /// Owning instance
    pub instance: String,
    /// Service name, unique within the instance
    pub service: String,
}

impl ServiceId {
    /// Create a service identity.
    pub fn new(instance: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance, self.service)
    }
}

/// A single service declaration, tagged by what it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceDecl {
    /// A `gunicorn` entry
    WebGateway(GatewayDecl),
    /// The application server used when no gateway is declared
    Standalone,
    /// The celery worker of a `celery` section
    JobQueueWorker(JobQueueDecl),
    /// The celery beat scheduler of a `celery` section
    JobQueueBeat(JobQueueDecl),
    /// A job handler
    JobHandler(HandlerDecl),
}

impl ServiceDecl {
    /// Classify the declaration into its service kind.
    pub fn classify(&self) -> ServiceKind {
        match self {
            ServiceDecl::WebGateway(gateway) if gateway.preload => ServiceKind::WebGateway,
            ServiceDecl::WebGateway(_) => ServiceKind::SignalReloadableGateway,
            ServiceDecl::Standalone
            | ServiceDecl::JobQueueWorker(_)
            | ServiceDecl::JobQueueBeat(_) => ServiceKind::StandaloneApplication,
            ServiceDecl::JobHandler(_) => ServiceKind::JobHandler,
        }
    }

    /// The program this declaration runs.
    pub fn service_type(&self) -> ServiceType {
        match self {
            ServiceDecl::WebGateway(_) => ServiceType::Gunicorn,
            ServiceDecl::Standalone => ServiceType::Standalone,
            ServiceDecl::JobQueueWorker(_) => ServiceType::Celery,
            ServiceDecl::JobQueueBeat(_) => ServiceType::CeleryBeat,
            ServiceDecl::JobHandler(_) => ServiceType::Handler,
        }
    }

    /// Service name within the instance.
    pub fn name(&self) -> &str {
        match self {
            ServiceDecl::WebGateway(gateway) => &gateway.server_name,
            ServiceDecl::Standalone => STANDALONE_SERVER_NAME,
            ServiceDecl::JobQueueWorker(_) => "celery",
            ServiceDecl::JobQueueBeat(_) => "celery-beat",
            ServiceDecl::JobHandler(handler) => &handler.name,
        }
    }

    /// Pool the service belongs to, if any.
    pub fn pool(&self) -> Option<&str> {
        match self {
            ServiceDecl::JobHandler(handler) => handler.pool.as_deref(),
            _ => None,
        }
    }

    fn command(&self, config_file: &Path, state_dir: &Path) -> String {
        match self {
            ServiceDecl::WebGateway(g) => {
                let mut command = format!(
                    "gunicorn 'galaxy.webapps.galaxy.fast_factory:factory()' --timeout {} \
                     --pythonpath lib -k galaxy.webapps.galaxy.workers.Worker -b {} \
                     --workers={} --config python:galaxy.web_stack.gunicorn_config",
                    g.timeout, g.bind, g.workers
                );
                if g.preload {
                    command.push_str(" --preload");
                }
                if !g.extra_args.is_empty() {
                    command.push(' ');
                    command.push_str(&g.extra_args);
                }
                command
            }
            ServiceDecl::Standalone => format!(
                "python ./lib/galaxy/main.py -c {} --server-name={}",
                config_file.display(),
                STANDALONE_SERVER_NAME
            ),
            ServiceDecl::JobQueueWorker(q) => format!(
                "celery --app galaxy.celery worker --concurrency {} --loglevel {} --pool {} --queues {}",
                q.concurrency, q.loglevel, q.pool, q.queues
            ),
            ServiceDecl::JobQueueBeat(q) => format!(
                "celery --app galaxy.celery beat --loglevel {} --schedule {}",
                q.loglevel,
                state_dir.join("celery-beat-schedule").display()
            ),
            ServiceDecl::JobHandler(h) => {
                let mut command = format!(
                    "python ./lib/galaxy/main.py -c {} --server-name={}",
                    config_file.display(),
                    h.name
                );
                if let Some(pool) = &h.pool {
                    command.push_str(&format!(" --attach-to-pool={}", pool));
                }
                command
            }
        }
    }

    fn environment(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            ServiceDecl::WebGateway(g) => Some(&g.environment),
            ServiceDecl::JobQueueWorker(q) | ServiceDecl::JobQueueBeat(q) => Some(&q.environment),
            ServiceDecl::Standalone | ServiceDecl::JobHandler(_) => None,
        }
    }
}

/// A process-managed unit inside an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Stable identity
    pub id: ServiceId,
    /// Reload semantics
    pub kind: ServiceKind,
    /// What program runs
    pub service_type: ServiceType,
    /// Pool membership, for numbered handlers
    pub pool: Option<String>,
    /// Source that contributed this service
    pub source: PathBuf,
    /// Rendered command template
    pub program: ProgramSpec,
    /// SHA-256 over the rendered command template
    pub fingerprint: String,
    /// Whether the service should be running
    pub desired_running: bool,
}

/// A named group of services, mapped to one supervisor group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instance {
    /// Instance name
    pub name: String,
    /// Sources contributing to this instance
    pub sources: BTreeSet<PathBuf>,
    /// Member services by service name
    pub services: BTreeMap<String, Service>,
}

impl Instance {
    /// Program specs for every member, in service name order.
    pub fn program_specs(&self) -> Vec<ProgramSpec> {
        self.services.values().map(|s| s.program.clone()).collect()
    }
}

/// The desired set of instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    /// Instances by name
    pub instances: BTreeMap<String, Instance>,
}

impl Topology {
    /// Iterate over every service of every instance.
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.instances.values().flat_map(|i| i.services.values())
    }
}

/// Sources that resolved to an instance name that must be unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameConflict {
    /// Contested instance name
    pub instance: String,
    /// Sources claiming it
    pub sources: Vec<PathBuf>,
}

/// Result of a topology build.
#[derive(Debug, Clone, Default)]
pub struct Build {
    /// Instances that built cleanly
    pub topology: Topology,
    /// Instances left out because of a name conflict
    pub conflicts: Vec<NameConflict>,
}

/// Paths the build needs beyond the sources themselves.
#[derive(Debug, Clone)]
pub struct BuildDefaults {
    /// Log directory for sources without `log_dir`
    pub default_log_dir: PathBuf,
    /// State directory, for scheduler state
    pub state_dir: PathBuf,
}

impl BuildDefaults {
    /// Derive build defaults from the configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_log_dir: config.default_log_dir(),
            state_dir: config.state_dir.clone(),
        }
    }
}

/// Build the desired topology from `sources`.
///
/// Never fails: an instance whose sources conflict is left out of the
/// topology and reported in [`Build::conflicts`].
pub fn build(sources: &[ConfigSource], defaults: &BuildDefaults) -> Build {
    let mut ordered: Vec<&ConfigSource> = sources.iter().collect();
    ordered.sort_by(|a, b| a.path.cmp(&b.path));

    let mut grouped: BTreeMap<&str, Vec<&ConfigSource>> = BTreeMap::new();
    for source in ordered {
        grouped.entry(source.instance_name()).or_default().push(source);
    }

    let mut result = Build::default();
    for (name, members) in grouped {
        if members.len() > 1 && members.iter().any(|s| !s.has_explicit_name()) {
            tracing::error!(
                instance = %name,
                sources = members.len(),
                "Config sources share an instance name without setting it explicitly"
            );
            result.conflicts.push(NameConflict {
                instance: name.to_string(),
                sources: members.iter().map(|s| s.path.clone()).collect(),
            });
            continue;
        }
        let instance = build_instance(name, &members, defaults);
        result.topology.instances.insert(name.to_string(), instance);
    }
    result
}

fn build_instance(name: &str, sources: &[&ConfigSource], defaults: &BuildDefaults) -> Instance {
    let claimed: BTreeSet<&str> = sources
        .iter()
        .flat_map(|s| s.declarations.gateways.iter())
        .map(|g| g.server_name.as_str())
        .collect();

    let mut instance = Instance {
        name: name.to_string(),
        ..Default::default()
    };

    for source in sources {
        instance.sources.insert(source.path.clone());
        for decl in service_decls(&source.declarations, &claimed) {
            let service = render_service(name, source, &decl, defaults);
            if let Some(existing) = instance.services.get(&service.id.service) {
                if existing.fingerprint != service.fingerprint {
                    tracing::warn!(
                        service = %service.id,
                        kept = %existing.source.display(),
                        ignored = %source.path.display(),
                        "Service declared by more than one source, keeping the first"
                    );
                }
                continue;
            }
            instance.services.insert(service.id.service.clone(), service);
        }
    }
    instance
}

/// Expand a source's declarations into tagged service declarations.
pub fn service_decls(declarations: &Declarations, claimed: &BTreeSet<&str>) -> Vec<ServiceDecl> {
    let mut decls: Vec<ServiceDecl> = declarations
        .gateways
        .iter()
        .cloned()
        .map(ServiceDecl::WebGateway)
        .collect();
    if !declarations.has_gateway() {
        decls.push(ServiceDecl::Standalone);
    }
    if let Some(queue) = &declarations.job_queue {
        decls.push(ServiceDecl::JobQueueWorker(queue.clone()));
        if queue.enable_beat {
            decls.push(ServiceDecl::JobQueueBeat(queue.clone()));
        }
    }
    decls.extend(
        declarations
            .handlers
            .iter()
            .filter(|h| !claimed.contains(h.name.as_str()))
            .cloned()
            .map(ServiceDecl::JobHandler),
    );
    decls
}

fn render_service(
    instance: &str,
    source: &ConfigSource,
    decl: &ServiceDecl,
    defaults: &BuildDefaults,
) -> Service {
    let declarations = &source.declarations;
    let service_name = decl.name().to_string();
    let program_name = format!("{}_{}", instance, service_name);

    let mut environment = BTreeMap::new();
    environment.insert(
        "GALAXY_CONFIG_FILE".to_string(),
        source.path.display().to_string(),
    );
    if let Some(venv) = &declarations.virtualenv {
        environment.insert("VIRTUAL_ENV".to_string(), venv.display().to_string());
        environment.insert(
            "PATH".to_string(),
            format!("{}:%(ENV_PATH)s", venv.join("bin").display()),
        );
    }
    environment.extend(declarations.environment.clone());
    if let Some(extra) = decl.environment() {
        environment.extend(extra.clone());
    }

    let log_dir = declarations
        .log_dir
        .clone()
        .unwrap_or_else(|| defaults.default_log_dir.clone());
    let is_gateway = decl.service_type() == ServiceType::Gunicorn;

    let program = ProgramSpec {
        name: service_name.clone(),
        command: decl.command(&source.path, &defaults.state_dir),
        directory: declarations.galaxy_root.clone(),
        environment,
        log_file: log_dir.join(format!("{}.log", program_name)),
        autostart: true,
        start_secs: if is_gateway { 15 } else { 10 },
        stop_wait_secs: if is_gateway { 65 } else { 10 },
        stop_signal: "TERM".to_string(),
    };

    Service {
        id: ServiceId::new(instance, service_name),
        kind: decl.classify(),
        service_type: decl.service_type(),
        pool: decl.pool().map(str::to_string),
        source: source.path.clone(),
        fingerprint: fingerprint(&program),
        program,
        desired_running: true,
    }
}

/// Content fingerprint of a rendered program.
///
/// Covers the command line, working directory, log file and environment;
/// supervisor timings are not part of the command template.
pub fn fingerprint(program: &ProgramSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(program.command.as_bytes());
    hasher.update([0]);
    hasher.update(program.directory.display().to_string().as_bytes());
    hasher.update([0]);
    hasher.update(program.log_file.display().to_string().as_bytes());
    hasher.update([0]);
    for (key, value) in &program.environment {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}

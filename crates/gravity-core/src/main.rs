// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gravityctl - process manager for Galaxy server instances.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use gravity_core::manager::{InstanceListing, SourceDetails, SourceListing};
use gravity_core::reconcile::{ActionOutcome, RunSummary};
use gravity_core::{Config, ProcessManager};

/// Manage Galaxy server processes under supervisord
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// State directory (overrides GRAVITY_STATE_DIR)
    #[arg(short, long, global = true, value_hint = clap::ValueHint::DirPath)]
    state_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register config files and update
    #[command(visible_alias = "register")]
    AddSource {
        /// Galaxy config files
        #[arg(required = true, value_hint = clap::ValueHint::FilePath)]
        paths: Vec<PathBuf>,

        /// Galaxy root for files that do not set one
        #[arg(long, value_hint = clap::ValueHint::DirPath)]
        galaxy_root: Option<PathBuf>,
    },

    /// Deregister config files, by path or instance name
    #[command(visible_alias = "deregister")]
    RemoveSource {
        /// Paths or instance names
        #[arg(required = true)]
        entries: Vec<String>,
    },

    /// Move a registration to a new path
    RenameSource {
        /// Registered path
        old: PathBuf,
        /// New path
        new: PathBuf,
    },

    /// List registered config files
    ListSources,

    /// List known instances
    ListInstances,

    /// Show details of a registered config file
    GetSourceDetails {
        /// Registered path
        path: PathBuf,
    },

    /// Converge supervisor configuration with the registered files
    Update {
        /// Rewrite every fragment, changed or not
        #[arg(short, long)]
        force: bool,
    },

    /// Start instances
    Start {
        /// Instance names, all when empty
        instances: Vec<String>,
    },

    /// Stop instances
    Stop {
        /// Instance names, all when empty
        instances: Vec<String>,
    },

    /// Restart instances
    Restart {
        /// Instance names, all when empty
        instances: Vec<String>,
    },

    /// Reload instances, using SIGHUP where supported
    Reload {
        /// Instance names, all when empty
        instances: Vec<String>,
    },

    /// Reload instances one readiness-gated member at a time
    Graceful {
        /// Instance names, all when empty
        instances: Vec<String>,
    },

    /// Stop every instance and the supervisor daemon
    Shutdown,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Before the subscriber, so RUST_LOG may come from .env
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(cli.verbose))
        .with_writer(std::io::stderr)
        .init();

    match dotenv {
        Ok(path) => debug!(path = %path.display(), "Loaded .env file"),
        Err(e) => debug!("No .env file loaded: {}", e),
    }

    let mut config = Config::from_env()?;
    if let Some(dir) = cli.state_dir {
        config.state_dir = Config::expand_home(&dir);
    }
    debug!(state_dir = %config.state_dir.display(), "Loaded configuration");

    let manager = ProcessManager::new(config);

    let summary = match cli.command {
        Commands::AddSource { paths, galaxy_root } => {
            manager
                .add_source_with_root(&paths, galaxy_root.as_deref())
                .await?
        }
        Commands::RemoveSource { entries } => {
            let removed = manager.remove_source(&entries).await?;
            for path in &removed {
                println!("Removed {}", path.display());
            }
            if removed.is_empty() {
                println!("Nothing removed");
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::RenameSource { old, new } => {
            manager.rename_source(&old, &new).await?;
            println!("Renamed {} to {}", old.display(), new.display());
            return Ok(ExitCode::SUCCESS);
        }
        Commands::ListSources => {
            print_sources(&manager.list_sources().await?);
            return Ok(ExitCode::SUCCESS);
        }
        Commands::ListInstances => {
            print_instances(&manager.list_instances().await?);
            return Ok(ExitCode::SUCCESS);
        }
        Commands::GetSourceDetails { path } => {
            print_details(&manager.get_source_details(&path).await?);
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Update { force: false } => manager.update().await?,
        Commands::Update { force: true } => manager.force_update().await?,
        Commands::Start { instances } => manager.start(&instances).await?,
        Commands::Stop { instances } => manager.stop(&instances).await?,
        Commands::Restart { instances } => manager.restart(&instances).await?,
        Commands::Reload { instances } => manager.reload(&instances).await?,
        Commands::Graceful { instances } => manager.graceful(&instances).await?,
        Commands::Shutdown => manager.shutdown().await?,
    };

    print_summary(&summary);
    if summary.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        info!(blocked = ?summary.blocked(), "Run finished with failures");
        Ok(ExitCode::FAILURE)
    }
}

/// `RUST_LOG` when set, else the verbosity default.
fn env_filter(verbose: bool) -> EnvFilter {
    let default_filter = if verbose {
        "gravity_core=debug,gravityctl=debug"
    } else {
        "gravity_core=info,gravityctl=info"
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into())
}

fn print_summary(summary: &RunSummary) {
    for (path, diagnostics) in &summary.degraded {
        for message in diagnostics {
            println!("! {}: {}", path.display(), message);
        }
    }
    for (path, reason) in &summary.pinned {
        println!("! {} unreadable: {}", path.display(), reason);
    }
    for name in &summary.unknown_instances {
        println!("! unknown instance: {}", name);
    }
    for report in &summary.instances {
        println!(
            "{:<24} {:<14} {}",
            report.instance, report.classification, report.state
        );
        for warning in &report.warnings {
            println!("    warning: {}", warning);
        }
    }
    for action in &summary.actions {
        match &action.outcome {
            ActionOutcome::Done => println!("{:<24} {:<14} done", action.instance, action.action),
            ActionOutcome::Failed { reason } => println!(
                "{:<24} {:<14} failed: {}",
                action.instance, action.action, reason
            ),
            ActionOutcome::Partial {
                updated,
                failed,
                untouched,
                reason,
            } => {
                println!(
                    "{:<24} {:<14} stopped at {}: {}",
                    action.instance, action.action, failed, reason
                );
                println!("    updated:   {}", updated.join(", "));
                println!("    untouched: {}", untouched.join(", "));
            }
        }
    }
    for error in &summary.errors {
        println!("! {}", error);
    }
}

fn print_sources(sources: &[SourceListing]) {
    if sources.is_empty() {
        println!("No config files registered");
        return;
    }
    for source in sources {
        println!(
            "{:<24} {} (registered {})",
            source.record.instance_name,
            source.path.display(),
            source.record.registered_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_instances(instances: &[InstanceListing]) {
    if instances.is_empty() {
        println!("No instances registered");
        return;
    }
    for instance in instances {
        let status = if instance.reconciled { "" } else { " (pending update)" };
        println!("{}{}", instance.name, status);
        for path in &instance.sources {
            println!("    source  {}", path.display());
        }
        for (name, service) in &instance.services {
            println!("    service {:<24} {}", name, service.kind);
        }
    }
}

fn print_details(details: &SourceDetails) {
    println!("path:          {}", details.path.display());
    println!("instance:      {}", details.record.instance_name);
    println!("registered:    {}", details.record.registered_at.to_rfc3339());
    println!("updated:       {}", details.record.updated_at.to_rfc3339());
    if let Some(root) = &details.record.galaxy_root {
        println!("default root:  {}", root.display());
    }
    if let Some(error) = &details.load_error {
        println!("error:         {}", error);
    }
    if let Some(source) = &details.current {
        let declarations = &source.declarations;
        println!("galaxy_root:   {}", declarations.galaxy_root.display());
        if let Some(venv) = &declarations.virtualenv {
            println!("virtualenv:    {}", venv.display());
        }
        for gateway in &declarations.gateways {
            println!("gunicorn:      {} on {}", gateway.server_name, gateway.bind);
        }
        if declarations.job_queue.is_some() {
            println!("celery:        enabled");
        }
        for handler in &declarations.handlers {
            match &handler.pool {
                Some(pool) => println!("handler:       {} (pool {})", handler.name, pool),
                None => println!("handler:       {}", handler.name),
            }
        }
        for message in &source.diagnostics {
            println!("diagnostic:    {}", message);
        }
    }
    if let Some(instance) = &details.instance {
        for (name, service) in &instance.services {
            println!("service:       {} ({})", name, service.kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_from_dotenv_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "RUST_LOG=gravity_core=trace\n").unwrap();

        dotenvy::from_path_override(&path).unwrap();
        assert_eq!(env_filter(false).to_string(), "gravity_core=trace");
    }

    #[test]
    fn test_cli_update_force_and_galaxy_root() {
        let cli = Cli::try_parse_from(["gravityctl", "update", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::Update { force: true }));

        let cli = Cli::try_parse_from([
            "gravityctl",
            "add-source",
            "--galaxy-root",
            "/srv/galaxy",
            "/srv/galaxy/config/galaxy.yml",
        ])
        .unwrap();
        match cli.command {
            Commands::AddSource { paths, galaxy_root } => {
                assert_eq!(paths, vec![PathBuf::from("/srv/galaxy/config/galaxy.yml")]);
                assert_eq!(galaxy_root, Some(PathBuf::from("/srv/galaxy")));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}

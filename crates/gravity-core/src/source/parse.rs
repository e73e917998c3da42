// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declaration extraction from a parsed YAML document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_yaml::Value;

use super::{
    Declarations, GatewayDecl, HandlerDecl, JobQueueDecl, SERVER_SECTION, read_handler_ids,
};
use crate::config::Config;

const DEFAULT_JOB_CONFIG_FILE: &str = "config/job_conf.xml";
const DEFAULT_HANDLER_TEMPLATE: &str = "job-handler-{instance_number}";
const DYNAMIC_HANDLER_POOL: &str = "job-handlers";
const DEFAULT_GATEWAY_NAME: &str = "gunicorn";

/// Extract declarations from `document`.
///
/// Returns `None` when the document has no `galaxy` mapping. Otherwise the
/// result is total: malformed fields fall back to defaults and a message
/// describing each fallback is returned alongside.
///
/// `default_root` is used when the file names no root of its own, ahead of
/// locating one next to the file.
pub fn parse_declarations(
    path: &Path,
    document: &Value,
    default_root: Option<&Path>,
) -> Option<(Declarations, Vec<String>)> {
    let section = document.get(SERVER_SECTION)?;
    if !section.is_mapping() {
        return None;
    }

    let mut diags = Vec::new();
    let d = &mut diags;

    let instance_name = string_field(section, "instance_name", d).filter(|name| !name.is_empty());
    let galaxy_root = resolve_root(path, section, default_root, d);

    let log_dir = string_field(section, "log_dir", d).map(|p| Config::expand_home(Path::new(&p)));
    let virtualenv =
        string_field(section, "virtualenv", d).map(|p| Config::expand_home(Path::new(&p)));
    let environment = env_field(section, "environment", d);

    let default_bind = format!(
        "{}:{}",
        string_field(section, "bind_address", d).unwrap_or_else(|| "localhost".to_string()),
        u32_field(section, "bind_port", 8080, d)
    );
    let gateways = gateway_decls(section.get("gunicorn"), &default_bind, d);
    let job_queue = job_queue_decl(section.get("celery"), d);

    let mut handlers = static_handlers(section, &galaxy_root, d);
    handlers.extend(dynamic_handlers(section, d));
    let mut seen = std::collections::BTreeSet::new();
    handlers.retain(|h| seen.insert(h.name.clone()));

    let declarations = Declarations {
        instance_name,
        galaxy_root,
        log_dir,
        virtualenv,
        environment,
        gateways,
        job_queue,
        handlers,
    };
    Some((declarations, diags))
}

fn resolve_root(
    path: &Path,
    section: &Value,
    default_root: Option<&Path>,
    d: &mut Vec<String>,
) -> PathBuf {
    let explicit =
        string_field(section, "galaxy_root", d).or_else(|| string_field(section, "root", d));
    if let Some(root) = explicit {
        return Config::expand_home(Path::new(&root));
    }
    if let Some(root) = default_root {
        return Config::expand_home(root);
    }

    let config_dir = path.parent().unwrap_or(Path::new("/"));
    if let Some(parent) = config_dir.parent()
        && parent.join("lib").join("galaxy").exists()
    {
        return parent.to_path_buf();
    }

    d.push(format!(
        "cannot locate Galaxy root directory, using {}: set `galaxy_root` in the `galaxy` section",
        config_dir.display()
    ));
    config_dir.to_path_buf()
}

fn gateway_decls(value: Option<&Value>, default_bind: &str, d: &mut Vec<String>) -> Vec<GatewayDecl> {
    let null = Value::Null;
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Vec::new(),
        Some(Value::Bool(true)) => vec![gateway_decl(&null, DEFAULT_GATEWAY_NAME, default_bind, d)],
        Some(entry @ Value::Mapping(_)) => {
            if !bool_field(entry, "enable", true, d) {
                return Vec::new();
            }
            vec![gateway_decl(entry, DEFAULT_GATEWAY_NAME, default_bind, d)]
        }
        Some(Value::Sequence(entries)) => {
            let mut gateways = Vec::new();
            for (i, entry) in entries.iter().enumerate() {
                if !bool_field(entry, "enable", true, d) {
                    continue;
                }
                let name = format!("{}_{}", DEFAULT_GATEWAY_NAME, i);
                gateways.push(gateway_decl(entry, &name, default_bind, d));
            }
            gateways
        }
        Some(other) => {
            d.push(format!(
                "`gunicorn` must be a mapping or a list, ignoring {:?}",
                other
            ));
            Vec::new()
        }
    }
}

fn gateway_decl(entry: &Value, default_name: &str, default_bind: &str, d: &mut Vec<String>) -> GatewayDecl {
    GatewayDecl {
        server_name: string_field(entry, "server_name", d)
            .unwrap_or_else(|| default_name.to_string()),
        bind: string_field(entry, "bind", d).unwrap_or_else(|| default_bind.to_string()),
        workers: u32_field(entry, "workers", 1, d).max(1),
        timeout: u32_field(entry, "timeout", 300, d),
        extra_args: string_field(entry, "extra_args", d).unwrap_or_default(),
        preload: bool_field(entry, "preload", false, d),
        environment: env_field(entry, "environment", d),
    }
}

fn job_queue_decl(value: Option<&Value>, d: &mut Vec<String>) -> Option<JobQueueDecl> {
    let null = Value::Null;
    let entry = match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => return None,
        Some(Value::Bool(true)) => &null,
        Some(entry @ Value::Mapping(_)) => entry,
        Some(other) => {
            d.push(format!("`celery` must be a mapping, ignoring {:?}", other));
            return None;
        }
    };
    if !bool_field(entry, "enable", true, d) {
        return None;
    }
    Some(JobQueueDecl {
        concurrency: u32_field(entry, "concurrency", 2, d).max(1),
        loglevel: string_field(entry, "loglevel", d).unwrap_or_else(|| "DEBUG".to_string()),
        queues: string_field(entry, "queues", d)
            .unwrap_or_else(|| "celery,galaxy.internal,galaxy.external".to_string()),
        pool: string_field(entry, "pool", d).unwrap_or_else(|| "threads".to_string()),
        enable_beat: bool_field(entry, "enable_beat", true, d),
        environment: env_field(entry, "environment", d),
    })
}

fn static_handlers(section: &Value, root: &Path, d: &mut Vec<String>) -> Vec<HandlerDecl> {
    let explicit = string_field(section, "job_config_file", d);
    let configured = explicit.clone().unwrap_or_else(|| DEFAULT_JOB_CONFIG_FILE.to_string());
    let mut job_conf = Config::expand_home(Path::new(&configured));
    if job_conf.is_relative() {
        job_conf = root.join(job_conf);
    }

    if !job_conf.exists() {
        if explicit.is_some() {
            d.push(format!("job config file {} does not exist", job_conf.display()));
        }
        return Vec::new();
    }

    match read_handler_ids(&job_conf) {
        Ok(ids) => ids
            .into_iter()
            .map(|name| HandlerDecl { name, pool: None })
            .collect(),
        Err(e) => {
            d.push(format!(
                "unable to read handlers from {}: {}",
                job_conf.display(),
                e
            ));
            Vec::new()
        }
    }
}

fn dynamic_handlers(section: &Value, d: &mut Vec<String>) -> Vec<HandlerDecl> {
    let count = u32_field(section, "job_handler_count", 0, d);
    let template = string_field(section, "job_handler_name_template", d)
        .unwrap_or_else(|| DEFAULT_HANDLER_TEMPLATE.to_string());
    let template = if template.contains("{instance_number}") {
        template
    } else {
        d.push(format!(
            "`job_handler_name_template` {:?} lacks {{instance_number}}, using default",
            template
        ));
        DEFAULT_HANDLER_TEMPLATE.to_string()
    };

    (0..count)
        .map(|i| HandlerDecl {
            name: template.replace("{instance_number}", &i.to_string()),
            pool: Some(DYNAMIC_HANDLER_POOL.to_string()),
        })
        .collect()
}

fn string_field(section: &Value, key: &str, d: &mut Vec<String>) -> Option<String> {
    match section.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => {
            d.push(format!("`{}` must be a string, ignoring {:?}", key, other));
            None
        }
    }
}

fn u32_field(section: &Value, key: &str, default: u32, d: &mut Vec<String>) -> u32 {
    match section.get(key) {
        None | Some(Value::Null) => default,
        Some(value) => match value.as_u64().and_then(|n| u32::try_from(n).ok()) {
            Some(n) => n,
            None => {
                d.push(format!(
                    "`{}` must be a non-negative integer, using {}",
                    key, default
                ));
                default
            }
        },
    }
}

fn bool_field(section: &Value, key: &str, default: bool, d: &mut Vec<String>) -> bool {
    match section.get(key) {
        None | Some(Value::Null) => default,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            d.push(format!("`{}` must be a boolean, using {}", key, default));
            default
        }
    }
}

fn env_field(section: &Value, key: &str, d: &mut Vec<String>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let Some(value) = section.get(key) else {
        return env;
    };
    let Some(mapping) = value.as_mapping() else {
        if !value.is_null() {
            d.push(format!("`{}` must be a mapping, ignoring it", key));
        }
        return env;
    };
    for (name, val) in mapping {
        let (Some(name), Some(val)) = (name.as_str(), scalar_string(val)) else {
            d.push(format!("ignoring non-scalar entry in `{}`", key));
            continue;
        };
        env.insert(name.to_string(), val);
    }
    env
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

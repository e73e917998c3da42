// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Static job handler extraction from `job_conf.xml`.

use std::path::Path;

/// Read the ids of the `<handler>` elements under `<handlers>`.
///
/// Returns the handler ids in document order. A job config without a
/// `<handlers>` element declares no static handlers.
pub fn read_handler_ids(path: &Path) -> Result<Vec<String>, String> {
    let xml = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    handler_ids_from_str(&xml)
}

fn handler_ids_from_str(xml: &str) -> Result<Vec<String>, String> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| format!("invalid XML: {}", e))?;

    let Some(handlers) = doc
        .root_element()
        .children()
        .find(|n| n.has_tag_name("handlers"))
    else {
        return Ok(Vec::new());
    };

    let mut ids = Vec::new();
    for handler in handlers.children().filter(|n| n.has_tag_name("handler")) {
        match handler.attribute("id") {
            Some(id) if !id.trim().is_empty() => ids.push(id.trim().to_string()),
            _ => return Err("<handler> element without an `id` attribute".to_string()),
        }
    }
    Ok(ids)
}

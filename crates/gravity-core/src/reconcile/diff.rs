// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Topology diffing.

use std::collections::{BTreeMap, BTreeSet};

use crate::state::{InstanceRecord, ServiceRecord};
use crate::topology::{ServiceId, Topology};

/// Delta between the stored topology and a freshly built one.
///
/// Every service identity seen on either side lands in exactly one of
/// `added`, `removed`, `modified` or `unchanged`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Services present only in the new topology
    pub added: BTreeSet<ServiceId>,
    /// Services present only in the stored topology
    pub removed: BTreeSet<ServiceId>,
    /// Services whose command template changed
    pub modified: BTreeSet<ServiceId>,
    /// Services identical on both sides
    pub unchanged: BTreeSet<ServiceId>,
    /// Instances absent from the stored topology
    pub instances_new: BTreeSet<String>,
    /// Stored instances with at least one changed member
    pub instances_touched: BTreeSet<String>,
    /// Stored instances with no members left
    pub instances_empty: BTreeSet<String>,
}

/// Member-level changes of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceDelta {
    /// Added service names
    pub added: Vec<String>,
    /// Removed service names
    pub removed: Vec<String>,
    /// Modified service names
    pub modified: Vec<String>,
}

impl InstanceDelta {
    /// True when membership is unchanged.
    pub fn same_members(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl ChangeSet {
    /// True when nothing needs to be applied.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
            && self.instances_new.is_empty()
            && self.instances_touched.is_empty()
            && self.instances_empty.is_empty()
    }

    /// Member-level changes of one instance.
    pub fn delta(&self, instance: &str) -> InstanceDelta {
        let pick = |set: &BTreeSet<ServiceId>| {
            set.iter()
                .filter(|id| id.instance == instance)
                .map(|id| id.service.clone())
                .collect()
        };
        InstanceDelta {
            added: pick(&self.added),
            removed: pick(&self.removed),
            modified: pick(&self.modified),
        }
    }

    /// Count every unchanged service as modified, touching its instance.
    pub fn mark_all_modified(&mut self) {
        for id in std::mem::take(&mut self.unchanged) {
            self.instances_touched.insert(id.instance.clone());
            self.modified.insert(id);
        }
    }

    /// Every instance with a pending change.
    pub fn changed_instances(&self) -> BTreeSet<String> {
        self.instances_new
            .iter()
            .chain(&self.instances_touched)
            .chain(&self.instances_empty)
            .cloned()
            .collect()
    }
}

fn differs(old: &ServiceRecord, new: &ServiceRecord) -> bool {
    old.fingerprint != new.fingerprint || old.kind != new.kind
}

/// Diff stored instance records against another set of records.
pub fn diff_records(
    old: &BTreeMap<String, InstanceRecord>,
    new: &BTreeMap<String, InstanceRecord>,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let empty = InstanceRecord::default();

    let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for name in names {
        let before = old.get(name);
        let after = new.get(name).filter(|i| !i.services.is_empty());

        let old_services = &before.unwrap_or(&empty).services;
        let new_services = &after.unwrap_or(&empty).services;
        let mut touched = false;

        for (service, record) in new_services {
            let id = ServiceId::new(name.as_str(), service.as_str());
            match old_services.get(service) {
                None => {
                    changes.added.insert(id);
                    touched = true;
                }
                Some(prior) if differs(prior, record) => {
                    changes.modified.insert(id);
                    touched = true;
                }
                Some(_) => {
                    changes.unchanged.insert(id);
                }
            }
        }
        for service in old_services.keys() {
            if !new_services.contains_key(service) {
                changes.removed.insert(ServiceId::new(name.as_str(), service.as_str()));
                touched = true;
            }
        }

        match (before, after) {
            (None, Some(_)) => {
                changes.instances_new.insert(name.clone());
            }
            (Some(_), None) => {
                changes.instances_empty.insert(name.clone());
            }
            (Some(_), Some(_)) if touched => {
                changes.instances_touched.insert(name.clone());
            }
            _ => {}
        }
    }
    changes
}

/// Diff the stored topology against a freshly built one.
pub fn diff(old: &BTreeMap<String, InstanceRecord>, new: &Topology) -> ChangeSet {
    let records: BTreeMap<String, InstanceRecord> = new
        .instances
        .iter()
        .map(|(name, instance)| (name.clone(), InstanceRecord::from(instance)))
        .collect();
    diff_records(old, &records)
}

//! Instance registry - tracks registered application instances
//!
//! The registry is a plain owned structure; the relay server wraps it in a
//! single `RwLock` so that registration, removal and resolution never race.

mod selector;

pub use selector::{matches_path_suffix, normalize_selector};

use crate::error::RelayError;
use crate::protocol::{InstanceInfo, InstanceStatus, RegisterMessage};
use crate::server::ConnectionHandle;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Busy/reload phases an instance may report
pub const ALLOWED_DETAILS: &[&str] = &[
    "compiling",
    "running_tests",
    "asset_import",
    "playmode_transition",
];

const MAX_DETAIL_LEN: usize = 64;

/// One registered instance together with its live connection
#[derive(Debug, Clone)]
pub struct Instance {
    pub info: InstanceInfo,
    pub connection: ConnectionHandle,
    pub registered_at: DateTime<Utc>,
}

impl Instance {
    pub fn instance_id(&self) -> &str {
        &self.info.instance_id
    }

    pub fn status(&self) -> InstanceStatus {
        self.info.status
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection.id()
    }
}

/// Outcome of a successful registration
#[derive(Debug)]
pub struct Registration {
    pub ref_id: u32,

    /// Previous live connection for the same `instance_id`; the caller closes it
    pub replaced: Option<ConnectionHandle>,
}

/// Registered instances keyed by `instance_id`
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: HashMap<String, Instance>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an instance
    ///
    /// Last writer wins: an instance restarting with the same id takes over
    /// the entry (and its `ref_id`) and the old connection is handed back.
    pub fn register(
        &mut self,
        msg: &RegisterMessage,
        connection: ConnectionHandle,
    ) -> Result<Registration, RelayError> {
        let instance_id = msg.instance_id.trim();
        if instance_id.is_empty() {
            return Err(RelayError::protocol("REGISTER requires a non-empty instance_id"));
        }

        let previous = self.instances.remove(instance_id);
        let ref_id = match &previous {
            Some(prev) => prev.info.ref_id,
            None => self.next_ref_id(),
        };
        let replaced = previous
            .map(|prev| prev.connection)
            .filter(|conn| conn.id() != connection.id());

        let instance = Instance {
            info: InstanceInfo {
                instance_id: instance_id.to_string(),
                project_name: msg.project_name.clone(),
                application_version: msg.application_version.clone(),
                bridge_version: msg.bridge_version.clone(),
                status: InstanceStatus::Ready,
                ref_id,
                is_default: false,
                detail: None,
            },
            connection,
            registered_at: Utc::now(),
        };
        self.instances.insert(instance_id.to_string(), instance);
        self.refresh_defaults();

        Ok(Registration { ref_id, replaced })
    }

    /// Resolve a selector to exactly one instance
    ///
    /// Tried in order: exact `instance_id`, exact `ref_id`, exact
    /// `project_name`, unique path suffix of `instance_id`. Without a
    /// selector the sole registered instance is chosen.
    pub fn resolve(&self, selector: Option<&str>) -> Result<Instance, RelayError> {
        let selector = selector.map(normalize_selector).filter(|s| !s.is_empty());

        let Some(selector) = selector else {
            return match self.instances.len() {
                0 => Err(RelayError::not_found("No Unity instance is connected")),
                1 => self
                    .instances
                    .values()
                    .next()
                    .cloned()
                    .ok_or_else(|| RelayError::not_found("No Unity instance is connected")),
                n => Err(RelayError::ambiguous(format!(
                    "{} instances connected; select one with --instance ({})",
                    n,
                    self.describe(self.instances.values())
                ))),
            };
        };

        if let Some(instance) = self.instances.get(selector) {
            return Ok(instance.clone());
        }

        if let Ok(ref_id) = selector.parse::<u32>() {
            if let Some(instance) = self.instances.values().find(|i| i.info.ref_id == ref_id) {
                return Ok(instance.clone());
            }
        }

        let by_name: Vec<&Instance> = self
            .instances
            .values()
            .filter(|i| i.info.project_name == selector)
            .collect();
        if let Some(found) = self.unique(selector, by_name)? {
            return Ok(found);
        }

        let by_suffix: Vec<&Instance> = self
            .instances
            .values()
            .filter(|i| matches_path_suffix(&i.info.instance_id, selector))
            .collect();
        if let Some(found) = self.unique(selector, by_suffix)? {
            return Ok(found);
        }

        Err(RelayError::not_found(format!(
            "No Unity instance matches '{}'",
            selector
        )))
    }

    /// Update the status of an instance; returns false if it is not registered
    pub fn mark_status(
        &mut self,
        instance_id: &str,
        status: InstanceStatus,
        detail: Option<String>,
    ) -> bool {
        match self.instances.get_mut(instance_id) {
            Some(instance) => {
                instance.info.status = status;
                instance.info.detail = match status {
                    InstanceStatus::Ready => None,
                    _ => detail,
                };
                true
            }
            None => false,
        }
    }

    /// Mark an instance disconnected if it is still bound to `connection_id`
    pub fn mark_disconnected(&mut self, instance_id: &str, connection_id: Uuid) -> bool {
        match self.instances.get_mut(instance_id) {
            Some(instance) if instance.connection.id() == connection_id => {
                instance.info.status = InstanceStatus::Disconnected;
                instance.info.detail = None;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, instance_id: &str) -> Option<Instance> {
        let removed = self.instances.remove(instance_id);
        if removed.is_some() {
            self.refresh_defaults();
        }
        removed
    }

    /// Remove an instance only if no replacement registered in the meantime
    pub fn remove_connection(&mut self, instance_id: &str, connection_id: Uuid) -> Option<Instance> {
        let still_bound = self
            .instances
            .get(instance_id)
            .is_some_and(|i| i.connection.id() == connection_id);
        if still_bound {
            self.remove(instance_id)
        } else {
            None
        }
    }

    /// Registered instances ordered by `ref_id`
    pub fn list(&self) -> Vec<InstanceInfo> {
        let mut infos: Vec<InstanceInfo> =
            self.instances.values().map(|i| i.info.clone()).collect();
        infos.sort_by_key(|i| i.ref_id);
        infos
    }

    pub fn get(&self, instance_id: &str) -> Option<&Instance> {
        self.instances.get(instance_id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn next_ref_id(&self) -> u32 {
        let used: BTreeSet<u32> = self.instances.values().map(|i| i.info.ref_id).collect();
        (1..).find(|candidate| !used.contains(candidate)).unwrap_or(1)
    }

    fn refresh_defaults(&mut self) {
        let single = self.instances.len() == 1;
        for instance in self.instances.values_mut() {
            instance.info.is_default = single;
        }
    }

    fn unique(
        &self,
        selector: &str,
        matches: Vec<&Instance>,
    ) -> Result<Option<Instance>, RelayError> {
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0].clone())),
            n => Err(RelayError::ambiguous(format!(
                "'{}' matches {} instances: {}",
                selector,
                n,
                self.describe(matches.into_iter())
            ))),
        }
    }

    fn describe<'a>(&self, instances: impl Iterator<Item = &'a Instance>) -> String {
        let mut entries: Vec<(u32, &str)> = instances
            .map(|i| (i.info.ref_id, i.info.instance_id.as_str()))
            .collect();
        entries.sort();
        entries
            .iter()
            .map(|(ref_id, id)| format!("[{}] {}", ref_id, id))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Validate an in-band status detail against the allowlist
pub fn sanitize_detail(detail: Option<&str>) -> Option<String> {
    let detail = detail?.trim();
    if detail.is_empty() || detail.len() > MAX_DETAIL_LEN {
        return None;
    }
    if detail.chars().any(char::is_control) {
        return None;
    }
    ALLOWED_DETAILS
        .iter()
        .find(|allowed| **allowed == detail)
        .map(|allowed| allowed.to_string())
}

//! The in-memory registry of supervised services: entries, identity, and target
//! resolution. Mutated exclusively by the Supervisor's inbox worker (see
//! `supervisor.rs`); every other component only ever reads a cloned snapshot or
//! posts an event back to the inbox.
use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::config::ServiceSpec;

/// Lifecycle state of a `ServiceEntry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    Stopped,
    Launching,
    Online,
    Stopping,
    Errored,
    WaitingRestart,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Launching => "launching",
            ServiceState::Online => "online",
            ServiceState::Stopping => "stopping",
            ServiceState::Errored => "errored",
            ServiceState::WaitingRestart => "waiting-restart",
        }
    }

    /// True for every state invariant 2 says must carry a live child.
    pub fn has_child(&self) -> bool {
        matches!(
            self,
            ServiceState::Launching | ServiceState::Online | ServiceState::Stopping
        )
    }
}

/// Health as tracked by the HealthProber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Latest resource sample recorded by the Monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ResourceSample {
    pub rss_bytes: u64,
    pub cpu_percent: f32,
    pub open_fds: Option<u32>,
}

/// One supervised logical service instance — the unit of the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub id: u64,
    pub name: String,
    pub namespace: Option<String>,
    pub spec: ServiceSpec,
    pub state: ServiceState,
    #[serde(skip)]
    pub pid: Option<u32>,
    #[serde(skip)]
    pub started_at: Option<SystemTime>,
    pub created_at: SystemTime,
    pub restart_count: u32,
    pub unstable_restarts: u32,
    /// Set by `restart()`; suppresses the exit-driven autorestart policy for
    /// the in-flight stop/start pair and is cleared on re-entry to `online`.
    #[serde(skip)]
    pub manual_restart: bool,
    /// Set by an explicit `stop()`/`delete()`; tells the exit handler not to
    /// apply restart policy to this exit.
    #[serde(skip)]
    pub manual_stop: bool,
    /// Set by `delete()` on an entry that still has a live child; tells the
    /// exit handler to remove the entry from the registry rather than settle
    /// it into `stopped`.
    #[serde(skip)]
    pub pending_delete: bool,
    #[serde(skip)]
    pub sample: Option<ResourceSample>,
    pub health: Health,
    #[serde(skip)]
    pub consecutive_health_failures: u32,
    /// Worker index for cluster entries (`None` for `fork` mode).
    pub worker_index: Option<u32>,
}

impl ServiceEntry {
    pub fn new(id: u64, name: String, spec: ServiceSpec, worker_index: Option<u32>) -> Self {
        let namespace = spec.namespace.clone();
        Self {
            id,
            name,
            namespace,
            spec,
            state: ServiceState::Stopped,
            pid: None,
            started_at: None,
            created_at: SystemTime::now(),
            restart_count: 0,
            unstable_restarts: 0,
            manual_restart: false,
            manual_stop: false,
            pending_delete: false,
            sample: None,
            health: Health::Unknown,
            consecutive_health_failures: 0,
            worker_index,
        }
    }
}

/// The authoritative mapping from service identity to `ServiceEntry`.
///
/// Only the Supervisor's inbox worker holds `&mut Registry`; every other
/// component receives cloned `ServiceEntry` values.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<u64, ServiceEntry>,
    name_index: HashMap<String, u64>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            name_index: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn name_exists(&self, name: &str) -> bool {
        self.name_index.contains_key(name)
    }

    pub fn insert(&mut self, entry: ServiceEntry) {
        self.name_index.insert(entry.name.clone(), entry.id);
        self.entries.insert(entry.id, entry);
    }

    pub fn remove(&mut self, id: u64) -> Option<ServiceEntry> {
        let entry = self.entries.remove(&id)?;
        self.name_index.remove(&entry.name);
        Some(entry)
    }

    pub fn get(&self, id: u64) -> Option<&ServiceEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut ServiceEntry> {
        self.entries.get_mut(&id)
    }

    pub fn id_by_name(&self, name: &str) -> Option<u64> {
        self.name_index.get(name).copied()
    }

    pub fn all(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a target selector to the set of matching entry ids, per the
    /// glossary: `"all"`, a decimal id, an exact name, a name-prefix
    /// (`name` or `name-<digit>...`), or a namespace match.
    ///
    /// A target matching nothing resolves to an empty list — this is success,
    /// not an error, for the caller to interpret.
    pub fn resolve(&self, target: &str) -> Vec<u64> {
        if target == "all" {
            let mut ids: Vec<u64> = self.entries.keys().copied().collect();
            ids.sort_unstable();
            return ids;
        }

        if let Ok(id) = target.parse::<u64>() {
            if self.entries.contains_key(&id) {
                return vec![id];
            }
            return Vec::new();
        }

        if let Some(&id) = self.name_index.get(target) {
            return vec![id];
        }

        let prefix = format!("{target}-");
        let mut by_prefix: Vec<u64> = self
            .entries
            .values()
            .filter(|e| e.name.starts_with(&prefix))
            .map(|e| e.id)
            .collect();
        if !by_prefix.is_empty() {
            by_prefix.sort_unstable();
            return by_prefix;
        }

        let mut by_namespace: Vec<u64> = self
            .entries
            .values()
            .filter(|e| e.namespace.as_deref() == Some(target))
            .map(|e| e.id)
            .collect();
        by_namespace.sort_unstable();
        by_namespace
    }
}

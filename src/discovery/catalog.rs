//! Per-service instance catalog
//!
//! Entries are created lazily on first resolve. Each entry owns a background
//! refresher that polls the registry once a second and atomically swaps in
//! the new instance snapshot; per-instance breakers are adopted across
//! refresh cycles so failure history survives a reload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::InstanceSource;
use crate::breaker::{Breaker, BreakerOptions};
use crate::error::{ProxyError, Result};

/// Tuning for the catalog and the breakers it owns
#[derive(Clone)]
pub struct CatalogConfig {
    /// Pause between registry polls of one service
    pub refresh_interval: Duration,
    /// How long a cold `resolve` may wait for the first load
    pub resolve_timeout: Duration,
    /// Breaker configuration applied to newly discovered instances
    pub breaker: BreakerOptions,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(1),
            resolve_timeout: Duration::from_secs(5),
            breaker: BreakerOptions::default(),
        }
    }
}

/// One discovered instance with its private breaker
#[derive(Debug)]
pub struct InstanceRecord {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub weight: f64,
    pub cluster: String,
    pub breaker: Arc<Breaker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Loading,
    Running,
}

struct EntryState {
    status: EntryStatus,
    instances: Vec<Arc<InstanceRecord>>,
    by_id: HashMap<String, Arc<InstanceRecord>>,
}

/// Per-service-name cache row
struct ServiceEntry {
    name: String,
    state: Mutex<EntryState>,
    /// Fired once, when the first refresh cycle completes
    loaded: watch::Sender<bool>,
}

impl ServiceEntry {
    fn new(name: &str) -> Self {
        let (loaded, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            state: Mutex::new(EntryState {
                status: EntryStatus::Loading,
                instances: Vec::new(),
                by_id: HashMap::new(),
            }),
            loaded,
        }
    }

    fn locked(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lazy cache of live instances per service name
pub struct ServiceCatalog {
    source: Arc<dyn InstanceSource>,
    group: String,
    config: CatalogConfig,
    entries: DashMap<String, Arc<ServiceEntry>>,
    shutdown: CancellationToken,
    refreshers: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceCatalog {
    pub fn new(source: Arc<dyn InstanceSource>, group: impl Into<String>, config: CatalogConfig) -> Self {
        Self {
            source,
            group: group.into(),
            config,
            entries: DashMap::new(),
            shutdown: CancellationToken::new(),
            refreshers: Mutex::new(Vec::new()),
        }
    }

    /// Current instances of a service. The first call for a name spawns its
    /// refresher and waits (bounded) for the initial load; later calls return
    /// the live snapshot immediately.
    pub async fn resolve(&self, service_name: &str) -> Result<Vec<Arc<InstanceRecord>>> {
        let mut spawned = false;
        let entry = self
            .entries
            .entry(service_name.to_string())
            .or_insert_with(|| {
                spawned = true;
                Arc::new(ServiceEntry::new(service_name))
            })
            .clone();
        if spawned {
            self.spawn_refresher(entry.clone());
        }

        let mut loaded = {
            let state = entry.locked();
            if state.status == EntryStatus::Running {
                return Ok(state.instances.clone());
            }
            entry.loaded.subscribe()
        };

        let _ = tokio::time::timeout(self.config.resolve_timeout, loaded.wait_for(|ready| *ready))
            .await;

        let state = entry.locked();
        if state.status == EntryStatus::Running {
            Ok(state.instances.clone())
        } else {
            Err(ProxyError::ServiceUnavailable(service_name.to_string()))
        }
    }

    /// Record a successful call against an instance; unknown names are ignored
    pub fn mark_success(&self, service_name: &str, id: &str) {
        if let Some(record) = self.find_record(service_name, id) {
            record.breaker.record_success();
        }
    }

    /// Record a failed call against an instance; unknown names are ignored
    pub fn mark_fail(&self, service_name: &str, id: &str) {
        if let Some(record) = self.find_record(service_name, id) {
            record.breaker.record_fail();
        }
    }

    fn find_record(&self, service_name: &str, id: &str) -> Option<Arc<InstanceRecord>> {
        let entry = self.entries.get(service_name)?;
        let record = entry.locked().by_id.get(id).cloned();
        record
    }

    fn spawn_refresher(&self, entry: Arc<ServiceEntry>) {
        let source = self.source.clone();
        let group = self.group.clone();
        let breaker_options = self.config.breaker.clone();
        let interval = self.config.refresh_interval;
        let token = self.shutdown.child_token();

        let handle = tokio::spawn(async move {
            tracing::debug!(service = %entry.name, "instance refresher started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = refresh_entry(source.as_ref(), &entry, &group, &breaker_options) => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::debug!(service = %entry.name, "instance refresher stopped");
        });

        self.refreshers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Stop all refreshers and wait for them to drain
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = {
            let mut refreshers = self
                .refreshers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            refreshers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// One refresh cycle: fetch, merge breakers by instance id, swap the
/// snapshot. A registry error is indistinguishable from an empty listing
/// upstream, and an empty listing never evacuates a previously good snapshot.
async fn refresh_entry(
    source: &dyn InstanceSource,
    entry: &ServiceEntry,
    group: &str,
    breaker_options: &BreakerOptions,
) {
    let raw = match source.fetch_healthy(&entry.name, group).await {
        Ok(list) => list,
        Err(err) => {
            tracing::warn!(service = %entry.name, error = %err, "registry fetch failed, treating as empty");
            Vec::new()
        }
    };

    let mut state = entry.locked();

    let mut new_by_id = HashMap::with_capacity(raw.len());
    for instance in raw {
        let breaker = match state.by_id.get(&instance.id) {
            // Same instance as before the reload: its breaker history carries over.
            Some(existing) => existing.breaker.clone(),
            None => Arc::new(Breaker::new(instance.id.clone(), breaker_options.clone())),
        };
        new_by_id.insert(
            instance.id.clone(),
            Arc::new(InstanceRecord {
                id: instance.id,
                ip: instance.ip,
                port: instance.port,
                weight: instance.weight,
                cluster: instance.cluster,
                breaker,
            }),
        );
    }

    if !new_by_id.is_empty() {
        state.instances = new_by_id.values().cloned().collect();
        state.by_id = new_by_id;
    }

    if state.status != EntryStatus::Running {
        state.status = EntryStatus::Running;
        entry.loaded.send_replace(true);
        tracing::info!(service = %entry.name, instances = state.instances.len(), "service loaded");
    }
}

//! Informer-style caches backing indexers
//!
//! Every type with at least one registered indexer gets a reflector once the
//! manager starts. The manager waits for all of them to finish their initial
//! list before it reports readiness, which is what makes index lookups in a
//! test body trustworthy.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Indexer, TaskResult};
use crate::registry::RegisteredType;
use crate::Error;

struct ResourceCache {
    resource: RegisteredType,
    indexers: HashMap<String, Indexer>,
    store: Option<Store<DynamicObject>>,
}

/// Shared handle to the manager's caches
///
/// Cloning is cheap; clones observe the same stores.
#[derive(Clone, Default)]
pub struct CacheSet {
    entries: Arc<DashMap<GroupVersionKind, ResourceCache>>,
}

impl CacheSet {
    /// Register an index on a resource type
    pub(crate) fn add_indexer(
        &self,
        resource: RegisteredType,
        indexer: Indexer,
    ) -> Result<(), Error> {
        let mut entry = self
            .entries
            .entry(indexer.gvk().clone())
            .or_insert_with(|| ResourceCache {
                resource,
                indexers: HashMap::new(),
                store: None,
            });

        if entry.indexers.contains_key(indexer.name()) {
            return Err(Error::registration(format!(
                "index {} already registered for {}",
                indexer.name(),
                indexer.gvk().kind
            )));
        }
        entry.indexers.insert(indexer.name().to_string(), indexer);
        Ok(())
    }

    /// Number of cached resource types
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no type is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn one reflector per cached type and return their stores
    pub(crate) fn start(
        &self,
        client: &Client,
        shutdown: &CancellationToken,
        tasks: &mut JoinSet<TaskResult>,
    ) -> Vec<(GroupVersionKind, Store<DynamicObject>)> {
        let gvks: Vec<GroupVersionKind> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut stores = Vec::with_capacity(gvks.len());

        for gvk in gvks {
            let Some(mut entry) = self.entries.get_mut(&gvk) else {
                continue;
            };
            let ar = entry.resource.resource.clone();
            let writer = reflector::store::Writer::<DynamicObject>::new(ar.clone());
            let reader = writer.as_reader();
            entry.store = Some(reader.clone());
            drop(entry);

            let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
            let stream = reflector::reflector(writer, watcher(api, watcher::Config::default())).default_backoff();
            let shutdown = shutdown.clone();
            let name = format!("cache/{}", gvk.kind);

            debug!(kind = %gvk.kind, group = %gvk.group, "Starting cache");
            tasks.spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = stream.for_each(|_| futures::future::ready(())) => {}
                }
                (name, Ok(()))
            });
            stores.push((gvk, reader));
        }

        info!(count = stores.len(), "Caches started");
        stores
    }

    /// All cached objects of a type
    ///
    /// Empty until the manager has started and synced.
    pub fn list(&self, gvk: &GroupVersionKind) -> Vec<Arc<DynamicObject>> {
        self.entries
            .get(gvk)
            .and_then(|entry| entry.store.as_ref().map(|store| store.state()))
            .unwrap_or_default()
    }

    /// Cached objects whose index `index` yields `value`
    pub fn lookup(
        &self,
        gvk: &GroupVersionKind,
        index: &str,
        value: &str,
    ) -> Result<Vec<Arc<DynamicObject>>, Error> {
        let entry = self
            .entries
            .get(gvk)
            .ok_or_else(|| Error::registration(format!("no cache for {}", gvk.kind)))?;
        let indexer = entry.indexers.get(index).ok_or_else(|| {
            Error::registration(format!("no index {index} registered for {}", gvk.kind))
        })?;

        let Some(store) = entry.store.as_ref() else {
            return Ok(Vec::new());
        };

        Ok(store
            .state()
            .into_iter()
            .filter(|obj| indexer.keys(obj).iter().any(|key| key == value))
            .collect())
    }
}

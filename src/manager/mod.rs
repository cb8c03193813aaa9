//! Reconciliation manager
//!
//! The manager is what the code under test runs inside: it owns the client
//! bound to the fixture, the caches behind registered indexers, and the
//! reconcilers. The orchestrator only talks to it through [`Manager`], which
//! keeps the lifecycle testable with stub managers.

mod cache;
mod controller;

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryFuture};
use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fixture::Connection;
use crate::readiness::ReadinessSignal;
use crate::registry::TypeRegistry;
use crate::Error;

pub use cache::CacheSet;
pub use controller::{ControllerManager, ManagerOptions};

/// Name of a supervised task and how it ended
pub(crate) type TaskResult = (String, Result<(), Error>);

/// Builds a manager on top of a started fixture
pub type ManagerFactory =
    Box<dyn FnOnce(&Connection, &TypeRegistry) -> Result<Arc<dyn Manager>, Error> + Send>;

/// Long-running process that watches resources and runs reconcilers
#[async_trait]
pub trait Manager: Send + Sync {
    /// Client bound to the fixture's API server
    fn client(&self) -> Client;

    /// Register an index function; must happen before `start`
    fn register_indexer(&self, indexer: Indexer) -> Result<(), Error>;

    /// Register a reconciler; must happen before `start`
    fn register_reconciler(&self, reconciler: Reconciler) -> Result<(), Error>;

    /// Fires once the manager leads and its caches are synced
    fn readiness(&self) -> ReadinessSignal;

    /// Caches backing registered indexers
    fn caches(&self) -> CacheSet {
        CacheSet::default()
    }

    /// Run until `shutdown` is cancelled
    ///
    /// Returns `Ok(())` after cancellation and `Err` if the manager fails on
    /// its own. May only be called once.
    async fn start(&self, shutdown: CancellationToken) -> Result<(), Error>;
}

type IndexFn = Arc<dyn Fn(&DynamicObject) -> Vec<String> + Send + Sync>;

/// Extracts secondary lookup keys from objects of one type
#[derive(Clone)]
pub struct Indexer {
    gvk: GroupVersionKind,
    name: String,
    extract: IndexFn,
}

impl Indexer {
    /// Index objects of `gvk` by the keys `extract` returns
    pub fn new<F>(gvk: GroupVersionKind, name: impl Into<String>, extract: F) -> Self
    where
        F: Fn(&DynamicObject) -> Vec<String> + Send + Sync + 'static,
    {
        Self {
            gvk,
            name: name.into(),
            extract: Arc::new(extract),
        }
    }

    /// Index a statically typed resource
    ///
    /// Objects that do not deserialize as `K` yield no keys.
    pub fn typed<K, F>(name: impl Into<String>, extract: F) -> Self
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
        F: Fn(&K) -> Vec<String> + Send + Sync + 'static,
    {
        let gvk = GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()));
        Self::new(gvk, name, move |obj: &DynamicObject| {
            match obj.clone().try_parse::<K>() {
                Ok(typed) => extract(&typed),
                Err(_) => Vec::new(),
            }
        })
    }

    /// Type this index applies to
    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    /// Index name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keys for one object
    pub fn keys(&self, obj: &DynamicObject) -> Vec<String> {
        (self.extract)(obj)
    }
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("gvk", &self.gvk)
            .field("name", &self.name)
            .finish()
    }
}

/// What a running reconciler gets from the manager
#[derive(Clone)]
pub struct ReconcilerContext {
    /// Client bound to the fixture
    pub client: Client,
    /// Cancelled when the manager shuts down
    pub shutdown: CancellationToken,
    /// Synced caches
    pub caches: CacheSet,
}

type RunFn = Box<dyn FnOnce(ReconcilerContext) -> BoxFuture<'static, Result<(), Error>> + Send>;

/// Caller-supplied reconciliation logic, run by the manager after readiness
pub struct Reconciler {
    name: String,
    run: RunFn,
}

impl Reconciler {
    /// Wrap an arbitrary long-running task
    ///
    /// The task should return once `ctx.shutdown` is cancelled. Returning an
    /// error before that is fatal for the manager.
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(ReconcilerContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(move |ctx| run(ctx).boxed()),
        }
    }

    /// Run a kube-rs `Controller` for `api` until the manager shuts down
    pub fn controller<K, Ctx, ReconcileFn, ReconcileFut, ErrorPolicy>(
        name: impl Into<String>,
        api: Api<K>,
        reconcile: ReconcileFn,
        error_policy: ErrorPolicy,
        context: Arc<Ctx>,
    ) -> Self
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default + Eq + Hash + Clone + Debug + Unpin + Send + Sync,
        ReconcileFn: FnMut(Arc<K>, Arc<Ctx>) -> ReconcileFut + Send + 'static,
        ReconcileFut: TryFuture<Ok = Action> + Send + 'static,
        ReconcileFut::Error: std::error::Error + Send + 'static,
        ErrorPolicy: Fn(Arc<K>, &ReconcileFut::Error, Arc<Ctx>) -> Action + Send + Sync + 'static,
        Ctx: Send + Sync + 'static,
    {
        let name = name.into();
        let controller_name = name.clone();
        Self::new(name, move |ctx: ReconcilerContext| async move {
            Controller::new(api, watcher::Config::default())
                .graceful_shutdown_on(ctx.shutdown.cancelled_owned())
                .run(reconcile, error_policy, context)
                .for_each(|result| {
                    match result {
                        Ok((object, action)) => {
                            debug!(controller = %controller_name, %object, ?action, "Reconciled");
                        }
                        Err(e) => {
                            warn!(controller = %controller_name, error = %e, "Reconciliation error");
                        }
                    }
                    futures::future::ready(())
                })
                .await;
            Ok(())
        })
    }

    /// Reconciler name, used in logs and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_task(self, ctx: ReconcilerContext) -> BoxFuture<'static, TaskResult> {
        let name = self.name;
        let fut = (self.run)(ctx);
        async move { (name, fut.await) }.boxed()
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").field("name", &self.name).finish()
    }
}

/// The stock manager factory: a [`ControllerManager`] with default options
pub fn default_manager(
    connection: &Connection,
    registry: &TypeRegistry,
) -> Result<Arc<dyn Manager>, Error> {
    let manager =
        ControllerManager::build(connection.config.clone(), registry.clone(), ManagerOptions::default())?;
    Ok(Arc::new(manager))
}

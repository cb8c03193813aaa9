//! The stock manager: reflector caches, optional leader election, and a
//! supervised set of reconciler tasks

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{DynamicObject, GroupVersionKind};
use kube::runtime::reflector::Store;
use kube::{Client, Config};
use parking_lot::{Mutex, MutexGuard};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CacheSet, Indexer, Manager, Reconciler, ReconcilerContext, TaskResult};
use crate::leader_election::{LeaderElectionConfig, LeaderElector, LeaderGuard};
use crate::readiness::{readiness, ReadinessSignal, ReadinessTrigger};
use crate::registry::TypeRegistry;
use crate::Error;

/// Default time reconcilers get to return after shutdown
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Knobs for [`ControllerManager`]
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Campaign for this lease before becoming ready; `None` skips election
    pub leader_election: Option<LeaderElectionConfig>,
    /// How long tasks get to stop before they are aborted
    pub graceful_shutdown_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            leader_election: None,
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Reconcilers waiting for start, guarded together with the start flag
#[derive(Default)]
struct Registrations {
    started: bool,
    reconcilers: Vec<Reconciler>,
}

/// Manager backed by kube-rs reflectors and controllers
///
/// Registration is only accepted before [`Manager::start`]. Readiness fires
/// after leadership (when enabled) is held and every cache has completed its
/// initial list; reconcilers are spawned right after that.
pub struct ControllerManager {
    client: Client,
    registry: TypeRegistry,
    options: ManagerOptions,
    caches: CacheSet,
    registrations: Mutex<Registrations>,
    trigger: Mutex<Option<ReadinessTrigger>>,
    signal: ReadinessSignal,
}

impl ControllerManager {
    /// Build a manager talking to the cluster behind `config`
    pub fn build(
        config: Config,
        registry: TypeRegistry,
        options: ManagerOptions,
    ) -> Result<Self, Error> {
        if let Some(election) = &options.leader_election {
            if election.renew_interval >= election.lease_duration {
                return Err(Error::manager_build(format!(
                    "lease renew interval {:?} must be shorter than lease duration {:?}",
                    election.renew_interval, election.lease_duration
                )));
            }
            if i32::try_from(election.lease_duration.as_secs()).is_err() {
                return Err(Error::manager_build(format!(
                    "lease duration {:?} does not fit a Lease object",
                    election.lease_duration
                )));
            }
        }

        let client = Client::try_from(config)
            .map_err(|e| Error::manager_build(format!("failed to create client: {e}")))?;
        let (trigger, signal) = readiness();

        Ok(Self {
            client,
            registry,
            options,
            caches: CacheSet::default(),
            registrations: Mutex::new(Registrations::default()),
            trigger: Mutex::new(Some(trigger)),
            signal,
        })
    }

    /// Objects of `gvk` whose index `index` yields `value`, from the warm cache
    pub fn index_lookup(
        &self,
        gvk: &GroupVersionKind,
        index: &str,
        value: &str,
    ) -> Result<Vec<Arc<DynamicObject>>, Error> {
        self.caches.lookup(gvk, index, value)
    }

    /// Lock registrations, failing once `start` has claimed them
    ///
    /// Callers keep the guard until their registration is stored so that
    /// `start` either sees it or the caller sees the rejection.
    fn open_registrations(&self, what: &str) -> Result<MutexGuard<'_, Registrations>, Error> {
        let registrations = self.registrations.lock();
        if registrations.started {
            return Err(Error::registration(format!(
                "cannot register {what} after the manager has started"
            )));
        }
        Ok(registrations)
    }

    /// Wait for caches, fire readiness, run reconcilers until shutdown
    async fn supervise(
        &self,
        shutdown: &CancellationToken,
        internal: &CancellationToken,
        tasks: &mut JoinSet<TaskResult>,
        leader: &mut Option<LeaderGuard>,
        trigger: Option<ReadinessTrigger>,
        reconcilers: Vec<Reconciler>,
    ) -> Result<(), Error> {
        let stores = self.caches.start(&self.client, internal, tasks);

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = leadership_lost(leader) => {
                return Err(Error::manager_runtime("leadership lost while syncing caches"));
            }
            Some(joined) = tasks.join_next() => {
                return Err(early_exit(joined));
            }
            synced = wait_for_sync(&stores) => synced?,
        }

        if let Some(trigger) = trigger {
            trigger.fire();
        }
        info!(
            caches = stores.len(),
            reconcilers = reconcilers.len(),
            "Manager ready"
        );

        for reconciler in reconcilers {
            debug!(reconciler = %reconciler.name(), "Starting reconciler");
            let ctx = ReconcilerContext {
                client: self.client.clone(),
                shutdown: internal.clone(),
                caches: self.caches.clone(),
            };
            tasks.spawn(reconciler.into_task(ctx));
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = leadership_lost(leader) => {
                    return Err(Error::manager_runtime("leadership lost"));
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok((name, Ok(()))) => debug!(task = %name, "Task finished"),
                    other => return Err(early_exit(other)),
                },
            }
        }
    }

    /// Give tasks the grace period to return, then abort the rest
    async fn drain(&self, tasks: &mut JoinSet<TaskResult>) {
        let timeout = self.options.graceful_shutdown_timeout;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(()))) => {}
                    Ok((name, Err(e))) => {
                        warn!(task = %name, error = %e, "Task failed during shutdown")
                    }
                    Err(e) => warn!(error = %e, "Task panicked during shutdown"),
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                timeout_secs = timeout.as_secs(),
                remaining = tasks.len(),
                "Tasks did not stop in time, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

#[async_trait]
impl Manager for ControllerManager {
    fn client(&self) -> Client {
        self.client.clone()
    }

    fn register_indexer(&self, indexer: Indexer) -> Result<(), Error> {
        let _registrations = self.open_registrations("indexer")?;
        let resource = self.registry.resolve(indexer.gvk()).ok_or_else(|| {
            Error::registration(format!(
                "cannot index unknown type {}",
                gvk_display(indexer.gvk())
            ))
        })?;
        debug!(kind = %indexer.gvk().kind, index = %indexer.name(), "Registered indexer");
        self.caches.add_indexer(resource, indexer)
    }

    fn register_reconciler(&self, reconciler: Reconciler) -> Result<(), Error> {
        let mut registrations = self.open_registrations("reconciler")?;
        let reconcilers = &mut registrations.reconcilers;
        if reconcilers.iter().any(|r| r.name() == reconciler.name()) {
            return Err(Error::registration(format!(
                "reconciler {} already registered",
                reconciler.name()
            )));
        }
        debug!(reconciler = %reconciler.name(), "Registered reconciler");
        reconcilers.push(reconciler);
        Ok(())
    }

    fn readiness(&self) -> ReadinessSignal {
        self.signal.clone()
    }

    fn caches(&self) -> CacheSet {
        self.caches.clone()
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<(), Error> {
        let reconcilers = {
            let mut registrations = self.registrations.lock();
            if registrations.started {
                return Err(Error::manager_runtime("manager already started"));
            }
            registrations.started = true;
            std::mem::take(&mut registrations.reconcilers)
        };
        // Taking the trigger means a failed start drops it, which releases readiness waiters
        let trigger = self.trigger.lock().take();

        let mut leader = match &self.options.leader_election {
            Some(config) => {
                let elector = Arc::new(LeaderElector::new(self.client.clone(), config.clone()));
                match elector.acquire(&shutdown).await {
                    Some(guard) => Some(guard),
                    None => {
                        info!("Shutdown requested before leadership was acquired");
                        return Ok(());
                    }
                }
            }
            None => None,
        };

        let internal = shutdown.child_token();
        let mut tasks = JoinSet::new();
        let result = self
            .supervise(
                &shutdown,
                &internal,
                &mut tasks,
                &mut leader,
                trigger,
                reconcilers,
            )
            .await;

        internal.cancel();
        self.drain(&mut tasks).await;

        if let Some(guard) = leader {
            if let Err(e) = guard.release().await {
                warn!(error = %e, "Failed to release leader lease");
            }
        }

        match &result {
            Ok(()) => info!("Manager stopped"),
            Err(e) => error!(error = %e, "Manager failed"),
        }
        result
    }
}

async fn wait_for_sync(stores: &[(GroupVersionKind, Store<DynamicObject>)]) -> Result<(), Error> {
    for (gvk, store) in stores {
        store.wait_until_ready().await.map_err(|e| {
            Error::manager_runtime(format!("cache for {} closed before sync: {e}", gvk.kind))
        })?;
        debug!(kind = %gvk.kind, "Cache synced");
    }
    Ok(())
}

async fn leadership_lost(leader: &mut Option<LeaderGuard>) {
    match leader {
        Some(guard) => guard.lost().await,
        None => std::future::pending::<()>().await,
    }
}

fn early_exit(joined: Result<TaskResult, JoinError>) -> Error {
    match joined {
        Ok((name, Ok(()))) => Error::manager_runtime(format!("{name} exited before shutdown")),
        Ok((name, Err(e))) => Error::manager_runtime(format!("{name} failed: {e}")),
        Err(e) if e.is_panic() => Error::manager_runtime(format!("task panicked: {e}")),
        Err(e) => Error::manager_runtime(format!("task aborted: {e}")),
    }
}

fn gvk_display(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

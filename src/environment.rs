//! Handle passed to setup callbacks and the test body

use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::fixture::Connection;
use crate::manager::Manager;
use crate::namespace::NamespaceProvisioner;
use crate::registry::TypeRegistry;
use crate::Error;

/// Everything a test needs to talk to the fixture
///
/// Built once per run by the orchestrator. `setup_env` may adjust it before
/// the manager starts; the test body gets it behind an `Arc`. The client is
/// only valid until the orchestrator stops the fixture.
pub struct Environment {
    client: Client,
    connection: Connection,
    registry: TypeRegistry,
    manager: Arc<dyn Manager>,
    cancel: CancellationToken,
    namespaces: NamespaceProvisioner,
}

impl Environment {
    pub(crate) fn new(
        connection: Connection,
        registry: TypeRegistry,
        manager: Arc<dyn Manager>,
        cancel: CancellationToken,
    ) -> Self {
        let client = manager.client();
        Self {
            namespaces: NamespaceProvisioner::for_client(client.clone()),
            client,
            connection,
            registry,
            manager,
            cancel,
        }
    }

    /// Client bound to the fixture, shared with the manager
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Typed API for a cluster-scoped or all-namespaces view of `K`
    pub fn api<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
    {
        Api::all(self.client.clone())
    }

    /// Typed API for `K` in one namespace
    pub fn namespaced_api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Untyped API for any registered type, CRDs included
    pub fn dynamic_api(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, Error> {
        let registered = self
            .registry
            .resolve(gvk)
            .ok_or_else(|| Error::registration(format!("unknown type {}", gvk.kind)))?;
        Ok(match (namespace, registered.namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &registered.resource),
            _ => Api::all_with(self.client.clone(), &registered.resource),
        })
    }

    /// The manager attached to the fixture
    pub fn manager(&self) -> &Arc<dyn Manager> {
        &self.manager
    }

    /// Known resource types, including installed CRDs
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// How the fixture is reached
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Cancelled when the orchestrator begins shutdown
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Replace the namespace provisioner, e.g. to route through a proxy client
    pub fn set_namespace_provisioner(&mut self, provisioner: NamespaceProvisioner) {
        self.namespaces = provisioner;
    }

    /// Create a namespace named `<prefix>-<random suffix>`
    ///
    /// See [`NamespaceProvisioner::create_namespace`].
    pub async fn create_namespace(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
    ) -> Result<Namespace, Error> {
        self.namespaces.create_namespace(ctx, prefix).await
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("connection", &self.connection)
            .field("registry", &self.registry.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

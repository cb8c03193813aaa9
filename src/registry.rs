//! Registry of resource types known to the test environment
//!
//! Plays the role of a scheme: maps a GroupVersionKind to the `ApiResource`
//! needed to build dynamic APIs, watchers and caches. The registry is an
//! explicit value handed to the orchestrator rather than process-global
//! state, so tests can inject exactly the types they care about.
//!
//! Built-in core types are registered by [`TypeRegistry::with_builtin`]; CRDs
//! installed by the fixture are added with [`TypeRegistry::register_crd`].

use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{
    ConfigMap, Event, Namespace, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::Resource;
use tracing::debug;

/// A registered type with its scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredType {
    /// Resource descriptor for dynamic API access
    pub resource: ApiResource,
    /// Whether objects of this type live in a namespace
    pub namespaced: bool,
}

/// Shared registry of known resource types
///
/// Cloning is cheap; clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    entries: Arc<DashMap<GroupVersionKind, RegisteredType>>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in types tests commonly touch
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register::<Namespace>(false);
        registry.register::<Pod>(true);
        registry.register::<ConfigMap>(true);
        registry.register::<Secret>(true);
        registry.register::<Service>(true);
        registry.register::<ServiceAccount>(true);
        registry.register::<Event>(true);
        registry.register::<Lease>(true);
        registry.register::<Deployment>(true);
        registry.register::<StatefulSet>(true);
        registry.register::<CustomResourceDefinition>(false);
        registry
    }

    /// Register a statically typed resource
    pub fn register<K>(&self, namespaced: bool)
    where
        K: Resource<DynamicType = ()>,
    {
        let resource = ApiResource::erase::<K>(&());
        let gvk = GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind);
        self.entries.insert(
            gvk,
            RegisteredType {
                resource,
                namespaced,
            },
        );
    }

    /// Register every served version of a CRD
    ///
    /// Returns the number of versions added.
    pub fn register_crd(&self, crd: &CustomResourceDefinition) -> usize {
        let spec = &crd.spec;
        let namespaced = spec.scope == "Namespaced";
        let mut added = 0;

        for version in spec.versions.iter().filter(|v| v.served) {
            let gvk = GroupVersionKind::gvk(&spec.group, &version.name, &spec.names.kind);
            let resource = ApiResource::from_gvk_with_plural(&gvk, &spec.names.plural);
            self.entries.insert(
                gvk,
                RegisteredType {
                    resource,
                    namespaced,
                },
            );
            added += 1;
        }

        debug!(
            crd = %spec.names.plural,
            group = %spec.group,
            versions = added,
            "Registered CRD type"
        );
        added
    }

    /// Look up a type by GroupVersionKind
    pub fn resolve(&self, gvk: &GroupVersionKind) -> Option<RegisteredType> {
        self.entries.get(gvk).map(|entry| entry.value().clone())
    }

    /// Whether the type is known
    pub fn contains(&self, gvk: &GroupVersionKind) -> bool {
        self.entries.contains_key(gvk)
    }

    /// Number of registered GroupVersionKinds
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Uniquely named namespaces for test isolation

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// The one API call the provisioner needs, behind a trait for mocking
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceApi: Send + Sync {
    /// Create a namespace, returning the object as stored by the server
    async fn create(&self, namespace: Namespace) -> Result<Namespace, kube::Error>;
}

#[async_trait]
impl NamespaceApi for Client {
    async fn create(&self, namespace: Namespace) -> Result<Namespace, kube::Error> {
        let api: Api<Namespace> = Api::all(self.clone());
        api.create(&PostParams::default(), &namespace).await
    }
}

/// Creates namespaces named `<prefix>-<suffix>` with a server-chosen suffix
#[derive(Clone)]
pub struct NamespaceProvisioner {
    api: Arc<dyn NamespaceApi>,
}

impl NamespaceProvisioner {
    /// Provisioner over any [`NamespaceApi`]
    pub fn new(api: Arc<dyn NamespaceApi>) -> Self {
        Self { api }
    }

    /// Provisioner using `client`
    pub fn for_client(client: Client) -> Self {
        Self::new(Arc::new(client))
    }

    /// Create a fresh namespace whose name starts with `prefix-`
    ///
    /// The API server picks the suffix through `generateName`, so names never
    /// collide within a cluster. Exactly one create call is made; there is no
    /// retry. Namespaces are not cleaned up, they go away with the cluster.
    pub async fn create_namespace(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
    ) -> Result<Namespace, Error> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                generate_name: Some(format!("{prefix}-")),
                ..Default::default()
            },
            ..Default::default()
        };

        if ctx.is_cancelled() {
            return Err(Error::resource_creation_msg(prefix, "cancelled before the namespace was created"));
        }

        debug!(prefix, "Creating namespace");
        let created = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                return Err(Error::resource_creation_msg(prefix, "cancelled while creating the namespace"));
            }
            result = self.api.create(namespace) => {
                result.map_err(|e| Error::resource_creation(prefix, e))?
            }
        };

        info!(namespace = %created.name_any(), "Created namespace");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::function;

    fn server_assigns_name(ns: Namespace) -> Result<Namespace, kube::Error> {
        let prefix = ns.metadata.generate_name.clone().unwrap_or_default();
        Ok(Namespace {
            metadata: ObjectMeta {
                name: Some(format!("{prefix}x7k2p")),
                generate_name: ns.metadata.generate_name,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn uses_generate_name_with_prefix() {
        let mut mock = MockNamespaceApi::new();
        mock.expect_create()
            .with(function(|ns: &Namespace| {
                ns.metadata.generate_name.as_deref() == Some("alpha-") && ns.metadata.name.is_none()
            }))
            .times(1)
            .returning(server_assigns_name);

        let provisioner = NamespaceProvisioner::new(Arc::new(mock));
        let ns = provisioner
            .create_namespace(&CancellationToken::new(), "alpha")
            .await
            .unwrap();

        assert_eq!(ns.name_any(), "alpha-x7k2p");
        assert!(ns.name_any().starts_with("alpha-"));
    }

    #[tokio::test]
    async fn api_failure_is_a_resource_creation_error_without_retry() {
        let mut mock = MockNamespaceApi::new();
        mock.expect_create().times(1).returning(|_| {
            Err(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "namespaces is forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            }))
        });

        let provisioner = NamespaceProvisioner::new(Arc::new(mock));
        let err = provisioner
            .create_namespace(&CancellationToken::new(), "alpha")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ResourceCreation { ref prefix, .. } if prefix == "alpha"));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn cancelled_context_fails_without_creating() {
        let mut mock = MockNamespaceApi::new();
        mock.expect_create().never();

        let ctx = CancellationToken::new();
        ctx.cancel();
        let provisioner = NamespaceProvisioner::new(Arc::new(mock));
        let err = provisioner.create_namespace(&ctx, "alpha").await.unwrap_err();
        assert!(matches!(err, Error::ResourceCreation { .. }));
    }
}

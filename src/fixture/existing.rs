//! Fixture that attaches to an already running cluster

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Client, Config};
use tracing::info;

use super::crd::{install_crds, load_crds, uninstall_crds, DEFAULT_ESTABLISH_TIMEOUT};
use super::{Connection, Fixture, FixtureOptions};
use crate::Error;

/// Uses the cluster from the ambient kubeconfig (or in-cluster config)
///
/// Nothing is created or destroyed apart from the CRDs, which are removed on
/// stop when `cleanup_crds_on_stop` is set.
pub struct ExistingClusterFixture {
    options: FixtureOptions,
    client: Option<Client>,
    installed: Vec<CustomResourceDefinition>,
}

impl ExistingClusterFixture {
    /// Create an unstarted fixture
    pub fn new(options: FixtureOptions) -> Self {
        Self {
            options,
            client: None,
            installed: Vec::new(),
        }
    }
}

#[async_trait]
impl Fixture for ExistingClusterFixture {
    async fn start(&mut self) -> Result<Connection, Error> {
        let crds = load_crds(
            &self.options.crd_directory_paths,
            self.options.error_if_crd_path_missing,
        )
        .map_err(|e| Error::fixture_start(e.to_string()))?;

        let config = tokio::time::timeout(self.options.start_timeout, Config::infer())
            .await
            .map_err(|_| Error::fixture_start("timed out inferring cluster config"))?
            .map_err(|e| Error::fixture_start(format!("failed to infer cluster config: {e}")))?;
        info!(cluster_url = %config.cluster_url, "Using existing cluster");

        let client = Client::try_from(config.clone())
            .map_err(|e| Error::fixture_start(format!("failed to create client: {e}")))?;
        install_crds(&client, &crds, DEFAULT_ESTABLISH_TIMEOUT)
            .await
            .map_err(|e| Error::fixture_start(format!("failed to install CRDs: {e}")))?;

        self.client = Some(client);
        self.installed = crds.clone();
        Ok(Connection { config, crds })
    }

    async fn stop(&mut self) -> Result<(), Error> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        let installed = std::mem::take(&mut self.installed);

        if !self.options.cleanup_crds_on_stop || installed.is_empty() {
            return Ok(());
        }

        tokio::time::timeout(self.options.stop_timeout, uninstall_crds(&client, &installed))
            .await
            .map_err(|_| Error::fixture_stop("timed out removing CRDs"))?
            .map_err(|e| Error::fixture_stop(format!("failed to remove CRDs: {e}")))
    }
}

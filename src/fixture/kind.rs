//! kind-backed fixture: one throwaway cluster per test run

use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::process::Command;
use tracing::{info, warn};

use super::crd::{install_crds, load_crds, DEFAULT_ESTABLISH_TIMEOUT};
use super::{Connection, Fixture, FixtureOptions};
use crate::Error;

const KIND_BINARY: &str = "kind";
const CLUSTER_PREFIX: &str = "envtest";

/// Fixture that creates a kind cluster on start and deletes it on stop
///
/// A cluster that already exists under a fixed `cluster_name` is reused and
/// left running on stop, so a developer can keep one warm cluster across
/// runs.
pub struct KindFixture {
    options: FixtureOptions,
    cluster_name: String,
    /// Set when this fixture created the cluster and must delete it
    owns_cluster: bool,
    started: bool,
}

impl KindFixture {
    /// Create an unstarted fixture
    pub fn new(options: FixtureOptions) -> Self {
        let cluster_name = options
            .cluster_name
            .clone()
            .unwrap_or_else(generate_cluster_name);
        Self {
            options,
            cluster_name,
            owns_cluster: false,
            started: false,
        }
    }

    /// Name of the kind cluster this fixture manages
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    async fn cluster_exists(&self) -> Result<bool, Error> {
        let output = run_kind(&["get", "clusters"], self.options.start_timeout)
            .await
            .map_err(Error::fixture_start)?;
        let clusters = String::from_utf8_lossy(&output.stdout);
        Ok(clusters.lines().any(|line| line.trim() == self.cluster_name))
    }

    async fn create_cluster(&self) -> Result<(), Error> {
        let wait = format!("{}s", self.options.start_timeout.as_secs());
        let mut args = vec![
            "create",
            "cluster",
            "--name",
            self.cluster_name.as_str(),
            "--wait",
            wait.as_str(),
        ];
        if let Some(image) = self.options.node_image.as_deref() {
            args.extend(["--image", image]);
        }

        info!(cluster = %self.cluster_name, "Creating kind cluster");
        run_kind(&args, self.options.start_timeout)
            .await
            .map_err(Error::fixture_start)?;
        Ok(())
    }

    async fn delete_cluster(&self) -> Result<(), String> {
        info!(cluster = %self.cluster_name, "Deleting kind cluster");
        run_kind(
            &["delete", "cluster", "--name", &self.cluster_name],
            self.options.stop_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn connection_config(&self) -> Result<Config, Error> {
        let output = run_kind(
            &["get", "kubeconfig", "--name", &self.cluster_name],
            self.options.start_timeout,
        )
        .await
        .map_err(Error::fixture_start)?;

        let kubeconfig = Kubeconfig::from_yaml(&String::from_utf8_lossy(&output.stdout))
            .map_err(|e| Error::fixture_start(format!("invalid kind kubeconfig: {e}")))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::fixture_start(format!("failed to load kind kubeconfig: {e}")))
    }

    async fn prepare(&self, crds: &[CustomResourceDefinition]) -> Result<Config, Error> {
        let config = self.connection_config().await?;
        let client = Client::try_from(config.clone())
            .map_err(|e| Error::fixture_start(format!("failed to create client: {e}")))?;
        install_crds(&client, crds, DEFAULT_ESTABLISH_TIMEOUT)
            .await
            .map_err(|e| Error::fixture_start(format!("failed to install CRDs: {e}")))?;
        Ok(config)
    }
}

#[async_trait]
impl Fixture for KindFixture {
    async fn start(&mut self) -> Result<Connection, Error> {
        // Read CRDs before touching kind so a bad path never leaves a cluster behind
        let crds = load_crds(
            &self.options.crd_directory_paths,
            self.options.error_if_crd_path_missing,
        )
        .map_err(|e| Error::fixture_start(e.to_string()))?;

        run_kind(&["version"], self.options.start_timeout)
            .await
            .map_err(|e| Error::fixture_start(format!("kind binary unavailable: {e}")))?;

        if self.cluster_exists().await? {
            info!(cluster = %self.cluster_name, "Reusing existing kind cluster");
        } else {
            self.create_cluster().await?;
            self.owns_cluster = true;
        }
        self.started = true;

        match self.prepare(&crds).await {
            Ok(config) => Ok(Connection { config, crds }),
            Err(e) => {
                if let Err(cleanup) = self.stop().await {
                    warn!(cluster = %self.cluster_name, error = %cleanup, "Cleanup after failed start also failed");
                }
                Err(e)
            }
        }
    }

    async fn stop(&mut self) -> Result<(), Error> {
        if !self.started {
            return Ok(());
        }
        self.started = false;

        if !self.owns_cluster {
            info!(cluster = %self.cluster_name, "Leaving reused kind cluster running");
            return Ok(());
        }

        self.delete_cluster().await.map_err(Error::fixture_stop)?;
        self.owns_cluster = false;
        Ok(())
    }
}

fn generate_cluster_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{CLUSTER_PREFIX}-{}", &id[..8])
}

/// Run a kind subcommand, failing on non-zero exit or timeout
async fn run_kind(args: &[&str], timeout: Duration) -> Result<Output, String> {
    let command = format!("{KIND_BINARY} {}", args.join(" "));
    let child = Command::new(KIND_BINARY)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("{command}: {e}"))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| format!("{command}: timed out after {timeout:?}"))?
        .map_err(|e| format!("{command}: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "{command}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(output)
}

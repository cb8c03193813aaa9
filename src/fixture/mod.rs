//! Ephemeral control-plane fixtures
//!
//! A fixture owns the API server a test run talks to. The orchestrator only
//! sees the [`Fixture`] trait: `start` hands back a [`Connection`], `stop`
//! tears everything down. How the control plane is produced is up to the
//! implementation:
//!
//! - [`KindFixture`] creates a throwaway kind cluster per run (default)
//! - [`ExistingClusterFixture`] attaches to the ambient kubeconfig when
//!   `USE_EXISTING_CLUSTER=true`
//!
//! Both install the CRDs found under the configured paths before returning.

pub mod crd;
mod existing;
mod kind;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use tracing::debug;

use crate::{Error, DEFAULT_CRD_DIRECTORY};

pub use existing::ExistingClusterFixture;
pub use kind::KindFixture;

const USE_EXISTING_CLUSTER_ENV: &str = "USE_EXISTING_CLUSTER";
const CLUSTER_NAME_ENV: &str = "ENVTEST_KIND_CLUSTER_NAME";
const NODE_IMAGE_ENV: &str = "ENVTEST_KIND_NODE_IMAGE";
const START_TIMEOUT_ENV: &str = "ENVTEST_CONTROLPLANE_START_TIMEOUT";
const STOP_TIMEOUT_ENV: &str = "ENVTEST_CONTROLPLANE_STOP_TIMEOUT";

/// Default time allowed for the control plane to come up
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(120);
/// Default time allowed for the control plane to go away
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// How to reach a started fixture
#[derive(Clone)]
pub struct Connection {
    /// Client configuration for the fixture's API server
    pub config: kube::Config,
    /// CRDs installed during start
    pub crds: Vec<CustomResourceDefinition>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("cluster_url", &self.config.cluster_url)
            .field("crds", &self.crds.len())
            .finish()
    }
}

/// Lifecycle of an ephemeral control plane
#[async_trait]
pub trait Fixture: Send + Sync {
    /// Bring the control plane up and install CRDs
    async fn start(&mut self) -> Result<Connection, Error>;

    /// Tear the control plane down
    ///
    /// Calling `stop` on a fixture that never started is a no-op.
    async fn stop(&mut self) -> Result<(), Error>;
}

/// Builds a fixture from its options
pub type FixtureFactory = Box<dyn FnOnce(FixtureOptions) -> Box<dyn Fixture> + Send>;

/// Configuration shared by all fixtures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureOptions {
    /// Files or directories holding CRD manifests, installed in order
    pub crd_directory_paths: Vec<PathBuf>,
    /// Fail start if a CRD path does not exist
    pub error_if_crd_path_missing: bool,
    /// Attach to the ambient cluster instead of creating one
    pub use_existing_cluster: bool,
    /// Fixed kind cluster name; a unique name is generated when unset
    pub cluster_name: Option<String>,
    /// kind node image override
    pub node_image: Option<String>,
    /// Upper bound for `start`
    pub start_timeout: Duration,
    /// Upper bound for `stop`
    pub stop_timeout: Duration,
    /// Delete installed CRDs when an existing cluster fixture stops
    pub cleanup_crds_on_stop: bool,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            crd_directory_paths: vec![PathBuf::from(DEFAULT_CRD_DIRECTORY)],
            error_if_crd_path_missing: true,
            use_existing_cluster: false,
            cluster_name: None,
            node_image: None,
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            cleanup_crds_on_stop: true,
        }
    }
}

impl FixtureOptions {
    /// Options for the given CRD paths, with overrides read from the environment
    ///
    /// An empty path list selects [`DEFAULT_CRD_DIRECTORY`].
    pub fn from_env(crd_directory_paths: Vec<PathBuf>) -> Result<Self, Error> {
        Self::from_lookup(crd_directory_paths, |var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup(
        crd_directory_paths: Vec<PathBuf>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, Error> {
        let mut options = Self::default();
        if !crd_directory_paths.is_empty() {
            options.crd_directory_paths = crd_directory_paths;
        }

        if let Some(value) = lookup(USE_EXISTING_CLUSTER_ENV) {
            options.use_existing_cluster = parse_bool(USE_EXISTING_CLUSTER_ENV, &value)?;
        }
        options.cluster_name = lookup(CLUSTER_NAME_ENV).filter(|v| !v.trim().is_empty());
        options.node_image = lookup(NODE_IMAGE_ENV).filter(|v| !v.trim().is_empty());
        if let Some(value) = lookup(START_TIMEOUT_ENV) {
            options.start_timeout = parse_duration(START_TIMEOUT_ENV, &value)?;
        }
        if let Some(value) = lookup(STOP_TIMEOUT_ENV) {
            options.stop_timeout = parse_duration(STOP_TIMEOUT_ENV, &value)?;
        }

        debug!(?options, "Resolved fixture options");
        Ok(options)
    }
}

/// Build the fixture the options ask for
pub fn default_fixture(options: FixtureOptions) -> Box<dyn Fixture> {
    if options.use_existing_cluster {
        Box::new(ExistingClusterFixture::new(options))
    } else {
        Box::new(KindFixture::new(options))
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(Error::config(format!("{var}: expected a boolean, got {value:?}"))),
    }
}

fn parse_duration(var: &str, value: &str) -> Result<Duration, Error> {
    humantime::parse_duration(value.trim())
        .map_err(|e| Error::config(format!("{var}: invalid duration {value:?}: {e}")))
}

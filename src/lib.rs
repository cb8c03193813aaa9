//! kube-envtest - lifecycle harness for integration tests of Kubernetes controllers
//!
//! A run stands up an ephemeral control plane, attaches a reconciliation
//! manager to it, waits until that manager leads with warm caches, hands
//! control to the test body, and tears everything down in a fixed order.
//!
//! ```no_run
//! use kube_envtest::{run, RunInput};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let input = RunInput::builder(|env| async move {
//!         match env.create_namespace(env.cancellation(), "smoke").await {
//!             Ok(_) => 0,
//!             Err(_) => 1,
//!         }
//!     })
//!     .crd_directory_paths(["config/crd/bases"])
//!     .build();
//!
//!     std::process::exit(run(CancellationToken::new(), input).await);
//! }
//! ```
//!
//! # Modules
//!
//! - [`orchestrator`] - startup sequencing, readiness barrier, ordered shutdown
//! - [`fixture`] - kind-backed and existing-cluster control planes, CRD install
//! - [`manager`] - reconciliation manager, indexers, reconcilers, caches
//! - [`namespace`] - uniquely named namespaces for test isolation
//! - [`leader_election`] - Lease-based leader election for the manager
//! - [`readiness`] - one-shot readiness signal
//! - [`registry`] - explicit registry of known resource types
//! - [`telemetry`] - logging setup
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod environment;
pub mod error;
pub mod fixture;
pub mod leader_election;
pub mod manager;
pub mod namespace;
pub mod orchestrator;
pub mod readiness;
pub mod registry;
pub mod telemetry;

pub use environment::Environment;
pub use error::Error;
pub use orchestrator::{run, Orchestrator, RunInput, RunInputBuilder};

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// CRD location used when a run names no paths
pub const DEFAULT_CRD_DIRECTORY: &str = "config/crd/bases";

/// Process exit status for fatal orchestration failures
pub const FATAL_EXIT_CODE: i32 = 1;

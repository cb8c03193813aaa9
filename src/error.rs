//! Error types for the test environment
//!
//! Errors fall into two groups. Harness failures (fixture start/stop, manager
//! build/runtime, run timeout) are fatal: the orchestrator logs them and terminates the
//! process so a broken harness can never produce a green test run. Resource
//! creation failures are ordinary errors handed back to test code.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for envtest operations
#[derive(Debug, Error)]
pub enum Error {
    /// The ephemeral control plane could not be brought up
    #[error("failed to start fixture: {message}")]
    FixtureStart {
        /// Description of what failed
        message: String,
    },

    /// The manager could not bind to the fixture
    #[error("failed to build manager: {message}")]
    ManagerBuild {
        /// Description of what failed
        message: String,
    },

    /// The manager's run loop failed after it was started
    #[error("manager failed: {message}")]
    ManagerRuntime {
        /// Description of what failed
        message: String,
    },

    /// The fixture could not be torn down
    #[error("failed to stop fixture: {message}")]
    FixtureStop {
        /// Description of what failed
        message: String,
    },

    /// Readiness plus the test body outlasted the configured run timeout
    #[error("run did not finish within {after:?}")]
    RunTimeout {
        /// The configured limit
        after: Duration,
    },

    /// A namespace could not be created
    #[error("failed to create namespace with prefix {prefix}: {message}")]
    ResourceCreation {
        /// Name prefix requested by the caller
        prefix: String,
        /// Description of what failed
        message: String,
        /// The underlying API error, if the API server was reached
        #[source]
        source: Option<kube::Error>,
    },

    /// A CRD file or directory could not be read or parsed
    #[error("failed to load CRDs from {}: {message}", .path.display())]
    CrdLoad {
        /// File or directory being loaded
        path: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// An indexer or reconciler could not be registered
    #[error("registration error: {message}")]
    Registration {
        /// Description of what failed
        message: String,
    },

    /// Invalid configuration (environment variables, options)
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },
}

impl Error {
    /// Create a fixture start error
    pub fn fixture_start(msg: impl Into<String>) -> Self {
        Self::FixtureStart {
            message: msg.into(),
        }
    }

    /// Create a manager build error
    pub fn manager_build(msg: impl Into<String>) -> Self {
        Self::ManagerBuild {
            message: msg.into(),
        }
    }

    /// Create a manager runtime error
    pub fn manager_runtime(msg: impl Into<String>) -> Self {
        Self::ManagerRuntime {
            message: msg.into(),
        }
    }

    /// Create a fixture stop error
    pub fn fixture_stop(msg: impl Into<String>) -> Self {
        Self::FixtureStop {
            message: msg.into(),
        }
    }

    /// Create a run timeout error
    pub fn run_timeout(after: Duration) -> Self {
        Self::RunTimeout { after }
    }

    /// Create a resource creation error wrapping an API failure
    pub fn resource_creation(prefix: impl Into<String>, source: kube::Error) -> Self {
        Self::ResourceCreation {
            prefix: prefix.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a resource creation error that never reached the API server
    pub fn resource_creation_msg(prefix: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ResourceCreation {
            prefix: prefix.into(),
            message: msg.into(),
            source: None,
        }
    }

    /// Create a CRD load error for the given path
    pub fn crd_load(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::CrdLoad {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a registration error
    pub fn registration(msg: impl Into<String>) -> Self {
        Self::Registration {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Whether this error must terminate the test process
    ///
    /// Only harness lifecycle failures are fatal, a blown run timeout
    /// included. Everything else is returned to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FixtureStart { .. }
                | Self::ManagerBuild { .. }
                | Self::ManagerRuntime { .. }
                | Self::FixtureStop { .. }
                | Self::RunTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_errors_are_fatal() {
        assert!(Error::fixture_start("no kind").is_fatal());
        assert!(Error::manager_build("bad config").is_fatal());
        assert!(Error::manager_runtime("lost lease").is_fatal());
        assert!(Error::fixture_stop("delete failed").is_fatal());
        assert!(Error::run_timeout(Duration::from_secs(5)).is_fatal());
    }

    #[test]
    fn resource_creation_is_recoverable() {
        let err = Error::resource_creation_msg("alpha", "cancelled");
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "failed to create namespace with prefix alpha: cancelled"
        );
    }

    #[test]
    fn resource_creation_keeps_api_source() {
        let api_err = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "namespaces is forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        });
        let err = Error::resource_creation("beta", api_err);
        match err {
            Error::ResourceCreation {
                prefix,
                source: Some(kube::Error::Api(resp)),
                ..
            } => {
                assert_eq!(prefix, "beta");
                assert_eq!(resp.code, 403);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn crd_load_message_includes_path() {
        let err = Error::crd_load("config/crd/bases", "no such directory");
        assert_eq!(
            err.to_string(),
            "failed to load CRDs from config/crd/bases: no such directory"
        );
        assert!(!err.is_fatal());
    }
}

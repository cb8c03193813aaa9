//! Test helpers for integration tests
//!
//! Every run goes through the real orchestrator with a kind fixture pinned to
//! one shared cluster name, so only the first test pays for cluster creation.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kube_envtest::fixture::{default_fixture, FixtureOptions};
use kube_envtest::telemetry::LogOptions;
use kube_envtest::{Orchestrator, RunInputBuilder};
use tokio_util::sync::CancellationToken;

/// Name of the kind cluster used for integration tests
pub const TEST_CLUSTER_NAME: &str = "kube-envtest-integration";

/// Upper bound for a whole run, cluster creation included
pub const RUN_TIMEOUT: Duration = Duration::from_secs(600);

/// Upper bound for readiness plus the test body
pub const BODY_TIMEOUT: Duration = Duration::from_secs(180);

/// A namespaced CRD the lifecycle tests install
pub const WIDGET_CRD: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.envtest.example.com
spec:
  group: envtest.example.com
  names:
    kind: Widget
    plural: widgets
    singular: widget
    listKind: WidgetList
  scope: Namespaced
  versions:
    - name: v1
      served: true
      storage: true
      schema:
        openAPIV3Schema:
          type: object
          x-kubernetes-preserve-unknown-fields: true
"#;

/// Write the widget CRD into `dir` and return the directory
pub fn write_widget_crd(dir: &Path) -> PathBuf {
    std::fs::write(dir.join("widgets.yaml"), WIDGET_CRD).expect("failed to write CRD");
    dir.to_path_buf()
}

/// Run `builder` against the shared kind cluster and return the exit code
///
/// Panics if orchestration itself fails, so a broken fixture shows up as a
/// test failure rather than a process exit.
pub async fn run_in_kind(builder: RunInputBuilder) -> i32 {
    let input = builder
        .log_options(LogOptions::default())
        .run_timeout(BODY_TIMEOUT)
        .fixture_factory(|options: FixtureOptions| {
            default_fixture(FixtureOptions {
                cluster_name: Some(TEST_CLUSTER_NAME.to_string()),
                ..options
            })
        })
        .build();

    tokio::time::timeout(RUN_TIMEOUT, Orchestrator::execute(CancellationToken::new(), input))
        .await
        .expect("run timed out")
        .expect("orchestration failed")
}

/// Poll `check` until it yields a value or `timeout` elapses
pub async fn eventually<T, F, Fut>(timeout: Duration, mut check: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Map a test body result to an exit code, printing the failure
pub fn exit_code(result: anyhow::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("test body failed: {e:#}");
            1
        }
    }
}

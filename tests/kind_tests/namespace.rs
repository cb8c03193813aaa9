//! Namespaces created through the environment
//!
//! Two tests asking for the same prefix must never collide, and what comes
//! back must be a real object the API server will hand out again on get.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use kube::ResourceExt;
use kube_envtest::{Environment, RunInput};

use super::helpers::{exit_code, run_in_kind, write_widget_crd};

async fn two_alpha_namespaces(env: Arc<Environment>) -> anyhow::Result<()> {
    let ctx = env.cancellation().clone();
    let first = env.create_namespace(&ctx, "alpha").await?;
    let second = env.create_namespace(&ctx, "alpha").await?;

    let (a, b) = (first.name_any(), second.name_any());
    anyhow::ensure!(a != b, "namespace names collided: {a}");
    anyhow::ensure!(a.starts_with("alpha-"), "unexpected name {a}");
    anyhow::ensure!(b.starts_with("alpha-"), "unexpected name {b}");

    let api: Api<Namespace> = env.api();
    for name in [&a, &b] {
        let fetched = api.get(name).await?;
        anyhow::ensure!(fetched.name_any() == *name, "get returned {}", fetched.name_any());
    }
    Ok(())
}

/// Story: a test isolates itself in fresh namespaces sharing a prefix
#[tokio::test]
#[ignore]
async fn story_same_prefix_yields_distinct_namespaces() {
    let crds = tempfile::tempdir().unwrap();
    let builder = RunInput::builder(|env| async move { exit_code(two_alpha_namespaces(env).await) })
        .crd_directory_paths([write_widget_crd(crds.path())]);

    assert_eq!(run_in_kind(builder).await, 0);
}

/// Story: an invalid prefix is rejected by the API server and surfaces as a
/// recoverable error inside the test body
#[tokio::test]
#[ignore]
async fn story_invalid_prefix_is_reported_to_the_body() {
    let crds = tempfile::tempdir().unwrap();
    let builder = RunInput::builder(|env| async move {
        let ctx = env.cancellation().clone();
        match env.create_namespace(&ctx, "Not_A_DNS_Label").await {
            Err(kube_envtest::Error::ResourceCreation { prefix, .. }) if prefix == "Not_A_DNS_Label" => 0,
            other => {
                eprintln!("expected ResourceCreation, got {other:?}");
                1
            }
        }
    })
    .crd_directory_paths([write_widget_crd(crds.path())]);

    assert_eq!(run_in_kind(builder).await, 0);
}

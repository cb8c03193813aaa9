//! Full runs against a kind fixture
//!
//! These tests tell the story of a controller author: register an index and
//! a reconciler, then write a test body that relies on both being live the
//! moment it starts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DynamicObject, GroupVersionKind, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use kube_envtest::manager::{Indexer, Reconciler};
use kube_envtest::{Environment, RunInput};
use serde_json::json;

use super::helpers::{eventually, exit_code, run_in_kind, write_widget_crd};

const SEEN_ANNOTATION: &str = "envtest.example.com/seen";
const APP_INDEX: &str = "by-app";

fn configmap_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "ConfigMap")
}

fn app_index() -> Indexer {
    Indexer::typed::<ConfigMap, _>(APP_INDEX, |cm| {
        cm.labels().get("app").cloned().into_iter().collect()
    })
}

async fn annotate(cm: Arc<ConfigMap>, client: Arc<Client>) -> Result<Action, kube::Error> {
    if cm.annotations().contains_key(SEEN_ANNOTATION) {
        return Ok(Action::await_change());
    }
    let Some(namespace) = cm.namespace() else {
        return Ok(Action::await_change());
    };
    let api: Api<ConfigMap> = Api::namespaced(client.as_ref().clone(), &namespace);
    let patch = json!({ "metadata": { "annotations": { SEEN_ANNOTATION: "true" } } });
    api.patch(&cm.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(Action::await_change())
}

fn retry(_cm: Arc<ConfigMap>, _err: &kube::Error, _client: Arc<Client>) -> Action {
    Action::requeue(Duration::from_secs(1))
}

fn labelled_configmap(namespace: &str, app: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(format!("{app}-settings")),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("mode".to_string(), "test".to_string())])),
        ..Default::default()
    }
}

async fn reconciler_and_index_are_live(env: Arc<Environment>) -> anyhow::Result<()> {
    let ctx = env.cancellation().clone();
    let ns = env.create_namespace(&ctx, "lifecycle").await?.name_any();

    let api: Api<ConfigMap> = env.namespaced_api(&ns);
    api.create(&PostParams::default(), &labelled_configmap(&ns, "web"))
        .await?;

    let caches = env.manager().caches();
    eventually(Duration::from_secs(30), || {
        let caches = caches.clone();
        let ns = ns.clone();
        async move {
            let hits = caches.lookup(&configmap_gvk(), APP_INDEX, "web")?;
            Ok(hits
                .iter()
                .any(|obj| obj.namespace().as_deref() == Some(ns.as_str()))
                .then_some(()))
        }
    })
    .await?;

    eventually(Duration::from_secs(30), || {
        let api = api.clone();
        async move {
            let cm = api.get("web-settings").await?;
            Ok(cm.annotations().contains_key(SEEN_ANNOTATION).then_some(()))
        }
    })
    .await?;
    Ok(())
}

async fn widget_round_trip(env: Arc<Environment>) -> anyhow::Result<()> {
    let ctx = env.cancellation().clone();
    let ns = env.create_namespace(&ctx, "widgets").await?.name_any();
    let gvk = GroupVersionKind::gvk("envtest.example.com", "v1", "Widget");
    let api: Api<DynamicObject> = env.dynamic_api(&gvk, Some(ns.as_str()))?;

    let widget: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "envtest.example.com/v1",
        "kind": "Widget",
        "metadata": { "name": "sprocket", "namespace": ns },
        "spec": { "teeth": 12 }
    }))?;
    api.create(&PostParams::default(), &widget).await?;

    let fetched = api.get("sprocket").await?;
    anyhow::ensure!(fetched.data["spec"]["teeth"] == 12, "unexpected spec");
    Ok(())
}

/// Story: a controller author registers an index and a reconciler and the
/// body observes both working against the fixture
#[tokio::test]
#[ignore]
async fn story_indexer_and_reconciler_run_before_the_body() {
    let crds = tempfile::tempdir().unwrap();
    let builder = RunInput::builder(|env| async move {
        exit_code(reconciler_and_index_are_live(env).await)
    })
    .crd_directory_paths([write_widget_crd(crds.path())])
    .setup_indexers(|_ctx, manager| manager.register_indexer(app_index()))
    .setup_reconcilers(|_ctx, manager| {
        let client = manager.client();
        manager.register_reconciler(Reconciler::controller(
            "configmap-annotator",
            Api::<ConfigMap>::all(client.clone()),
            annotate,
            retry,
            Arc::new(client),
        ))
    });

    assert_eq!(run_in_kind(builder).await, 0);
}

/// Story: CRDs from the configured directory are installed and usable
/// through the dynamic API before the body starts
#[tokio::test]
#[ignore]
async fn story_installed_crds_are_usable() {
    let crds = tempfile::tempdir().unwrap();
    let builder = RunInput::builder(|env| async move { exit_code(widget_round_trip(env).await) })
        .crd_directory_paths([write_widget_crd(crds.path())]);

    assert_eq!(run_in_kind(builder).await, 0);
}

/// Story: the exit code of a failing body is passed through unchanged and
/// the run still shuts down cleanly
#[tokio::test]
#[ignore]
async fn story_failing_body_exit_code_is_preserved() {
    let crds = tempfile::tempdir().unwrap();
    let builder = RunInput::builder(|_env| async { 42 })
        .crd_directory_paths([write_widget_crd(crds.path())]);

    assert_eq!(run_in_kind(builder).await, 42);
}

//! Loading CRD manifests from disk and installing them into a fixture

use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use tracing::{debug, info};

use crate::Error;

const FIELD_MANAGER: &str = "kube-envtest";
const CRD_KIND: &str = "CustomResourceDefinition";
const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Default time to wait for a CRD to become Established
pub const DEFAULT_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Read CRDs from every path, in order
///
/// A path may be a single manifest file or a directory. Directories are
/// scanned one level deep for `.yaml`, `.yml` and `.json` files, sorted by
/// file name. Missing paths are skipped unless `error_if_missing` is set.
pub fn load_crds(
    paths: &[PathBuf],
    error_if_missing: bool,
) -> Result<Vec<CustomResourceDefinition>, Error> {
    let mut crds = Vec::new();

    for path in paths {
        if !path.exists() {
            if error_if_missing {
                return Err(Error::crd_load(path, "path does not exist"));
            }
            debug!(path = %path.display(), "CRD path missing, skipping");
            continue;
        }

        for file in manifest_files(path)? {
            let contents = std::fs::read_to_string(&file)
                .map_err(|e| Error::crd_load(&file, e.to_string()))?;
            crds.extend(parse_crds(&contents, &file)?);
        }
    }

    info!(count = crds.len(), "Loaded CRDs from disk");
    Ok(crds)
}

fn manifest_files(path: &Path) -> Result<Vec<PathBuf>, Error> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let entries = std::fs::read_dir(path).map_err(|e| Error::crd_load(path, e.to_string()))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::crd_load(path, e.to_string()))?;
        let file = entry.path();
        let is_manifest = file
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext));
        if file.is_file() && is_manifest {
            files.push(file);
        }
    }
    files.sort();
    Ok(files)
}

/// Parse every CRD out of a (possibly multi-document) manifest
///
/// Documents of other kinds and empty documents are ignored. JSON parses as
/// YAML, so one code path handles both.
pub fn parse_crds(contents: &str, source: &Path) -> Result<Vec<CustomResourceDefinition>, Error> {
    let mut crds = Vec::new();

    for document in serde_yaml::Deserializer::from_str(contents) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| Error::crd_load(source, e.to_string()))?;
        if value.is_null() {
            continue;
        }

        let kind = value.get("kind").and_then(|k| k.as_str());
        if kind != Some(CRD_KIND) {
            debug!(source = %source.display(), ?kind, "Skipping non-CRD document");
            continue;
        }

        let crd: CustomResourceDefinition = serde_yaml::from_value(value)
            .map_err(|e| Error::crd_load(source, e.to_string()))?;
        crds.push(crd);
    }

    Ok(crds)
}

/// Apply CRDs with server-side apply and wait until each is Established
pub async fn install_crds(
    client: &Client,
    crds: &[CustomResourceDefinition],
    establish_timeout: Duration,
) -> Result<(), Error> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in crds {
        let name = crd.name_any();
        info!(crd = %name, "Installing CRD");
        api.patch(&name, &params, &Patch::Apply(crd)).await?;
    }

    for crd in crds {
        let name = crd.name_any();
        let established = await_condition(api.clone(), &name, conditions::is_crd_established());
        match tokio::time::timeout(establish_timeout, established).await {
            Ok(Ok(_)) => debug!(crd = %name, "CRD established"),
            Ok(Err(e)) => {
                return Err(Error::fixture_start(format!(
                    "waiting for CRD {name} failed: {e}"
                )))
            }
            Err(_) => {
                return Err(Error::fixture_start(format!(
                    "CRD {name} not established after {establish_timeout:?}"
                )))
            }
        }
    }

    Ok(())
}

/// Delete CRDs, ignoring ones that are already gone
pub async fn uninstall_crds(client: &Client, crds: &[CustomResourceDefinition]) -> Result<(), Error> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());

    for crd in crds {
        let name = crd.name_any();
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!(crd = %name, "Deleted CRD"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

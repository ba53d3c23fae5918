//! Versioned controller configuration, stored in a ConfigMap inside the
//! cluster.
//!
//! The in-cluster controller only understands the latest schema. Upgrades
//! therefore read whatever version is stored, migrate it through the
//! version chain and write the result back before the new controller image
//! rolls out. Parsing is strict (unknown fields rejected) so a document
//! can never silently satisfy the wrong version.

use base64::Engine;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::errors::{LifecycleError, Result};

pub const CONTROLLER_NAME: &str = "capstan-controller";
pub const CONTROLLER_NAMESPACE: &str = "capstan-system";
pub const CONFIGMAP_NAME: &str = "capstan-controller-config";
pub const STORAGE_KEY: &str = "config.json";

/// First schema generation. Retention values were plain numbers with the
/// unit (days) implied, and the authenticator took one raw PEM document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfigV1 {
    pub controller_image: String,
    pub log_retention: u32,
    pub metric_retention: u32,
    pub api_authn_pubkey_pem: String,
    #[serde(default)]
    pub terminate: bool,
}

/// Metadata the lifecycle tooling records about its last write. Absent in
/// documents written by older tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CliMetadata {
    #[serde(default)]
    pub upgraded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub upgraded_by_version: Option<String>,
}

/// Latest schema generation: retention fields carry their unit in the
/// name, the authenticator takes a key set (key id to base64 PEM), and the
/// tooling metadata block exists. The second generation is this document
/// without `cli_metadata`, which defaults; no separate type is needed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LatestControllerConfig {
    pub controller_image: String,
    pub log_retention_days: u32,
    pub metric_retention_days: u32,
    pub api_authenticator_pubkey_set_json: String,
    #[serde(default)]
    pub terminate: bool,
    #[serde(default)]
    pub cli_metadata: CliMetadata,
}

/// Build the authenticator key set from a single PEM document: a JSON map
/// from key id (hex SHA-1 of the PEM text) to the base64-encoded PEM. An
/// empty PEM yields an empty set.
#[must_use]
pub fn authenticator_key_set_json(pem: &str) -> String {
    if pem.is_empty() {
        return "{}".to_owned();
    }
    let key_id = hex::encode(Sha1::digest(pem.as_bytes()));
    let encoded = base64::engine::general_purpose::STANDARD.encode(pem.as_bytes());
    serde_json::json!({ key_id: encoded }).to_string()
}

fn migrate_v1(v1: ControllerConfigV1) -> LatestControllerConfig {
    LatestControllerConfig {
        controller_image: v1.controller_image,
        log_retention_days: v1.log_retention,
        metric_retention_days: v1.metric_retention,
        api_authenticator_pubkey_set_json: authenticator_key_set_json(&v1.api_authn_pubkey_pem),
        terminate: v1.terminate,
        cli_metadata: CliMetadata::default(),
    }
}

/// Parse a stored document of any known schema generation and migrate it
/// to the latest. Documents matching no generation are a configuration
/// error (not retryable: the stored state will not improve on its own).
pub fn upgrade_to_latest(doc: &Value) -> Result<LatestControllerConfig> {
    if let Ok(latest) = serde_json::from_value::<LatestControllerConfig>(doc.clone()) {
        debug!("stored controller config already at the latest schema");
        return Ok(latest);
    }
    match serde_json::from_value::<ControllerConfigV1>(doc.clone()) {
        Ok(v1) => {
            info!("migrating stored controller config from schema v1");
            Ok(migrate_v1(v1))
        }
        Err(e) => Err(LifecycleError::Configuration(format!(
            "stored controller config matches no known schema: {e}"
        ))),
    }
}

/// Read the stored config document. `None` when the ConfigMap does not
/// exist (a cluster that was never fully installed, or mid-teardown).
pub async fn fetch(client: &Client) -> Result<Option<Value>> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), CONTROLLER_NAMESPACE);
    let cm = match api.get(CONFIGMAP_NAME).await {
        Ok(cm) => cm,
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let raw = cm
        .data
        .as_ref()
        .and_then(|d| d.get(STORAGE_KEY))
        .ok_or_else(|| {
            LifecycleError::Configuration(format!(
                "ConfigMap {CONTROLLER_NAMESPACE}/{CONFIGMAP_NAME} has no {STORAGE_KEY} key"
            ))
        })?;
    let doc = serde_json::from_str(raw).map_err(|e| {
        LifecycleError::Configuration(format!("stored controller config is not JSON: {e}"))
    })?;
    Ok(Some(doc))
}

/// Write the config document back, creating the ConfigMap when missing and
/// merging over an existing one.
pub async fn store(client: &Client, config: &LatestControllerConfig) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), CONTROLLER_NAMESPACE);
    let raw = serde_json::to_string(config)
        .map_err(|e| LifecycleError::Configuration(format!("serialize controller config: {e}")))?;
    let cm = ConfigMap {
        metadata: kube::api::ObjectMeta {
            name: Some(CONFIGMAP_NAME.to_owned()),
            namespace: Some(CONTROLLER_NAMESPACE.to_owned()),
            ..kube::api::ObjectMeta::default()
        },
        data: Some([(STORAGE_KEY.to_owned(), raw)].into()),
        ..ConfigMap::default()
    };
    match api.create(&PostParams::default(), &cm).await {
        Ok(_) => {
            info!("controller config ConfigMap created");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 409 => {
            api.patch(
                CONFIGMAP_NAME,
                &PatchParams::default(),
                &Patch::Merge(&cm),
            )
            .await?;
            info!("controller config ConfigMap updated");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

//! Direct Kubernetes API calls used by the drivers, outside the cache.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, info};

use crate::errors::{LifecycleError, Result};

/// Cheap read against the API server to verify the control plane answers
/// before informers are started against it.
pub async fn reachability_check(client: &Client) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    namespaces.list(&ListParams::default().limit(1)).await?;
    debug!("kubernetes api reachability check passed");
    Ok(())
}

/// Container image of the deployment's first container.
pub async fn get_deployment_image(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<String> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let deployment = deployments.get(name).await?;
    deployment
        .spec
        .and_then(|s| s.template.spec)
        .and_then(|s| s.containers.into_iter().next())
        .and_then(|c| c.image)
        .ok_or_else(|| {
            LifecycleError::TransientInfra(format!(
                "deployment {namespace}/{name} has no container image"
            ))
        })
}

/// Patch the image of the named container. The bumped pod template
/// generation makes the rollout observable through the cache.
pub async fn set_deployment_image(
    client: &Client,
    namespace: &str,
    name: &str,
    container: &str,
    image: &str,
) -> Result<()> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let patch = json!({
        "spec": { "template": { "spec": { "containers": [
            { "name": container, "image": image }
        ]}}}
    });
    deployments
        .patch(name, &PatchParams::default(), &Patch::Strategic(patch))
        .await?;
    info!("deployment {namespace}/{name}: image set to {image}");
    Ok(())
}

pub async fn scale_deployment(
    client: &Client,
    namespace: &str,
    name: &str,
    replicas: i32,
) -> Result<()> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let patch = json!({ "spec": { "replicas": replicas } });
    deployments
        .patch(name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    info!("deployment {namespace}/{name}: scaled to {replicas}");
    Ok(())
}

//! Cluster upgrade driver.
//!
//! Upgrades hand ownership of the cluster from the old in-cluster
//! controller to a new one: verify the target image exists, migrate and
//! store the controller config, quiesce the old controller, roll the
//! deployment to the new image and wait for the cluster to settle. A dry
//! run performs every read-only check and reports the planned changes
//! without mutating anything.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::Client;
use tracing::info;

use crate::cloud::CloudApi;
use crate::cluster::api::{
    get_deployment_image, reachability_check, scale_deployment, set_deployment_image,
};
use crate::cluster::cache::{CacheReader, TrackedResource, WatchedKind};
use crate::cluster::informers::Informers;
use crate::config::LifecycleConfig;
use crate::controller_config::{self, CliMetadata, CONTROLLER_NAME, CONTROLLER_NAMESPACE};
use crate::errors::{LifecycleError, Result};
use crate::readiness::{self, PollSettings};
use crate::retry::{retry_upon_any_error, run_attempt, RetrySettings};

pub const UPGRADE_ATTEMPTS: u32 = 5;
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

/// When set to a truthy value, the upgrade stops after its read-only
/// checks and reports what it would change.
pub const DRY_RUN_ENV: &str = "CAPSTAN_DRY_RUN";

/// The controller image this tooling version installs.
#[must_use]
pub fn controller_image() -> String {
    format!("capstan/controller:{}", env!("CARGO_PKG_VERSION"))
}

#[must_use]
pub fn parse_dry_run(value: Option<&str>) -> bool {
    matches!(
        value.map(str::trim).map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes")
    )
}

fn dry_run_requested() -> bool {
    parse_dry_run(std::env::var(DRY_RUN_ENV).ok().as_deref())
}

/// The controller deployment finished rolling out onto the new image.
#[must_use]
pub fn controller_rolled_out(res: &TrackedResource) -> bool {
    res.rollout
        .as_ref()
        .is_some_and(|r| r.complete() && r.ready >= 1)
}

pub async fn upgrade_cluster(config: &LifecycleConfig, api: Arc<dyn CloudApi>) -> Result<()> {
    config.validate()?;
    info!(
        "upgrading cluster {} to controller image {}",
        config.cluster_name,
        controller_image()
    );
    let settings = RetrySettings {
        action_name: "upgrade",
        max_attempts: UPGRADE_ATTEMPTS,
        delay: RETRY_DELAY,
    };
    retry_upon_any_error(&settings, || {
        let api = api.clone();
        let config = config.clone();
        async move {
            run_attempt("upgrade", ATTEMPT_TIMEOUT, upgrade_attempt(&config, api)).await
        }
    })
    .await?;
    info!("cluster {}: upgrade complete", config.cluster_name);
    Ok(())
}

async fn upgrade_attempt(config: &LifecycleConfig, api: Arc<dyn CloudApi>) -> Result<()> {
    let client = api
        .cluster_client(&config.cluster_name)
        .await?
        .ok_or_else(|| {
            LifecycleError::TransientInfra(format!(
                "could not fetch kubeconfig for cluster {}",
                config.cluster_name
            ))
        })?;
    reachability_check(&client).await?;

    let image = controller_image();
    if !api.image_exists(&image).await? {
        return Err(LifecycleError::fatal(
            1,
            format!("controller image {image} does not exist in the registry"),
        ));
    }

    let doc = controller_config::fetch(&client).await?.ok_or_else(|| {
        LifecycleError::Configuration(
            "no controller config found, the cluster does not look installed".into(),
        )
    })?;
    let mut cfg = controller_config::upgrade_to_latest(&doc)?;
    let previous_image = cfg.controller_image.clone();
    cfg.controller_image = image.clone();
    cfg.cli_metadata = CliMetadata {
        upgraded_at: Some(Utc::now()),
        upgraded_by_version: Some(env!("CARGO_PKG_VERSION").to_owned()),
    };

    if dry_run_requested() {
        info!(
            "dry run: would migrate the controller config and move the \
             controller image {previous_image} -> {image}"
        );
        return Ok(());
    }

    controller_config::store(&client, &cfg).await?;

    let kinds = [
        WatchedKind::Deployment,
        WatchedKind::DaemonSet,
        WatchedKind::StatefulSet,
        WatchedKind::Certificate,
    ];
    let (informers, mut reader) = Informers::start(&client, &kinds);
    let outcome = roll_controller(&client, &mut reader, &image).await;
    let outcome = match outcome {
        Ok(()) => {
            readiness::wait_until_settled(&mut reader, &PollSettings::upgrade_default()).await
        }
        err => err,
    };
    informers.shutdown().await;
    outcome
}

/// Replace the controller deployment's image: scale the old controller
/// down so it cannot fight the new one over cluster state, patch the
/// image, scale back up and wait for the rollout to complete.
async fn roll_controller(client: &Client, reader: &mut CacheReader, image: &str) -> Result<()> {
    reader.hydrated(&[WatchedKind::Deployment]).await?;

    let current =
        get_deployment_image(client, CONTROLLER_NAMESPACE, CONTROLLER_NAME).await?;
    if current == image {
        info!("controller already runs {image}, skipping the rollout");
        return Ok(());
    }

    scale_deployment(client, CONTROLLER_NAMESPACE, CONTROLLER_NAME, 0).await?;
    wait_for_controller(reader, |res| {
        res.rollout.as_ref().is_some_and(|r| r.ready == 0)
    })
    .await?;
    info!("old controller quiesced");

    set_deployment_image(client, CONTROLLER_NAMESPACE, CONTROLLER_NAME, CONTROLLER_NAME, image)
        .await?;
    scale_deployment(client, CONTROLLER_NAMESPACE, CONTROLLER_NAME, 1).await?;
    wait_for_controller(reader, controller_rolled_out).await?;
    info!("controller rollout to {image} complete");
    Ok(())
}

async fn wait_for_controller(
    reader: &mut CacheReader,
    predicate: impl Fn(&TrackedResource) -> bool,
) -> Result<()> {
    let key = format!("{CONTROLLER_NAMESPACE}/{CONTROLLER_NAME}");
    loop {
        if let Some(res) = reader.snapshot().get(WatchedKind::Deployment, &key) {
            if predicate(res) {
                return Ok(());
            }
        }
        reader.changed().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::cache::RolloutStatus;

    #[test]
    fn dry_run_parsing_accepts_common_truthy_values() {
        assert!(parse_dry_run(Some("1")));
        assert!(parse_dry_run(Some("true")));
        assert!(parse_dry_run(Some(" YES ")));
        assert!(!parse_dry_run(Some("0")));
        assert!(!parse_dry_run(Some("false")));
        assert!(!parse_dry_run(Some("")));
        assert!(!parse_dry_run(None));
    }

    #[test]
    fn controller_image_carries_the_tooling_version() {
        assert_eq!(
            controller_image(),
            format!("capstan/controller:{}", env!("CARGO_PKG_VERSION"))
        );
    }

    #[test]
    fn rollout_verdict_requires_a_ready_replica() {
        let mut res = TrackedResource {
            name: CONTROLLER_NAME.into(),
            namespace: Some(CONTROLLER_NAMESPACE.into()),
            rollout: Some(RolloutStatus {
                desired: 0,
                ready: 0,
                updated: 0,
                generation: 2,
                observed_generation: 2,
            }),
            ..TrackedResource::default()
        };
        // scaled to zero: complete, but nothing serving
        assert!(!controller_rolled_out(&res));
        res.rollout = Some(RolloutStatus {
            desired: 1,
            ready: 1,
            updated: 1,
            generation: 2,
            observed_generation: 2,
        });
        assert!(controller_rolled_out(&res));
    }
}

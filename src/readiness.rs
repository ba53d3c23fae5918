//! Readiness poller over cache snapshots.
//!
//! Periodically counts "still active" resources per watched kind and
//! returns once the total drops to the configured threshold. The poller
//! never fails on its own: a cluster that does not converge is caught by
//! the attempt deadline, not here.

use std::time::Duration;

use tracing::{debug, info};

use crate::cluster::cache::{CacheReader, RolloutStatus, TrackedResource, WatchedKind};
use crate::errors::Result;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Per-kind activity predicate: does this resource still count against
/// convergence?
pub type ActivityPredicate = fn(WatchedKind, &TrackedResource) -> bool;

pub struct PollSettings {
    pub kinds: Vec<WatchedKind>,
    pub interval: Duration,
    /// The poll ends when the total active count is at or below this.
    pub exit_threshold: usize,
    pub is_active: ActivityPredicate,
}

/// Workloads are active while their rollout is incomplete, certificates
/// while not Ready, everything else by existing at all.
#[must_use]
pub fn default_activity(kind: WatchedKind, res: &TrackedResource) -> bool {
    match kind {
        WatchedKind::Deployment | WatchedKind::DaemonSet | WatchedKind::StatefulSet => {
            !res.rollout.as_ref().is_some_and(RolloutStatus::complete)
        }
        WatchedKind::Certificate => res.ready_condition != Some(true),
        WatchedKind::PersistentVolume | WatchedKind::ConfigMap => true,
    }
}

impl PollSettings {
    /// Destroy convergence: done once no persistent volume is left. The
    /// volumes are the last thing the in-cluster teardown releases, so
    /// their disappearance implies the rest is gone too.
    #[must_use]
    pub fn destroy_default() -> Self {
        Self {
            kinds: vec![WatchedKind::PersistentVolume],
            interval: DEFAULT_POLL_INTERVAL,
            exit_threshold: 0,
            is_active: default_activity,
        }
    }

    /// Upgrade convergence: every workload rolled out, every certificate
    /// Ready.
    #[must_use]
    pub fn upgrade_default() -> Self {
        Self {
            kinds: vec![
                WatchedKind::Deployment,
                WatchedKind::DaemonSet,
                WatchedKind::StatefulSet,
                WatchedKind::Certificate,
            ],
            interval: DEFAULT_POLL_INTERVAL,
            exit_threshold: 0,
            is_active: default_activity,
        }
    }
}

/// Poll cache snapshots until the active count settles at the threshold.
/// Waits for hydration of every tracked kind first, so an informer that
/// has not listed yet can never be mistaken for an empty cluster.
pub async fn wait_until_settled(reader: &mut CacheReader, settings: &PollSettings) -> Result<()> {
    reader.hydrated(&settings.kinds).await?;
    info!("cache hydrated, start polling for convergence");
    loop {
        let snap = reader.snapshot();
        let mut total = 0;
        for kind in &settings.kinds {
            let active: Vec<&TrackedResource> = snap
                .resources(*kind)
                .filter(|r| (settings.is_active)(*kind, r))
                .collect();
            if !active.is_empty() {
                info!("waiting for {} {}(s)", active.len(), kind.as_str());
                if active.len() < 3 {
                    for r in &active {
                        debug!("  still active: {} {}", kind.as_str(), r.key());
                    }
                }
            }
            total += active.len();
        }
        if total <= settings.exit_threshold {
            info!("convergence reached ({total} active resource(s))");
            return Ok(());
        }
        tokio::time::sleep(settings.interval).await;
    }
}

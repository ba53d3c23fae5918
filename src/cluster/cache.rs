//! In-memory cache of watched cluster resources.
//!
//! A single writer task applies informer events to an owned snapshot and
//! publishes copies through a watch channel; any number of readers take
//! consistent point-in-time snapshots without locking the writer. Per kind,
//! a `loaded` flag records whether the initial listing completed, so that
//! consumers never mistake a not-yet-hydrated cache for an empty cluster.

use std::collections::BTreeMap;

use tokio::sync::watch;
use tracing::debug;

use crate::errors::{LifecycleError, Result};

/// The resource kinds the informers can track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WatchedKind {
    Deployment,
    DaemonSet,
    StatefulSet,
    PersistentVolume,
    ConfigMap,
    Certificate,
}

impl WatchedKind {
    pub const ALL: &'static [WatchedKind] = &[
        WatchedKind::Deployment,
        WatchedKind::DaemonSet,
        WatchedKind::StatefulSet,
        WatchedKind::PersistentVolume,
        WatchedKind::ConfigMap,
        WatchedKind::Certificate,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WatchedKind::Deployment => "Deployment",
            WatchedKind::DaemonSet => "DaemonSet",
            WatchedKind::StatefulSet => "StatefulSet",
            WatchedKind::PersistentVolume => "PersistentVolume",
            WatchedKind::ConfigMap => "ConfigMap",
            WatchedKind::Certificate => "Certificate",
        }
    }
}

/// Rollout counters of a workload controller, normalized across
/// Deployments, DaemonSets and StatefulSets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloutStatus {
    pub desired: i32,
    pub ready: i32,
    pub updated: i32,
    pub generation: i64,
    pub observed_generation: i64,
}

impl RolloutStatus {
    /// A rollout is complete once the controller observed the latest spec
    /// and every desired replica is both updated and ready.
    #[must_use]
    pub fn complete(&self) -> bool {
        self.observed_generation >= self.generation
            && self.updated >= self.desired
            && self.ready >= self.desired
    }
}

/// Cache entry for one watched object.
#[derive(Debug, Clone, Default)]
pub struct TrackedResource {
    pub name: String,
    pub namespace: Option<String>,
    pub deletion_pending: bool,
    pub rollout: Option<RolloutStatus>,
    /// Ready condition for kinds that carry one (certificates).
    pub ready_condition: Option<bool>,
}

impl TrackedResource {
    #[must_use]
    pub fn key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}/{}", self.name),
            None => self.name.clone(),
        }
    }
}

/// All cached objects of one kind plus the hydration flag.
#[derive(Debug, Clone, Default)]
pub struct KindState {
    pub loaded: bool,
    pub resources: BTreeMap<String, TrackedResource>,
}

/// Point-in-time copy of the whole cache. Cheap to clone relative to the
/// handful of kinds and objects tracked here.
#[derive(Debug, Clone, Default)]
pub struct ClusterResourceSnapshot {
    kinds: BTreeMap<WatchedKind, KindState>,
}

impl ClusterResourceSnapshot {
    #[must_use]
    pub fn kind(&self, kind: WatchedKind) -> Option<&KindState> {
        self.kinds.get(&kind)
    }

    #[must_use]
    pub fn loaded(&self, kind: WatchedKind) -> bool {
        self.kinds.get(&kind).is_some_and(|s| s.loaded)
    }

    pub fn resources(&self, kind: WatchedKind) -> impl Iterator<Item = &TrackedResource> {
        self.kinds
            .get(&kind)
            .into_iter()
            .flat_map(|s| s.resources.values())
    }

    #[must_use]
    pub fn get(&self, kind: WatchedKind, key: &str) -> Option<&TrackedResource> {
        self.kinds.get(&kind).and_then(|s| s.resources.get(key))
    }
}

/// Event stream the informers feed into the writer, one ordered stream per
/// kind. A watch restart replays the whole listing (`InitStart` .. `InitDone`)
/// and atomically replaces that kind's entries.
#[derive(Debug)]
pub enum CacheEvent {
    InitStart,
    InitApply(TrackedResource),
    InitDone,
    Apply(TrackedResource),
    Delete(String),
}

/// Single-writer cache state. Apply events, then read via the paired
/// [`CacheReader`].
pub struct CacheWriter {
    snapshot: ClusterResourceSnapshot,
    staging: BTreeMap<WatchedKind, BTreeMap<String, TrackedResource>>,
    tx: watch::Sender<ClusterResourceSnapshot>,
}

impl CacheWriter {
    #[must_use]
    pub fn channel() -> (CacheWriter, CacheReader) {
        let snapshot = ClusterResourceSnapshot::default();
        let (tx, rx) = watch::channel(snapshot.clone());
        (
            CacheWriter {
                snapshot,
                staging: BTreeMap::new(),
                tx,
            },
            CacheReader { rx },
        )
    }

    /// Apply one informer event and publish the updated snapshot.
    pub fn apply(&mut self, kind: WatchedKind, event: CacheEvent) {
        match event {
            CacheEvent::InitStart => {
                self.staging.insert(kind, BTreeMap::new());
            }
            CacheEvent::InitApply(res) => {
                self.staging.entry(kind).or_default().insert(res.key(), res);
            }
            CacheEvent::InitDone => {
                let resources = self.staging.remove(&kind).unwrap_or_default();
                debug!(
                    kind = kind.as_str(),
                    count = resources.len(),
                    "initial listing complete"
                );
                self.snapshot.kinds.insert(
                    kind,
                    KindState {
                        loaded: true,
                        resources,
                    },
                );
            }
            CacheEvent::Apply(res) => {
                self.snapshot
                    .kinds
                    .entry(kind)
                    .or_default()
                    .resources
                    .insert(res.key(), res);
            }
            CacheEvent::Delete(key) => {
                if let Some(state) = self.snapshot.kinds.get_mut(&kind) {
                    state.resources.remove(&key);
                }
            }
        }
        // receivers only ever see complete snapshots
        self.tx.send_replace(self.snapshot.clone());
    }
}

/// Read side of the cache. Cloneable; each reader observes the same
/// published snapshots.
#[derive(Clone)]
pub struct CacheReader {
    rx: watch::Receiver<ClusterResourceSnapshot>,
}

impl CacheReader {
    #[must_use]
    pub fn snapshot(&self) -> ClusterResourceSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait until the initial listing for every given kind has completed.
    /// Errors when the writer went away before hydration finished.
    pub async fn hydrated(&mut self, kinds: &[WatchedKind]) -> Result<()> {
        self.rx
            .wait_for(|snap| kinds.iter().all(|k| snap.loaded(*k)))
            .await
            .map_err(|_| {
                LifecycleError::TransientInfra(
                    "cluster cache writer stopped before hydration completed".into(),
                )
            })?;
        Ok(())
    }

    /// Wait for the next published snapshot after the current one.
    pub async fn changed(&mut self) -> Result<()> {
        self.rx.changed().await.map_err(|_| {
            LifecycleError::TransientInfra("cluster cache writer stopped".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(name: &str, ns: Option<&str>) -> TrackedResource {
        TrackedResource {
            name: name.into(),
            namespace: ns.map(Into::into),
            ..TrackedResource::default()
        }
    }

    #[test]
    fn hydration_is_per_kind() {
        let (mut writer, reader) = CacheWriter::channel();
        writer.apply(WatchedKind::Deployment, CacheEvent::InitStart);
        writer.apply(
            WatchedKind::Deployment,
            CacheEvent::InitApply(res("ctrl", Some("sys"))),
        );
        // listing not complete: nothing visible, not loaded
        let snap = reader.snapshot();
        assert!(!snap.loaded(WatchedKind::Deployment));
        assert_eq!(snap.resources(WatchedKind::Deployment).count(), 0);

        writer.apply(WatchedKind::Deployment, CacheEvent::InitDone);
        let snap = reader.snapshot();
        assert!(snap.loaded(WatchedKind::Deployment));
        assert!(!snap.loaded(WatchedKind::PersistentVolume));
        assert!(snap.get(WatchedKind::Deployment, "sys/ctrl").is_some());
    }

    #[test]
    fn apply_and_delete_mutate_the_published_snapshot() {
        let (mut writer, reader) = CacheWriter::channel();
        writer.apply(WatchedKind::PersistentVolume, CacheEvent::InitStart);
        writer.apply(WatchedKind::PersistentVolume, CacheEvent::InitDone);
        writer.apply(
            WatchedKind::PersistentVolume,
            CacheEvent::Apply(res("pv-1", None)),
        );
        assert_eq!(reader.snapshot().resources(WatchedKind::PersistentVolume).count(), 1);
        writer.apply(
            WatchedKind::PersistentVolume,
            CacheEvent::Delete("pv-1".into()),
        );
        assert_eq!(reader.snapshot().resources(WatchedKind::PersistentVolume).count(), 0);
    }

    #[test]
    fn watch_restart_replaces_the_kind_atomically() {
        let (mut writer, reader) = CacheWriter::channel();
        writer.apply(WatchedKind::ConfigMap, CacheEvent::InitStart);
        writer.apply(WatchedKind::ConfigMap, CacheEvent::InitApply(res("a", Some("ns"))));
        writer.apply(WatchedKind::ConfigMap, CacheEvent::InitDone);

        // relist after a watch gap: "a" is gone, "b" appeared
        writer.apply(WatchedKind::ConfigMap, CacheEvent::InitStart);
        writer.apply(WatchedKind::ConfigMap, CacheEvent::InitApply(res("b", Some("ns"))));
        // mid-relist, readers still see the previous complete listing
        assert!(reader.snapshot().get(WatchedKind::ConfigMap, "ns/a").is_some());
        writer.apply(WatchedKind::ConfigMap, CacheEvent::InitDone);

        let snap = reader.snapshot();
        assert!(snap.get(WatchedKind::ConfigMap, "ns/a").is_none());
        assert!(snap.get(WatchedKind::ConfigMap, "ns/b").is_some());
    }

    #[test]
    fn snapshots_are_stable_copies() {
        let (mut writer, reader) = CacheWriter::channel();
        writer.apply(WatchedKind::Deployment, CacheEvent::InitStart);
        writer.apply(WatchedKind::Deployment, CacheEvent::InitDone);
        let before = reader.snapshot();
        writer.apply(
            WatchedKind::Deployment,
            CacheEvent::Apply(res("new", Some("ns"))),
        );
        // the earlier snapshot does not change under the reader
        assert_eq!(before.resources(WatchedKind::Deployment).count(), 0);
        assert_eq!(reader.snapshot().resources(WatchedKind::Deployment).count(), 1);
    }

    #[tokio::test]
    async fn hydrated_unblocks_once_all_kinds_loaded() {
        let (mut writer, reader) = CacheWriter::channel();
        let mut waiter = reader.clone();
        let wait = tokio::spawn(async move {
            waiter
                .hydrated(&[WatchedKind::Deployment, WatchedKind::DaemonSet])
                .await
        });
        writer.apply(WatchedKind::Deployment, CacheEvent::InitStart);
        writer.apply(WatchedKind::Deployment, CacheEvent::InitDone);
        assert!(!wait.is_finished());
        writer.apply(WatchedKind::DaemonSet, CacheEvent::InitStart);
        writer.apply(WatchedKind::DaemonSet, CacheEvent::InitDone);
        wait.await.unwrap().unwrap();
    }

    #[test]
    fn rollout_completion_requires_observed_generation() {
        let stale = RolloutStatus {
            desired: 1,
            ready: 1,
            updated: 1,
            generation: 2,
            observed_generation: 1,
        };
        assert!(!stale.complete());
        let done = RolloutStatus {
            observed_generation: 2,
            ..stale
        };
        assert!(done.complete());
    }
}

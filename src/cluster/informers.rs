//! Watch-based informers feeding the cluster resource cache.
//!
//! One watcher task per tracked kind translates the Kubernetes watch
//! protocol into [`CacheEvent`]s over a channel; a single applier task owns
//! the [`CacheWriter`]. Watch gaps are handled by the runtime's relist
//! (`Init` .. `InitDone`), which the cache applies as an atomic
//! replacement of that kind's entries.

use std::fmt::Debug;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolume};
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::cache::{
    CacheEvent, CacheReader, CacheWriter, RolloutStatus, TrackedResource, WatchedKind,
};
use crate::errors::Result;
use crate::sched::{self, TaskHandle};

/// Running informer set. Dropping this does not stop the tasks; call
/// [`Informers::shutdown`]. After shutdown the paired [`CacheReader`]
/// stays usable and simply stops receiving updates.
pub struct Informers {
    tasks: Vec<TaskHandle>,
}

impl Informers {
    /// Start one watcher per kind plus the cache applier.
    #[must_use]
    pub fn start(client: &Client, kinds: &[WatchedKind]) -> (Informers, CacheReader) {
        let (writer, reader) = CacheWriter::channel();
        let (tx, mut rx) = mpsc::channel::<(WatchedKind, CacheEvent)>(256);

        let mut tasks = Vec::with_capacity(kinds.len() + 1);
        tasks.push(sched::fork("cache applier", async move {
            let mut writer = writer;
            while let Some((kind, event)) = rx.recv().await {
                writer.apply(kind, event);
            }
            debug!("informer event channel closed, applier exits");
            Ok(())
        }));

        for kind in kinds {
            let kind = *kind;
            let client = client.clone();
            let tx = tx.clone();
            let label = format!("{} informer", kind.as_str());
            tasks.push(sched::fork(label, async move {
                match kind {
                    WatchedKind::Deployment => {
                        run_watch(Api::<Deployment>::all(client), kind, tx, track_deployment)
                            .await
                    }
                    WatchedKind::DaemonSet => {
                        run_watch(Api::<DaemonSet>::all(client), kind, tx, track_daemon_set)
                            .await
                    }
                    WatchedKind::StatefulSet => {
                        run_watch(Api::<StatefulSet>::all(client), kind, tx, track_stateful_set)
                            .await
                    }
                    WatchedKind::PersistentVolume => {
                        run_watch(Api::<PersistentVolume>::all(client), kind, tx, track_bare)
                            .await
                    }
                    WatchedKind::ConfigMap => {
                        run_watch(Api::<ConfigMap>::all(client), kind, tx, track_bare).await
                    }
                    WatchedKind::Certificate => {
                        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(
                            "cert-manager.io",
                            "v1",
                            "Certificate",
                        ));
                        let api = Api::<DynamicObject>::all_with(client, &ar);
                        run_dynamic_watch(api, kind, tx).await
                    }
                }
            }));
        }

        (Informers { tasks }, reader)
    }

    /// Stop all watcher tasks and the applier.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.cancel();
        }
        let failures = sched::join(self.tasks).await;
        for f in failures {
            warn!(task = %f.task, error = %f.error, "informer ended with an error");
        }
    }
}

async fn run_watch<K>(
    api: Api<K>,
    kind: WatchedKind,
    tx: mpsc::Sender<(WatchedKind, CacheEvent)>,
    extract: fn(&K) -> TrackedResource,
) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    while let Some(step) = stream.next().await {
        match step {
            Ok(event) => {
                let cache_event = match event {
                    Event::Init => CacheEvent::InitStart,
                    Event::InitApply(obj) => CacheEvent::InitApply(extract(&obj)),
                    Event::InitDone => CacheEvent::InitDone,
                    Event::Apply(obj) => CacheEvent::Apply(extract(&obj)),
                    Event::Delete(obj) => CacheEvent::Delete(extract(&obj).key()),
                };
                if tx.send((kind, cache_event)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                // the stream resumes with a relist after backoff
                warn!(kind = kind.as_str(), "watch error: {e}");
            }
        }
    }
    Ok(())
}

async fn run_dynamic_watch(
    api: Api<DynamicObject>,
    kind: WatchedKind,
    tx: mpsc::Sender<(WatchedKind, CacheEvent)>,
) -> Result<()> {
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    while let Some(step) = stream.next().await {
        match step {
            Ok(event) => {
                let cache_event = match event {
                    Event::Init => CacheEvent::InitStart,
                    Event::InitApply(obj) => CacheEvent::InitApply(track_certificate(&obj)),
                    Event::InitDone => CacheEvent::InitDone,
                    Event::Apply(obj) => CacheEvent::Apply(track_certificate(&obj)),
                    Event::Delete(obj) => CacheEvent::Delete(track_certificate(&obj).key()),
                };
                if tx.send((kind, cache_event)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(kind = kind.as_str(), "watch error: {e}");
            }
        }
    }
    Ok(())
}

fn meta_base<K: Resource>(obj: &K) -> TrackedResource {
    let meta = obj.meta();
    TrackedResource {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone(),
        deletion_pending: meta.deletion_timestamp.is_some(),
        rollout: None,
        ready_condition: None,
    }
}

fn track_deployment(d: &Deployment) -> TrackedResource {
    let mut tracked = meta_base(d);
    let status = d.status.as_ref();
    tracked.rollout = Some(RolloutStatus {
        desired: d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
        ready: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        updated: status.and_then(|s| s.updated_replicas).unwrap_or(0),
        generation: d.metadata.generation.unwrap_or(0),
        observed_generation: status.and_then(|s| s.observed_generation).unwrap_or(0),
    });
    tracked
}

fn track_daemon_set(d: &DaemonSet) -> TrackedResource {
    let mut tracked = meta_base(d);
    let status = d.status.as_ref();
    tracked.rollout = Some(RolloutStatus {
        desired: status.map(|s| s.desired_number_scheduled).unwrap_or(0),
        ready: status.map(|s| s.number_ready).unwrap_or(0),
        updated: status.and_then(|s| s.updated_number_scheduled).unwrap_or(0),
        generation: d.metadata.generation.unwrap_or(0),
        observed_generation: status.and_then(|s| s.observed_generation).unwrap_or(0),
    });
    tracked
}

fn track_stateful_set(s: &StatefulSet) -> TrackedResource {
    let mut tracked = meta_base(s);
    let status = s.status.as_ref();
    tracked.rollout = Some(RolloutStatus {
        desired: s.spec.as_ref().and_then(|sp| sp.replicas).unwrap_or(1),
        ready: status.and_then(|st| st.ready_replicas).unwrap_or(0),
        updated: status.and_then(|st| st.updated_replicas).unwrap_or(0),
        generation: s.metadata.generation.unwrap_or(0),
        observed_generation: status.and_then(|st| st.observed_generation).unwrap_or(0),
    });
    tracked
}

/// Kinds tracked purely for existence (volumes, config maps).
fn track_bare<K: Resource>(obj: &K) -> TrackedResource {
    meta_base(obj)
}

fn track_certificate(obj: &DynamicObject) -> TrackedResource {
    let mut tracked = TrackedResource {
        name: obj.metadata.name.clone().unwrap_or_default(),
        namespace: obj.metadata.namespace.clone(),
        deletion_pending: obj.metadata.deletion_timestamp.is_some(),
        rollout: None,
        ready_condition: None,
    };
    tracked.ready_condition = obj
        .data
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .and_then(|conds| {
            conds
                .iter()
                .find(|c| c.get("type").and_then(|t| t.as_str()) == Some("Ready"))
        })
        .map(|c| c.get("status").and_then(|s| s.as_str()) == Some("True"));
    tracked
}

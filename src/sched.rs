//! Cooperative fork/join task scheduler.
//!
//! `fork` starts a task immediately and hands back an opaque handle; a
//! group's `join` awaits every handle regardless of individual outcome, so
//! independent cleanup operations all get their at-least-once attempt even
//! when siblings fail. Cancellation is best-effort: a task mid-flight on a
//! network call may still complete its side effect, which is why every
//! operation run through here must be idempotent.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::{LifecycleError, Result};

/// Handle to a forked task. Dropping the handle does not cancel the task.
pub struct TaskHandle {
    label: String,
    handle: JoinHandle<Result<()>>,
}

impl TaskHandle {
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Request cooperative termination. In-flight outbound calls are not
    /// aborted; the task stops at its next await point.
    pub fn cancel(&self) {
        debug!(task = %self.label, "cancel requested");
        self.handle.abort();
    }
}

/// Spawn `fut` onto the runtime, non-blocking. Errors raised by the task
/// are captured and surfaced to the `join` caller, never panicked through.
pub fn fork<F>(label: impl Into<String>, fut: F) -> TaskHandle
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let label = label.into();
    debug!(task = %label, "fork");
    TaskHandle {
        handle: tokio::spawn(fut),
        label,
    }
}

/// A task that finished in a non-success terminal state.
#[derive(Debug)]
pub struct TaskFailure {
    pub task: String,
    pub error: LifecycleError,
}

/// Await every handle in the set. Does not short-circuit on the first
/// error: all handles reach a terminal state before this returns. Panics
/// inside tasks are converted into failures; cancelled tasks are counted
/// as terminal but not as failures (we asked for the cancellation).
pub async fn join(handles: Vec<TaskHandle>) -> Vec<TaskFailure> {
    let mut failures = Vec::new();
    for th in handles {
        match th.handle.await {
            Ok(Ok(())) => debug!(task = %th.label, "task done"),
            Ok(Err(error)) => {
                warn!(task = %th.label, %error, "task failed");
                failures.push(TaskFailure {
                    task: th.label,
                    error,
                });
            }
            Err(join_err) if join_err.is_cancelled() => {
                debug!(task = %th.label, "task cancelled");
            }
            Err(join_err) => {
                warn!(task = %th.label, "task panicked: {join_err}");
                failures.push(TaskFailure {
                    task: th.label,
                    error: LifecycleError::TransientInfra(format!(
                        "task panicked: {join_err}"
                    )),
                });
            }
        }
    }
    failures
}

/// An ordered batch of concurrently forked tasks with an explicit join
/// barrier. Groups are sequenced by the drivers to express dependency
/// order between teardown/creation steps.
pub struct TaskGroup {
    name: &'static str,
    handles: Vec<TaskHandle>,
}

impl TaskGroup {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handles: Vec::new(),
        }
    }

    pub fn fork<F>(&mut self, label: impl Into<String>, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.handles.push(fork(label, fut));
    }

    pub fn push(&mut self, handle: TaskHandle) {
        self.handles.push(handle);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Join barrier: waits for every forked task in the group, regardless
    /// of individual task outcome.
    pub async fn join(self) -> Vec<TaskFailure> {
        let failures = join(self.handles).await;
        debug!(group = self.name, failed = failures.len(), "task group finished");
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn join_waits_for_every_task() {
        let completed = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new("test");
        let mut rng = rand::thread_rng();
        for i in 0..16 {
            let completed = completed.clone();
            let delay = Duration::from_millis(rng.gen_range(0..40));
            group.fork(format!("task-{i}"), async move {
                tokio::time::sleep(delay).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let failures = group.join().await;
        // every side effect is visible before join returns
        assert_eq!(completed.load(Ordering::SeqCst), 16);
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn join_does_not_short_circuit_on_error() {
        let completed = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new("test");
        group.fork("fails-fast", async {
            Err(LifecycleError::TransientInfra("boom".into()))
        });
        for i in 0..4 {
            let completed = completed.clone();
            group.fork(format!("slow-{i}"), async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let failures = group.join().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task, "fails-fast");
        assert_eq!(completed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn panic_is_captured_as_failure() {
        let mut group = TaskGroup::new("test");
        group.fork("panics", async {
            panic!("programming error");
        });
        group.fork("fine", async { Ok(()) });
        let failures = group.join().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task, "panics");
    }

    #[tokio::test]
    async fn cancel_is_terminal_but_not_a_failure() {
        let completed = Arc::new(AtomicUsize::new(0));
        let c = completed.clone();
        let handle = fork("cancelled", async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        handle.cancel();
        let failures = join(vec![handle]).await;
        assert!(failures.is_empty());
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }
}

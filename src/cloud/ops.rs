//! Idempotent convergence loops over single cloud resources.
//!
//! Both loops keep trying until a definite success criterion is met, with
//! centralized handling of provider API errors (default action: log, but
//! ignore). The paradigm is to retry all API errors, including seemingly
//! non-retryable ones such as dependency errors and validation errors,
//! until the desired state is confirmed. The loops may never terminate on their
//! own; the attempt deadline in the supervisor is the backstop.
//!
//! Operations never assume they run exactly once: the same key may be
//! reprocessed across retried attempts.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::CloudApiError;
use crate::errors::Result;

/// Wait time between convergence cycles. Callers rely on zero wait in
/// cycle 1 so that a state check is immediately followed by the first
/// mutation attempt.
#[must_use]
pub fn wait_time(cycle: u32) -> Duration {
    if cycle == 1 {
        Duration::ZERO
    } else {
        Duration::from_secs(10)
    }
}

/// Outcome of a teardown state probe.
pub enum DestroyProbe {
    /// Desired teardown state reached.
    Gone,
    /// Not yet; the string describes how (for logging).
    Pending(String),
}

/// Outcome of a creation state probe.
pub enum CreateProbe {
    Ready,
    Pending(String),
}

/// One cloud resource (or a small set of them) with ensure-absent
/// semantics. Implementations perform the actual provider calls through
/// [`super::CloudApi`] and are expected to surface raw `CloudApiError`s;
/// the loop below decides what to swallow.
#[async_trait]
pub trait CloudResource: Send + Sync {
    fn label(&self) -> String;
    async fn check_destroyed(&self) -> Result<DestroyProbe, CloudApiError>;
    async fn try_destroy(&self) -> Result<(), CloudApiError>;
}

/// One cloud resource with ensure-present semantics. `try_create` returns
/// `true` when creation was confirmed by the provider; the setup loop then
/// stops issuing create calls and waits for `check_created` to confirm.
#[async_trait]
pub trait ProvisionedResource: Send + Sync {
    fn label(&self) -> String;
    async fn check_created(&self) -> Result<CreateProbe, CloudApiError>;
    async fn try_create(&self) -> Result<bool, CloudApiError>;
}

/// Teardown loop: probe, exit on confirmed absence, otherwise wait and fire
/// another delete. "Not found" during delete is success by definition and
/// every other API error is logged and retried in the next cycle.
pub async fn teardown(res: &dyn CloudResource) -> Result<()> {
    let label = res.label();
    info!("{label} teardown: start");
    let mut cycle: u32 = 1;
    loop {
        debug!("{label} teardown: cycle {cycle}");
        match res.check_destroyed().await {
            Ok(DestroyProbe::Gone) => {
                info!("{label} teardown: reached desired state, done");
                return Ok(());
            }
            Ok(DestroyProbe::Pending(state)) => {
                debug!("{label} teardown: not yet done. state: {state}");
            }
            Err(e) => {
                info!("{label} teardown: check: cloud api error: {e}");
            }
        }

        let wait = wait_time(cycle);
        if !wait.is_zero() {
            debug!("{label} teardown: sleep {} s", wait.as_secs());
            tokio::time::sleep(wait).await;
        }

        if let Err(e) = res.try_destroy().await {
            if e.is_not_found() {
                debug!("{label} teardown: already absent");
            } else {
                info!("{label} teardown: ignore cloud api error: {e}");
            }
        }

        cycle += 1;
    }
}

/// Setup loop, mirroring [`teardown`]: probe, exit on confirmed presence,
/// otherwise wait and (at most once, until reset by a fresh loop) fire the
/// create call. Conflict/already-exists responses to the create call count
/// as a triggered creation; `check_created` will confirm eventually.
pub async fn setup(res: &dyn ProvisionedResource) -> Result<()> {
    let label = res.label();
    info!("{label} setup: start");
    let mut creation_triggered = false;
    let mut cycle: u32 = 1;
    loop {
        debug!("{label} setup: cycle {cycle}");
        match res.check_created().await {
            Ok(CreateProbe::Ready) => {
                info!("{label} setup: reached desired state, done");
                return Ok(());
            }
            Ok(CreateProbe::Pending(state)) => {
                debug!("{label} setup: not yet ready. state: {state}");
            }
            Err(e) => {
                info!("{label} setup: check: cloud api error: {e}");
            }
        }

        let wait = wait_time(cycle);
        if !wait.is_zero() {
            info!("{label} setup: desired state not reached, sleep {} s", wait.as_secs());
            tokio::time::sleep(wait).await;
        }

        if !creation_triggered {
            match res.try_create().await {
                Ok(confirmed) => creation_triggered = confirmed,
                Err(e) if e.is_already_exists() => {
                    debug!("{label} setup: already exists, treat as triggered");
                    creation_triggered = true;
                }
                Err(e) => {
                    info!("{label} setup: assume that creation failed: {e}");
                }
            }
        }

        cycle += 1;
    }
}

/// One-shot variant for detach/revoke-style calls where absence of the
/// target is the goal: maps a not-found error onto success, surfaces
/// everything else.
pub fn absent_ok(label: &str, outcome: Result<(), CloudApiError>) -> Result<(), CloudApiError> {
    match outcome {
        Err(e) if e.is_not_found() => {
            debug!("{label}: already absent");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ApiErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Resource that reports `Gone` once the scripted number of delete
    /// calls has been made.
    struct ScriptedResource {
        gone_after_deletes: u32,
        deletes: AtomicU32,
        checks: AtomicU32,
        delete_error: Mutex<Option<CloudApiError>>,
    }

    impl ScriptedResource {
        fn new(gone_after_deletes: u32) -> Self {
            Self {
                gone_after_deletes,
                deletes: AtomicU32::new(0),
                checks: AtomicU32::new(0),
                delete_error: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl CloudResource for ScriptedResource {
        fn label(&self) -> String {
            "scripted".into()
        }

        async fn check_destroyed(&self) -> Result<DestroyProbe, CloudApiError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.deletes.load(Ordering::SeqCst) >= self.gone_after_deletes {
                Ok(DestroyProbe::Gone)
            } else {
                Ok(DestroyProbe::Pending("still present".into()))
            }
        }

        async fn try_destroy(&self) -> Result<(), CloudApiError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            match self.delete_error.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn teardown_of_absent_resource_is_a_noop() {
        let res = ScriptedResource::new(0);
        teardown(&res).await.unwrap();
        assert_eq!(res.checks.load(Ordering::SeqCst), 1);
        assert_eq!(res.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn teardown_twice_in_a_row_succeeds_both_times() {
        let res = ScriptedResource::new(1);
        teardown(&res).await.unwrap();
        assert_eq!(res.deletes.load(Ordering::SeqCst), 1);
        // second invocation with the resource already gone: success, no
        // further delete call
        teardown(&res).await.unwrap();
        assert_eq!(res.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_retries_api_errors_until_gone() {
        let res = ScriptedResource::new(2);
        *res.delete_error.lock().unwrap() = Some(CloudApiError::new(
            ApiErrorKind::DependencyViolation,
            "has dependencies",
        ));
        teardown(&res).await.unwrap();
        assert_eq!(res.deletes.load(Ordering::SeqCst), 2);
        assert!(res.checks.load(Ordering::SeqCst) >= 3);
    }

    struct ScriptedProvisioned {
        ready_after_creates: u32,
        creates: AtomicU32,
        create_error: Mutex<Option<CloudApiError>>,
    }

    #[async_trait]
    impl ProvisionedResource for ScriptedProvisioned {
        fn label(&self) -> String {
            "scripted".into()
        }

        async fn check_created(&self) -> Result<CreateProbe, CloudApiError> {
            if self.creates.load(Ordering::SeqCst) >= self.ready_after_creates {
                Ok(CreateProbe::Ready)
            } else {
                Ok(CreateProbe::Pending("not yet created".into()))
            }
        }

        async fn try_create(&self) -> Result<bool, CloudApiError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            match self.create_error.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(true),
            }
        }
    }

    #[tokio::test]
    async fn setup_of_present_resource_is_a_noop() {
        let res = ScriptedProvisioned {
            ready_after_creates: 0,
            creates: AtomicU32::new(0),
            create_error: Mutex::new(None),
        };
        setup(&res).await.unwrap();
        assert_eq!(res.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn setup_treats_conflict_as_triggered_creation() {
        let res = ScriptedProvisioned {
            ready_after_creates: 1,
            creates: AtomicU32::new(0),
            create_error: Mutex::new(Some(CloudApiError::new(
                ApiErrorKind::AlreadyExists,
                "duplicate",
            ))),
        };
        setup(&res).await.unwrap();
        // the conflicting create counts as triggered: exactly one call
        assert_eq!(res.creates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn absent_ok_maps_not_found_to_success() {
        let nf: Result<(), CloudApiError> = Err(CloudApiError::new(
            ApiErrorKind::NotFound,
            "no such entity",
        ));
        assert!(absent_ok("role detach", nf).is_ok());

        let dep: Result<(), CloudApiError> = Err(CloudApiError::new(
            ApiErrorKind::DependencyViolation,
            "in use",
        ));
        assert!(absent_ok("role detach", dep).is_err());
    }
}

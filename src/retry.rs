//! Retry-with-timeout supervision around one full driver attempt.
//!
//! Cloud infrastructure deletion and creation is frequently eventually
//! consistent: a resource reported "still in use" on attempt N often
//! succeeds on attempt N+1 once an async detachment completes elsewhere.
//! Retrying the whole attempt (not the failing step) side-steps modelling
//! every cross-resource dependency precisely, and is safe because every
//! operation below is idempotent.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::errors::{LifecycleError, Result};

/// Race `attempt` against a deadline. When the deadline wins, the attempt
/// future is dropped (its continuation never runs) and the attempt is
/// reported as failed without inspecting partial progress.
pub async fn run_attempt<F>(label: &str, timeout: Duration, attempt: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    debug!(attempt = label, "starting attempt, deadline {} s", timeout.as_secs());
    match tokio::time::timeout(timeout, attempt).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(
                "{label}: attempt timed out after {} seconds",
                timeout.as_secs()
            );
            Err(LifecycleError::AttemptTimeout(timeout))
        }
    }
}

pub struct RetrySettings {
    pub action_name: &'static str,
    pub max_attempts: u32,
    pub delay: Duration,
}

/// Pragmatic retry loop. On success, return. On a fatal error kind, re-raise
/// immediately without consuming a retry. On any other error, log (timeouts
/// without detail, they already logged a warning), wait `delay`, retry; up
/// to `max_attempts`, then raise a terminal exhaustion error carrying the
/// count.
///
/// We could restrict this to an allow-list of retryable errors, which would
/// optimize for revealing programming errors. Retrying upon all non-fatal
/// errors is towards best effort and robustness instead, so everything gets
/// logged with full detail by default.
pub async fn retry_upon_any_error<M, F>(
    settings: &RetrySettings,
    mut make_attempt: M,
) -> Result<()>
where
    M: FnMut() -> F,
    F: Future<Output = Result<()>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if attempt > 1 {
            if attempt > settings.max_attempts {
                return Err(LifecycleError::fatal(
                    1,
                    format!(
                        "{} attempt(s) failed. Stop retrying. Exit.",
                        attempt - 1
                    ),
                ));
            }
            info!(
                "start attempt {attempt} in {} s",
                settings.delay.as_secs()
            );
            tokio::time::sleep(settings.delay).await;
        }
        match make_attempt().await {
            Ok(()) => {
                debug!(
                    "`{}` succeeded (attempt {attempt})",
                    settings.action_name
                );
                return Ok(());
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                if err.log_without_detail() {
                    info!(
                        "{} failed (attempt {attempt}): {err}",
                        settings.action_name
                    );
                } else {
                    error!(
                        "error during {} (attempt {attempt}): {err:?}",
                        settings.action_name
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn settings(max_attempts: u32) -> RetrySettings {
        RetrySettings {
            action_name: "test action",
            max_attempts,
            delay: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_at_deadline() {
        let continued = Arc::new(AtomicU32::new(0));
        let c = continued.clone();
        let started = tokio::time::Instant::now();
        let res = run_attempt("never resolves", Duration::from_secs(30), async move {
            futures::future::pending::<()>().await;
            // continuation must not run after the deadline fired
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(LifecycleError::AttemptTimeout(_))));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(continued.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_needs_no_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        retry_upon_any_error(&settings(3), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_bound_is_honored() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let res = retry_upon_any_error(&settings(3), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(LifecycleError::TransientInfra("always failing".into()))
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match res {
            Err(LifecycleError::FatalExit { code, message }) => {
                assert_eq!(code, 1);
                assert!(message.contains("3 attempt(s) failed"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fatal_error_is_raised_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let res = retry_upon_any_error(&settings(3), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(LifecycleError::fatal(3, "operator-requested exit"))
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(res, Err(LifecycleError::FatalExit { code: 3, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_retryable_at_the_attempt_level() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let res = retry_upon_any_error(&settings(2), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                run_attempt("stuck", Duration::from_secs(10), async {
                    futures::future::pending::<()>().await;
                    Ok(())
                })
                .await
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(res, Err(LifecycleError::FatalExit { .. })));
    }
}

//! Lifecycle orchestration for cloud-hosted Kubernetes clusters.
//!
//! This crate drives the two operations that bracket a cluster's life:
//!
//! - **Destroy**: trigger the in-cluster teardown, wait for it to release
//!   externally-bound resources, then walk the provider resource graph
//!   until everything the installer created is gone.
//! - **Upgrade**: migrate the stored controller configuration and roll the
//!   in-cluster controller to the image matching this tooling version.
//!
//! Both operations are built from the same parts: a fork/join task
//! scheduler ([`sched`]), idempotent convergence loops over provider
//! resources ([`cloud::ops`]), an informer-fed cache of cluster state
//! ([`cluster`]), a readiness poller ([`readiness`]) and a
//! retry-with-deadline supervisor ([`retry`]) around each full attempt.

pub mod cloud;
pub mod cluster;
pub mod config;
pub mod controller_config;
pub mod destroy;
pub mod errors;
pub mod readiness;
pub mod retry;
pub mod sched;
pub mod upgrade;

pub use config::{CloudProvider, LifecycleConfig};
pub use errors::{LifecycleError, Result};

//! Cloud-provider and DNS-service collaborator seams.
//!
//! The orchestrator treats provider SDK calls as named black-box operations
//! returning success, "already in target state," or an error with a kind.
//! The traits here are the whole interface; policy (convergence loops,
//! not-found tolerance) lives in [`ops`], naming conventions and the
//! teardown dependency graph in [`aws`] / the destroy driver.

pub mod aws;
pub mod cli;
pub mod gcp;
pub mod ops;

use async_trait::async_trait;
use kube::Client;
use thiserror::Error;

/// Coarse classification of provider API failures. This is deliberately
/// small: the retry paradigm treats almost everything as retryable within
/// a deadline, so only the kinds that change policy get their own variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Target object does not exist. During delete this is success.
    NotFound,
    /// Target object already exists. During create this is success when
    /// idempotency is safe.
    AlreadyExists,
    /// Delete refused because another resource still references this one.
    /// Expected to self-resolve as sibling teardown tasks make progress.
    DependencyViolation,
    /// Rate limited.
    Throttled,
    Other,
}

#[derive(Error, Debug, Clone)]
#[error("{message} ({kind:?})")]
pub struct CloudApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl CloudApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Other, message)
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == ApiErrorKind::NotFound
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        self.kind == ApiErrorKind::AlreadyExists
    }
}

/// Named idempotent operations over one cloud account, keyed by cluster
/// name or by the derived resource names from [`aws::AwsNames`]. Probes
/// (`*_exists`) and mutations are separate so the operations layer can
/// implement check-then-act convergence loops.
///
/// Collection-shaped operations (`delete_subnets`, `delete_route_tables`,
/// ...) cover every resource tagged with the cluster name; their probes
/// report whether any such resource remains.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudApi: Send + Sync {
    // Managed Kubernetes control plane
    async fn cluster_exists(&self, cluster: &str) -> Result<bool, CloudApiError>;
    async fn delete_cluster(&self, cluster: &str) -> Result<(), CloudApiError>;
    /// Fetch credentials for the cluster's Kubernetes API and build a
    /// client. `None` means the control plane is already gone.
    async fn cluster_client(&self, cluster: &str) -> Result<Option<Client>, CloudApiError>;

    // Container registry
    async fn image_exists(&self, image: &str) -> Result<bool, CloudApiError>;

    // Compute
    async fn autoscaling_group_exists(&self, name: &str) -> Result<bool, CloudApiError>;
    async fn delete_autoscaling_group(&self, name: &str) -> Result<(), CloudApiError>;
    async fn launch_configuration_exists(&self, name: &str) -> Result<bool, CloudApiError>;
    async fn delete_launch_configuration(&self, name: &str) -> Result<(), CloudApiError>;

    // IAM
    async fn remove_role_from_instance_profile(
        &self,
        profile: &str,
        role: &str,
    ) -> Result<(), CloudApiError>;
    async fn instance_profile_exists(&self, name: &str) -> Result<bool, CloudApiError>;
    async fn delete_instance_profile(&self, name: &str) -> Result<(), CloudApiError>;
    async fn find_policy_arn(&self, name: &str) -> Result<Option<String>, CloudApiError>;
    async fn detach_policy(&self, role: &str, policy_arn: &str) -> Result<(), CloudApiError>;
    async fn delete_policy(&self, name: &str) -> Result<(), CloudApiError>;
    async fn role_exists(&self, name: &str) -> Result<bool, CloudApiError>;
    async fn delete_role(&self, name: &str) -> Result<(), CloudApiError>;
    /// GCP-only: service accounts bound to the cluster.
    async fn delete_service_account(&self, name: &str) -> Result<(), CloudApiError>;

    // Network
    async fn route_tables_exist(&self, cluster: &str) -> Result<bool, CloudApiError>;
    async fn delete_route_tables(&self, cluster: &str) -> Result<(), CloudApiError>;
    async fn vpc_endpoints_exist(&self, cluster: &str) -> Result<bool, CloudApiError>;
    async fn delete_vpc_endpoints(&self, cluster: &str) -> Result<(), CloudApiError>;
    async fn subnets_exist(&self, cluster: &str) -> Result<bool, CloudApiError>;
    async fn delete_subnets(&self, cluster: &str) -> Result<(), CloudApiError>;
    async fn nat_gateways_exist(&self, cluster: &str) -> Result<bool, CloudApiError>;
    async fn delete_nat_gateways(&self, cluster: &str) -> Result<(), CloudApiError>;
    async fn release_addresses(&self, cluster: &str) -> Result<(), CloudApiError>;
    async fn internet_gateway_exists(&self, cluster: &str) -> Result<bool, CloudApiError>;
    async fn delete_internet_gateway(&self, cluster: &str) -> Result<(), CloudApiError>;
    async fn revoke_security_group_rules(&self, group: &str) -> Result<(), CloudApiError>;
    async fn security_group_exists(&self, group: &str) -> Result<bool, CloudApiError>;
    async fn delete_security_group(&self, group: &str) -> Result<(), CloudApiError>;
    async fn vpc_exists(&self, cluster: &str) -> Result<bool, CloudApiError>;
    async fn delete_vpc(&self, cluster: &str) -> Result<(), CloudApiError>;

    // Provider-managed DNS zones (Route 53 / Cloud DNS)
    async fn purge_dns_zones(&self, dns_name: &str) -> Result<(), CloudApiError>;

    // Object storage. Bucket wiping is asynchronous on the provider side;
    // this only schedules it (lifecycle rule with immediate expiry).
    async fn schedule_bucket_wipe(&self, bucket: &str) -> Result<(), CloudApiError>;
}

/// Hosted DNS service keeping NS delegation records for cluster DNS names
/// under the service-managed zone. Opaque idempotent calls; not part of
/// this core.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DnsService: Send + Sync {
    /// Probe whether an NS record set exists for the cluster's DNS name in
    /// the service-managed zone. A SERVFAIL-style answer from seemingly
    /// authoritative name servers still counts as "exists" (the delegation
    /// record is there, the user-side zone is already gone).
    async fn ns_record_exists(&self, cluster: &str) -> Result<bool, CloudApiError>;
    async fn delete(&self, cluster: &str) -> Result<(), CloudApiError>;
    /// Create the NS delegation when absent. Idempotent; used by the
    /// install path, carried here as part of the service interface.
    async fn ensure(&self, cluster: &str) -> Result<(), CloudApiError>;
}

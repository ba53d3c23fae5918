//! Lifecycle configuration: provider tag, cluster name, provider regions.
//!
//! Constructed exactly once at the entry point and passed by reference into
//! the drivers and the supervisor. There is deliberately no process-global
//! state here.

use std::fmt;

use clap::ValueEnum;

use crate::errors::{LifecycleError, Result};

/// DNS zone managed by the hosted DNS service; cluster DNS names hang off
/// this root (`<cluster>.capstan.io.`).
pub const SERVICE_DNS_ROOT: &str = "capstan.io.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CloudProvider {
    Aws,
    Gcp,
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudProvider::Aws => write!(f, "aws"),
            CloudProvider::Gcp => write!(f, "gcp"),
        }
    }
}

/// Immutable per-invocation configuration, shared by the destroy and
/// upgrade drivers.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub provider: CloudProvider,
    pub cluster_name: String,
    pub aws_region: Option<String>,
    pub gcp_project_id: Option<String>,
    pub gcp_region: Option<String>,
}

impl LifecycleConfig {
    /// Check provider-specific prerequisites before any mutating work.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(LifecycleError::Configuration(
                "cluster name must not be empty".into(),
            ));
        }
        match self.provider {
            CloudProvider::Aws => {
                if self.aws_region.is_none() {
                    return Err(LifecycleError::Configuration(
                        "aws provider requires a region".into(),
                    ));
                }
            }
            CloudProvider::Gcp => {
                if self.gcp_project_id.is_none() || self.gcp_region.is_none() {
                    return Err(LifecycleError::Configuration(
                        "gcp provider requires a project id and a region".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The cluster's DNS name in the service-managed zone, with trailing dot.
    #[must_use]
    pub fn service_dns_name(&self) -> String {
        format!("{}.{}", self.cluster_name, SERVICE_DNS_ROOT)
    }

    /// Data bucket naming convention: `<cluster>-<suffix>`.
    #[must_use]
    pub fn bucket_name(&self, suffix: &str) -> String {
        format!("{}-{}", self.cluster_name, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(provider: CloudProvider) -> LifecycleConfig {
        LifecycleConfig {
            provider,
            cluster_name: "testcluster".into(),
            aws_region: Some("us-west-2".into()),
            gcp_project_id: Some("proj".into()),
            gcp_region: Some("us-west2".into()),
        }
    }

    #[test]
    fn validate_requires_provider_fields() {
        let mut cfg = base(CloudProvider::Aws);
        cfg.aws_region = None;
        assert!(matches!(
            cfg.validate(),
            Err(LifecycleError::Configuration(_))
        ));

        let mut cfg = base(CloudProvider::Gcp);
        cfg.gcp_project_id = None;
        assert!(cfg.validate().is_err());

        assert!(base(CloudProvider::Aws).validate().is_ok());
        assert!(base(CloudProvider::Gcp).validate().is_ok());
    }

    #[test]
    fn naming_conventions() {
        let cfg = base(CloudProvider::Aws);
        assert_eq!(cfg.service_dns_name(), "testcluster.capstan.io.");
        assert_eq!(cfg.bucket_name("logs"), "testcluster-logs");
    }
}

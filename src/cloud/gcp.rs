//! GCP resource naming and teardown adapters.
//!
//! Unlike the AWS graph, GCP teardown is strictly sequential: the managed
//! cluster holds the subnetwork, the subnetwork holds the network, and the
//! provider enforces that chain, so there is nothing to gain from forking.

use std::sync::Arc;

use async_trait::async_trait;

use super::ops::{CloudResource, DestroyProbe};
use super::{CloudApi, CloudApiError};
use crate::errors::Result;

/// Derived names for the per-cluster GCP resources.
pub struct GcpNames {
    pub cluster: String,
}

impl GcpNames {
    #[must_use]
    pub fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_owned(),
        }
    }

    /// Service accounts the installer creates for in-cluster components.
    #[must_use]
    pub fn service_accounts(&self) -> Vec<String> {
        vec![
            format!("{}-cert-manager", self.cluster),
            format!("{}-external-dns", self.cluster),
            format!("{}-data", self.cluster),
        ]
    }
}

pub enum GcpTarget {
    Cluster,
    NatRouter,
    Subnet,
    Network,
}

pub struct GcpResource {
    pub target: GcpTarget,
    pub cluster: String,
    pub api: Arc<dyn CloudApi>,
}

impl GcpResource {
    #[must_use]
    pub fn new(target: GcpTarget, cluster: &str, api: Arc<dyn CloudApi>) -> Self {
        Self {
            target,
            cluster: cluster.to_owned(),
            api,
        }
    }
}

#[async_trait]
impl CloudResource for GcpResource {
    fn label(&self) -> String {
        match self.target {
            GcpTarget::Cluster => format!("GKE cluster {}", self.cluster),
            GcpTarget::NatRouter => format!("cloud NAT router of {}", self.cluster),
            GcpTarget::Subnet => format!("subnetwork {}", self.cluster),
            GcpTarget::Network => format!("VPC network {}", self.cluster),
        }
    }

    async fn check_destroyed(&self) -> Result<DestroyProbe, CloudApiError> {
        let exists = match self.target {
            GcpTarget::Cluster => self.api.cluster_exists(&self.cluster).await?,
            GcpTarget::NatRouter => self.api.nat_gateways_exist(&self.cluster).await?,
            GcpTarget::Subnet => self.api.subnets_exist(&self.cluster).await?,
            GcpTarget::Network => self.api.vpc_exists(&self.cluster).await?,
        };
        Ok(if exists {
            DestroyProbe::Pending("still present".into())
        } else {
            DestroyProbe::Gone
        })
    }

    async fn try_destroy(&self) -> Result<(), CloudApiError> {
        match self.target {
            GcpTarget::Cluster => self.api.delete_cluster(&self.cluster).await,
            GcpTarget::NatRouter => self.api.delete_nat_gateways(&self.cluster).await,
            GcpTarget::Subnet => self.api.delete_subnets(&self.cluster).await,
            GcpTarget::Network => self.api.delete_vpc(&self.cluster).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ops;
    use crate::cloud::MockCloudApi;

    #[test]
    fn service_account_names_follow_the_convention() {
        let names = GcpNames::new("tc");
        assert_eq!(
            names.service_accounts(),
            vec!["tc-cert-manager", "tc-external-dns", "tc-data"]
        );
    }

    #[tokio::test]
    async fn absent_network_needs_no_delete_call() {
        let mut api = MockCloudApi::new();
        api.expect_vpc_exists().returning(|_| Ok(false));
        api.expect_delete_vpc().times(0);
        let api: Arc<dyn CloudApi> = Arc::new(api);
        let res = GcpResource::new(GcpTarget::Network, "tc", api);
        ops::teardown(&res).await.unwrap();
    }
}

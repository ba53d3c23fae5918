//! AWS resource naming conventions and teardown adapters.
//!
//! Every AWS resource created for a cluster carries a deterministic name
//! derived from the cluster name ([`AwsNames`]), or a tag with the cluster
//! name for collection-shaped resources (subnets, route tables, ...). The
//! destroy driver composes [`AwsResource`] values over these names and runs
//! them through the convergence loops in [`super::ops`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::ops::{self, CloudResource, DestroyProbe};
use super::{CloudApi, CloudApiError};
use crate::errors::{LifecycleError, Result};
use crate::sched::TaskGroup;

/// AWS-managed policy ARNs attached to the EKS control plane role.
const CLUSTER_ROLE_MANAGED_POLICIES: &[&str] = &[
    "arn:aws:iam::aws:policy/AmazonEKSClusterPolicy",
    "arn:aws:iam::aws:policy/AmazonEKSServicePolicy",
];

/// AWS-managed policy ARNs attached to the worker node role.
const WORKER_ROLE_MANAGED_POLICIES: &[&str] = &[
    "arn:aws:iam::aws:policy/AmazonEKSWorkerNodePolicy",
    "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy",
    "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly",
    "arn:aws:iam::aws:policy/ElasticLoadBalancingFullAccess",
];

/// Derived names for the per-cluster AWS resources.
pub struct AwsNames {
    pub cluster: String,
}

impl AwsNames {
    #[must_use]
    pub fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_owned(),
        }
    }

    #[must_use]
    pub fn instance_profile(&self) -> String {
        format!("{}-instance-profile", self.cluster)
    }

    #[must_use]
    pub fn launch_configuration(&self) -> String {
        format!("{}-primary-launch-configuration", self.cluster)
    }

    #[must_use]
    pub fn worker_role(&self) -> String {
        format!("{}-eks-nodes", self.cluster)
    }

    #[must_use]
    pub fn cluster_role(&self) -> String {
        format!("{}-eks-controlplane", self.cluster)
    }

    #[must_use]
    pub fn cert_manager_role(&self) -> String {
        format!("{}-cert-manager", self.cluster)
    }

    #[must_use]
    pub fn master_security_group(&self) -> String {
        format!("{}-eks-master-security-group", self.cluster)
    }

    #[must_use]
    pub fn worker_security_group(&self) -> String {
        format!("{}-eks-worker-security-group", self.cluster)
    }

    #[must_use]
    pub fn service_linked_policy(&self) -> String {
        format!("{}-eks-linked-service", self.cluster)
    }

    #[must_use]
    pub fn external_dns_policy(&self) -> String {
        format!("{}-externaldns", self.cluster)
    }

    #[must_use]
    pub fn bucket_policy(&self, bucket: &str) -> String {
        format!("{bucket}-s3")
    }

    /// Access policies of the per-cluster data buckets, attached to the
    /// worker role.
    #[must_use]
    pub fn data_bucket_policies(&self) -> Vec<String> {
        DATA_BUCKET_SUFFIXES
            .iter()
            .map(|suffix| self.bucket_policy(&format!("{}-{suffix}", self.cluster)))
            .collect()
    }
}

/// Suffixes of the per-cluster data buckets.
pub const DATA_BUCKET_SUFFIXES: &[&str] = &["logs", "logs-config", "metrics", "metrics-config"];

/// One named AWS teardown target, adapting [`CloudApi`] calls to the
/// [`CloudResource`] convergence contract.
pub enum AwsTarget {
    ControlPlane,
    AutoscalingGroup,
    LaunchConfiguration,
    InstanceProfile,
    Role(String),
    SecurityGroup(String),
    RouteTables,
    VpcEndpoints,
    Subnets,
    NatGateways,
    InternetGateway,
    Vpc,
}

pub struct AwsResource {
    pub target: AwsTarget,
    pub cluster: String,
    pub api: Arc<dyn CloudApi>,
}

impl AwsResource {
    #[must_use]
    pub fn new(target: AwsTarget, cluster: &str, api: Arc<dyn CloudApi>) -> Self {
        Self {
            target,
            cluster: cluster.to_owned(),
            api,
        }
    }

    fn names(&self) -> AwsNames {
        AwsNames::new(&self.cluster)
    }

    fn probe(exists: bool) -> DestroyProbe {
        if exists {
            DestroyProbe::Pending("still present".into())
        } else {
            DestroyProbe::Gone
        }
    }
}

#[async_trait]
impl CloudResource for AwsResource {
    fn label(&self) -> String {
        match &self.target {
            AwsTarget::ControlPlane => format!("EKS cluster {}", self.cluster),
            AwsTarget::AutoscalingGroup => format!("autoscaling group {}", self.cluster),
            AwsTarget::LaunchConfiguration => {
                format!("launch configuration {}", self.names().launch_configuration())
            }
            AwsTarget::InstanceProfile => {
                format!("instance profile {}", self.names().instance_profile())
            }
            AwsTarget::Role(name) => format!("IAM role {name}"),
            AwsTarget::SecurityGroup(name) => format!("security group {name}"),
            AwsTarget::RouteTables => format!("route tables of {}", self.cluster),
            AwsTarget::VpcEndpoints => format!("VPC endpoints of {}", self.cluster),
            AwsTarget::Subnets => format!("subnets of {}", self.cluster),
            AwsTarget::NatGateways => format!("NAT gateways of {}", self.cluster),
            AwsTarget::InternetGateway => format!("internet gateway of {}", self.cluster),
            AwsTarget::Vpc => format!("VPC of {}", self.cluster),
        }
    }

    async fn check_destroyed(&self) -> Result<DestroyProbe, CloudApiError> {
        let api = &self.api;
        let names = self.names();
        let exists = match &self.target {
            AwsTarget::ControlPlane => api.cluster_exists(&self.cluster).await?,
            AwsTarget::AutoscalingGroup => api.autoscaling_group_exists(&self.cluster).await?,
            AwsTarget::LaunchConfiguration => {
                api.launch_configuration_exists(&names.launch_configuration())
                    .await?
            }
            AwsTarget::InstanceProfile => {
                api.instance_profile_exists(&names.instance_profile()).await?
            }
            AwsTarget::Role(name) => api.role_exists(name).await?,
            AwsTarget::SecurityGroup(name) => api.security_group_exists(name).await?,
            AwsTarget::RouteTables => api.route_tables_exist(&self.cluster).await?,
            AwsTarget::VpcEndpoints => api.vpc_endpoints_exist(&self.cluster).await?,
            AwsTarget::Subnets => api.subnets_exist(&self.cluster).await?,
            AwsTarget::NatGateways => api.nat_gateways_exist(&self.cluster).await?,
            AwsTarget::InternetGateway => api.internet_gateway_exists(&self.cluster).await?,
            AwsTarget::Vpc => api.vpc_exists(&self.cluster).await?,
        };
        Ok(Self::probe(exists))
    }

    async fn try_destroy(&self) -> Result<(), CloudApiError> {
        let api = &self.api;
        let names = self.names();
        match &self.target {
            AwsTarget::ControlPlane => api.delete_cluster(&self.cluster).await,
            AwsTarget::AutoscalingGroup => api.delete_autoscaling_group(&self.cluster).await,
            AwsTarget::LaunchConfiguration => {
                api.delete_launch_configuration(&names.launch_configuration())
                    .await
            }
            AwsTarget::InstanceProfile => {
                // the role must be removed from the profile before the
                // profile itself can go
                ops::absent_ok(
                    "remove role from instance profile",
                    api.remove_role_from_instance_profile(
                        &names.instance_profile(),
                        &names.worker_role(),
                    )
                    .await,
                )?;
                api.delete_instance_profile(&names.instance_profile()).await
            }
            AwsTarget::Role(name) => api.delete_role(name).await,
            AwsTarget::SecurityGroup(name) => {
                // cross-referencing rules between the master and worker
                // groups block group deletion until revoked
                ops::absent_ok(
                    "revoke security group rules",
                    api.revoke_security_group_rules(name).await,
                )?;
                api.delete_security_group(name).await
            }
            AwsTarget::RouteTables => api.delete_route_tables(&self.cluster).await,
            AwsTarget::VpcEndpoints => api.delete_vpc_endpoints(&self.cluster).await,
            AwsTarget::Subnets => api.delete_subnets(&self.cluster).await,
            AwsTarget::NatGateways => api.delete_nat_gateways(&self.cluster).await,
            AwsTarget::InternetGateway => api.delete_internet_gateway(&self.cluster).await,
            AwsTarget::Vpc => api.delete_vpc(&self.cluster).await,
        }
    }
}

/// Detach managed and cluster-specific policies from the cluster's IAM
/// roles, then delete the cluster-specific policies. Detachments run
/// concurrently; the policy deletions only start after every detach task
/// joined (a policy cannot go while still attached somewhere).
pub async fn detach_policies_from_roles(api: &Arc<dyn CloudApi>, names: &AwsNames) -> Result<()> {
    let mut detach = TaskGroup::new("detach policies");

    for arn in CLUSTER_ROLE_MANAGED_POLICIES {
        let api = api.clone();
        let role = names.cluster_role();
        detach.fork(format!("detach {arn} from {role}"), async move {
            ops::absent_ok("detach policy", api.detach_policy(&role, arn).await)
                .map_err(LifecycleError::from)
        });
    }
    for arn in WORKER_ROLE_MANAGED_POLICIES {
        let api = api.clone();
        let role = names.worker_role();
        detach.fork(format!("detach {arn} from {role}"), async move {
            ops::absent_ok("detach policy", api.detach_policy(&role, arn).await)
                .map_err(LifecycleError::from)
        });
    }

    // cluster-specific policies need an ARN lookup first; the external-dns
    // policy is attached to both the worker and the cert-manager role, the
    // data bucket policies to the worker role
    let mut lookups: Vec<(&str, String, Vec<String>)> = vec![
        (
            "service-linked policy",
            names.service_linked_policy(),
            vec![names.cluster_role()],
        ),
        (
            "external-dns policy",
            names.external_dns_policy(),
            vec![names.worker_role(), names.cert_manager_role()],
        ),
    ];
    for policy in names.data_bucket_policies() {
        lookups.push(("data bucket policy", policy, vec![names.worker_role()]));
    }
    for (what, policy, roles) in &lookups {
        match api.find_policy_arn(policy).await? {
            Some(arn) => {
                for role in roles {
                    let api = api.clone();
                    let arn = arn.clone();
                    let role = role.clone();
                    detach.fork(format!("detach {policy} from {role}"), async move {
                        ops::absent_ok("detach policy", api.detach_policy(&role, &arn).await)
                            .map_err(LifecycleError::from)
                    });
                }
            }
            None => info!("{what} {policy}: not found, nothing to detach"),
        }
    }

    let failures = detach.join().await;
    if !failures.is_empty() {
        return Err(LifecycleError::TransientInfra(format!(
            "{} policy detachment(s) failed",
            failures.len()
        )));
    }

    let mut delete = TaskGroup::new("delete policies");
    let mut targets = vec![names.service_linked_policy(), names.external_dns_policy()];
    targets.extend(names.data_bucket_policies());
    for policy in targets {
        let api = api.clone();
        delete.fork(format!("delete policy {policy}"), async move {
            ops::absent_ok("delete policy", api.delete_policy(&policy).await)
                .map_err(LifecycleError::from)
        });
    }
    let failures = delete.join().await;
    if failures.is_empty() {
        Ok(())
    } else {
        Err(LifecycleError::TransientInfra(format!(
            "{} policy deletion(s) failed",
            failures.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{ApiErrorKind, MockCloudApi};

    #[test]
    fn derived_names_follow_the_convention() {
        let names = AwsNames::new("tc");
        assert_eq!(names.instance_profile(), "tc-instance-profile");
        assert_eq!(names.launch_configuration(), "tc-primary-launch-configuration");
        assert_eq!(names.worker_role(), "tc-eks-nodes");
        assert_eq!(names.cluster_role(), "tc-eks-controlplane");
        assert_eq!(names.master_security_group(), "tc-eks-master-security-group");
        assert_eq!(names.external_dns_policy(), "tc-externaldns");
        assert_eq!(names.bucket_policy("tc-logs"), "tc-logs-s3");
    }

    #[tokio::test]
    async fn absent_role_needs_no_delete_call() {
        let mut api = MockCloudApi::new();
        api.expect_role_exists().returning(|_| Ok(false));
        api.expect_delete_role().times(0);
        let api: Arc<dyn CloudApi> = Arc::new(api);
        let res = AwsResource::new(AwsTarget::Role("tc-eks-nodes".into()), "tc", api);
        ops::teardown(&res).await.unwrap();
    }

    #[tokio::test]
    async fn instance_profile_delete_tolerates_detached_role() {
        let mut api = MockCloudApi::new();
        let mut present = true;
        api.expect_instance_profile_exists()
            .returning(move |_| {
                let was = present;
                present = false;
                Ok(was)
            });
        api.expect_remove_role_from_instance_profile()
            .returning(|_, _| {
                Err(CloudApiError::new(
                    ApiErrorKind::NotFound,
                    "role not in profile",
                ))
            });
        api.expect_delete_instance_profile().returning(|_| Ok(()));
        let api: Arc<dyn CloudApi> = Arc::new(api);
        let res = AwsResource::new(AwsTarget::InstanceProfile, "tc", api);
        ops::teardown(&res).await.unwrap();
    }

    #[tokio::test]
    async fn policy_detach_skips_missing_custom_policies() {
        let mut api = MockCloudApi::new();
        // six managed-policy detachments, two roles
        api.expect_detach_policy().times(6).returning(|_, _| Ok(()));
        // two cluster policies plus four data bucket policies
        api.expect_find_policy_arn().times(6).returning(|_| Ok(None));
        api.expect_delete_policy().times(6).returning(|_| {
            Err(CloudApiError::new(ApiErrorKind::NotFound, "no such policy"))
        });
        let api: Arc<dyn CloudApi> = Arc::new(api);
        detach_policies_from_roles(&api, &AwsNames::new("tc"))
            .await
            .unwrap();
    }

    /// The data bucket policies hang off the worker role; leaving them
    /// attached makes AWS refuse both the policy and the role deletion,
    /// so the detach routine has to cover them.
    #[tokio::test]
    async fn bucket_policies_are_detached_from_the_worker_role() {
        let mut api = MockCloudApi::new();
        api.expect_find_policy_arn().times(6).returning(|name| {
            if name.ends_with("-s3") {
                Ok(Some(format!("arn:aws:iam::123456789012:policy/{name}")))
            } else {
                Ok(None)
            }
        });
        // six managed-policy detachments
        api.expect_detach_policy()
            .withf(|_, arn| !arn.ends_with("-s3"))
            .times(6)
            .returning(|_, _| Ok(()));
        // one detachment per bucket policy, all from the worker role
        api.expect_detach_policy()
            .withf(|role, arn| role == "tc-eks-nodes" && arn.ends_with("-s3"))
            .times(4)
            .returning(|_, _| Ok(()));
        api.expect_delete_policy().times(6).returning(|name| {
            if name.ends_with("-s3") {
                Ok(())
            } else {
                Err(CloudApiError::new(ApiErrorKind::NotFound, "no such policy"))
            }
        });
        let api: Arc<dyn CloudApi> = Arc::new(api);
        detach_policies_from_roles(&api, &AwsNames::new("tc"))
            .await
            .unwrap();
    }

    #[test]
    fn data_bucket_policy_names_cover_every_bucket() {
        let names = AwsNames::new("tc");
        assert_eq!(
            names.data_bucket_policies(),
            vec![
                "tc-logs-s3",
                "tc-logs-config-s3",
                "tc-metrics-s3",
                "tc-metrics-config-s3"
            ]
        );
    }
}

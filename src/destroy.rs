//! Cluster destroy driver.
//!
//! Three phases per attempt: trigger the in-cluster teardown and wait for
//! it to release externally-bound resources (load balancers, volumes),
//! remove the cluster's DNS delegation, then walk the provider resource
//! graph. The whole attempt is retried as a unit under a deadline; every
//! step tolerates re-execution and partial prior progress.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tracing::{info, warn};

use crate::cloud::aws::{AwsNames, AwsResource, AwsTarget, DATA_BUCKET_SUFFIXES};
use crate::cloud::gcp::{GcpNames, GcpResource, GcpTarget};
use crate::cloud::ops::{self, teardown, CloudResource};
use crate::cloud::{aws, CloudApi, DnsService};
use crate::cluster::api::reachability_check;
use crate::cluster::cache::WatchedKind;
use crate::cluster::informers::Informers;
use crate::config::{CloudProvider, LifecycleConfig};
use crate::controller_config::{self, CONTROLLER_NAME, CONTROLLER_NAMESPACE};
use crate::errors::{LifecycleError, Result};
use crate::readiness::{self, PollSettings};
use crate::retry::{retry_upon_any_error, run_attempt, RetrySettings};
use crate::sched::{self, TaskFailure, TaskGroup};

pub const DESTROY_ATTEMPTS: u32 = 5;
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Destroy the named cluster: in-cluster teardown, DNS, provider infra.
pub async fn destroy_cluster(
    config: &LifecycleConfig,
    api: Arc<dyn CloudApi>,
    dns: Arc<dyn DnsService>,
) -> Result<()> {
    config.validate()?;
    info!(
        "destroying cluster {} ({} provider)",
        config.cluster_name, config.provider
    );
    let settings = RetrySettings {
        action_name: "destroy",
        max_attempts: DESTROY_ATTEMPTS,
        delay: RETRY_DELAY,
    };
    retry_upon_any_error(&settings, || {
        let api = api.clone();
        let dns = dns.clone();
        let config = config.clone();
        async move {
            run_attempt(
                "destroy",
                ATTEMPT_TIMEOUT,
                destroy_attempt(&config, api, dns),
            )
            .await
        }
    })
    .await?;
    info!(
        "cluster {}: destroyed. Data bucket deletion continues asynchronously on the provider side.",
        config.cluster_name
    );
    Ok(())
}

async fn destroy_attempt(
    config: &LifecycleConfig,
    api: Arc<dyn CloudApi>,
    dns: Arc<dyn DnsService>,
) -> Result<()> {
    // Phase 1: in-cluster teardown, if the control plane still answers.
    match api.cluster_client(&config.cluster_name).await? {
        Some(client) => match trigger_cluster_teardown(&client).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("in-cluster teardown skipped, cluster might already be gone: {e}");
            }
        },
        None => info!("control plane already gone, skipping in-cluster teardown"),
    }

    // Phase 2: the cluster's DNS delegation at the hosted DNS service.
    if dns.ns_record_exists(&config.cluster_name).await? {
        ops::absent_ok("NS record delete", dns.delete(&config.cluster_name).await)?;
        info!("NS record for {} removed", config.cluster_name);
    } else {
        info!("no NS record for {}, nothing to remove", config.cluster_name);
    }

    // Phase 3: provider infrastructure.
    match config.provider {
        CloudProvider::Aws => destroy_aws_infra(config, &api).await,
        CloudProvider::Gcp => destroy_gcp_infra(config, &api).await,
    }
}

/// Flip the terminate flag in the controller config and wait until the
/// in-cluster controller released everything it manages. Convergence is
/// observed through the resource cache; by default the disappearance of
/// the last persistent volume is the exit criterion.
async fn trigger_cluster_teardown(client: &Client) -> Result<()> {
    reachability_check(client).await?;

    match controller_config::fetch(client).await? {
        Some(doc) => {
            let mut cfg = controller_config::upgrade_to_latest(&doc)?;
            if cfg.terminate {
                info!("controller config already carries the terminate flag");
            } else {
                cfg.terminate = true;
                controller_config::store(client, &cfg).await?;
                info!("terminate flag set, controller starts the in-cluster teardown");
            }
        }
        None => {
            warn!("no controller config found, skipping the terminate flag");
            return Ok(());
        }
    }

    let kinds = [WatchedKind::Deployment, WatchedKind::PersistentVolume];
    let (informers, mut reader) = Informers::start(client, &kinds);
    reader.hydrated(&kinds).await?;
    let controller_key = format!("{CONTROLLER_NAMESPACE}/{CONTROLLER_NAME}");
    if reader
        .snapshot()
        .get(WatchedKind::Deployment, &controller_key)
        .is_some()
    {
        info!("controller deployment present, waiting for the teardown to converge");
    } else {
        warn!("controller deployment not found, teardown may not make progress");
    }
    let outcome = readiness::wait_until_settled(&mut reader, &PollSettings::destroy_default()).await;
    informers.shutdown().await;
    outcome
}

fn collect(failures: &mut Vec<TaskFailure>, batch: Vec<TaskFailure>) {
    failures.extend(batch);
}

/// Walk the AWS teardown graph. Independent resources are destroyed
/// concurrently; join barriers sequence the provider-enforced dependency
/// edges (instance profile before roles, everything before the VPC). The
/// EKS control plane deletion takes the longest and runs alongside all of
/// it.
async fn destroy_aws_infra(config: &LifecycleConfig, api: &Arc<dyn CloudApi>) -> Result<()> {
    let cluster = config.cluster_name.clone();
    let names = AwsNames::new(&cluster);
    let mut failures: Vec<TaskFailure> = Vec::new();

    let eks = sched::fork("EKS control plane teardown", {
        let api = api.clone();
        let cluster = cluster.clone();
        async move {
            teardown(&AwsResource::new(AwsTarget::ControlPlane, &cluster, api)).await
        }
    });

    // group 1: node compute chain. The autoscaling group holds the launch
    // configuration, the launch configuration the instance profile.
    let mut compute = TaskGroup::new("node compute");
    compute.fork("node compute teardown", {
        let api = api.clone();
        let cluster = cluster.clone();
        async move {
            teardown(&AwsResource::new(AwsTarget::AutoscalingGroup, &cluster, api.clone())).await?;
            teardown(&AwsResource::new(
                AwsTarget::LaunchConfiguration,
                &cluster,
                api.clone(),
            ))
            .await?;
            teardown(&AwsResource::new(AwsTarget::InstanceProfile, &cluster, api)).await
        }
    });
    collect(&mut failures, compute.join().await);

    // group 2: IAM. Policies must be detached before roles can go.
    if let Err(e) = aws::detach_policies_from_roles(api, &names).await {
        failures.push(TaskFailure {
            task: "policy detachment".into(),
            error: e,
        });
    }
    let mut iam = TaskGroup::new("iam roles");
    for role in [
        names.worker_role(),
        names.cluster_role(),
        names.cert_manager_role(),
    ] {
        let api = api.clone();
        let cluster = cluster.clone();
        iam.fork(format!("IAM role {role} teardown"), async move {
            teardown(&AwsResource::new(AwsTarget::Role(role), &cluster, api)).await
        });
    }
    collect(&mut failures, iam.join().await);

    // group 3: VPC interior.
    let mut interior = TaskGroup::new("vpc interior");
    for target in [AwsTarget::RouteTables, AwsTarget::VpcEndpoints] {
        let api = api.clone();
        let cluster = cluster.clone();
        let res = AwsResource::new(target, &cluster, api);
        interior.fork(res.label(), async move { teardown(&res).await });
    }
    collect(&mut failures, interior.join().await);

    // group 4: DNS zones and object storage.
    let mut data = TaskGroup::new("dns and storage");
    data.fork("route53 zone purge", {
        let api = api.clone();
        let dns_name = config.service_dns_name();
        async move {
            ops::absent_ok("zone purge", api.purge_dns_zones(&dns_name).await)
                .map_err(LifecycleError::from)
        }
    });
    for suffix in DATA_BUCKET_SUFFIXES {
        let bucket = config.bucket_name(suffix);
        let api = api.clone();
        data.fork(format!("bucket {bucket} wipe"), async move {
            ops::absent_ok("bucket wipe", api.schedule_bucket_wipe(&bucket).await)
                .map_err(LifecycleError::from)
        });
    }
    collect(&mut failures, data.join().await);

    // group 5: VPC edge, joined together with the EKS deletion. Subnets
    // and security groups only release once the control plane's network
    // interfaces are gone, which the convergence loops simply out-wait.
    let mut edge = TaskGroup::new("vpc edge");
    edge.push(eks);
    for target in [
        AwsTarget::Subnets,
        AwsTarget::NatGateways,
        AwsTarget::InternetGateway,
        AwsTarget::SecurityGroup(names.master_security_group()),
        AwsTarget::SecurityGroup(names.worker_security_group()),
    ] {
        let api = api.clone();
        let cluster = cluster.clone();
        let res = AwsResource::new(target, &cluster, api);
        edge.fork(res.label(), async move { teardown(&res).await });
    }
    edge.fork("elastic IP release", {
        let api = api.clone();
        let cluster = cluster.clone();
        async move {
            ops::absent_ok("address release", api.release_addresses(&cluster).await)
                .map_err(LifecycleError::from)
        }
    });
    collect(&mut failures, edge.join().await);

    if !failures.is_empty() {
        for f in &failures {
            warn!(task = %f.task, error = %f.error, "teardown task failed");
        }
        return Err(LifecycleError::TransientInfra(format!(
            "{} teardown task(s) failed",
            failures.len()
        )));
    }

    // the VPC itself goes last, after every interior resource
    teardown(&AwsResource::new(AwsTarget::Vpc, &cluster, api.clone())).await
}

/// GCP teardown, sequential along the provider-enforced dependency chain.
async fn destroy_gcp_infra(config: &LifecycleConfig, api: &Arc<dyn CloudApi>) -> Result<()> {
    let cluster = &config.cluster_name;
    let names = GcpNames::new(cluster);

    for account in names.service_accounts() {
        ops::absent_ok(
            "service account delete",
            api.delete_service_account(&account).await,
        )?;
    }

    for target in [
        GcpTarget::Cluster,
        GcpTarget::NatRouter,
        GcpTarget::Subnet,
        GcpTarget::Network,
    ] {
        teardown(&GcpResource::new(target, cluster, api.clone())).await?;
    }

    ops::absent_ok(
        "zone purge",
        api.purge_dns_zones(&config.service_dns_name()).await,
    )?;

    for suffix in DATA_BUCKET_SUFFIXES {
        let bucket = config.bucket_name(suffix);
        ops::absent_ok("bucket wipe", api.schedule_bucket_wipe(&bucket).await)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{ApiErrorKind, CloudApiError, MockCloudApi, MockDnsService};
    use crate::config::CloudProvider;

    fn aws_config() -> LifecycleConfig {
        LifecycleConfig {
            provider: CloudProvider::Aws,
            cluster_name: "tc".into(),
            aws_region: Some("us-west-2".into()),
            gcp_project_id: None,
            gcp_region: None,
        }
    }

    /// Every probe reports the resource gone already: the driver converges
    /// without a single delete call and without sleeping.
    #[tokio::test(start_paused = true)]
    async fn aws_destroy_of_an_absent_cluster_converges_immediately() {
        let mut api = MockCloudApi::new();
        api.expect_cluster_client().returning(|_| Ok(None));
        api.expect_cluster_exists().returning(|_| Ok(false));
        api.expect_autoscaling_group_exists().returning(|_| Ok(false));
        api.expect_launch_configuration_exists().returning(|_| Ok(false));
        api.expect_instance_profile_exists().returning(|_| Ok(false));
        api.expect_role_exists().returning(|_| Ok(false));
        api.expect_detach_policy().times(6).returning(|_, _| Ok(()));
        api.expect_find_policy_arn().returning(|_| Ok(None));
        api.expect_delete_policy().returning(|name| {
            Err(CloudApiError::new(
                ApiErrorKind::NotFound,
                format!("policy {name} not found"),
            ))
        });
        api.expect_route_tables_exist().returning(|_| Ok(false));
        api.expect_vpc_endpoints_exist().returning(|_| Ok(false));
        api.expect_purge_dns_zones().times(1).returning(|_| Ok(()));
        api.expect_schedule_bucket_wipe().times(4).returning(|_| Ok(()));
        api.expect_subnets_exist().returning(|_| Ok(false));
        api.expect_nat_gateways_exist().returning(|_| Ok(false));
        api.expect_release_addresses().returning(|_| Ok(()));
        api.expect_internet_gateway_exists().returning(|_| Ok(false));
        api.expect_security_group_exists().returning(|_| Ok(false));
        api.expect_vpc_exists().returning(|_| Ok(false));

        let mut dns = MockDnsService::new();
        dns.expect_ns_record_exists().returning(|_| Ok(false));
        dns.expect_delete().times(0);

        let api: Arc<dyn CloudApi> = Arc::new(api);
        let dns: Arc<dyn DnsService> = Arc::new(dns);
        destroy_cluster(&aws_config(), api, dns).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dns_delegation_is_removed_when_present() {
        let mut api = MockCloudApi::new();
        api.expect_cluster_client().returning(|_| Ok(None));
        api.expect_cluster_exists().returning(|_| Ok(false));
        api.expect_autoscaling_group_exists().returning(|_| Ok(false));
        api.expect_launch_configuration_exists().returning(|_| Ok(false));
        api.expect_instance_profile_exists().returning(|_| Ok(false));
        api.expect_role_exists().returning(|_| Ok(false));
        api.expect_detach_policy().returning(|_, _| Ok(()));
        api.expect_find_policy_arn().returning(|_| Ok(None));
        api.expect_delete_policy().returning(|_| Ok(()));
        api.expect_route_tables_exist().returning(|_| Ok(false));
        api.expect_vpc_endpoints_exist().returning(|_| Ok(false));
        api.expect_purge_dns_zones().returning(|_| Ok(()));
        api.expect_schedule_bucket_wipe().returning(|_| Ok(()));
        api.expect_subnets_exist().returning(|_| Ok(false));
        api.expect_nat_gateways_exist().returning(|_| Ok(false));
        api.expect_release_addresses().returning(|_| Ok(()));
        api.expect_internet_gateway_exists().returning(|_| Ok(false));
        api.expect_security_group_exists().returning(|_| Ok(false));
        api.expect_vpc_exists().returning(|_| Ok(false));

        let mut dns = MockDnsService::new();
        dns.expect_ns_record_exists().returning(|_| Ok(true));
        dns.expect_delete().times(1).returning(|_| Ok(()));

        let api: Arc<dyn CloudApi> = Arc::new(api);
        let dns: Arc<dyn DnsService> = Arc::new(dns);
        destroy_cluster(&aws_config(), api, dns).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn gcp_destroy_runs_the_sequential_chain() {
        let mut api = MockCloudApi::new();
        api.expect_cluster_client().returning(|_| Ok(None));
        api.expect_delete_service_account().times(3).returning(|_| {
            Err(CloudApiError::new(
                ApiErrorKind::NotFound,
                "no such service account",
            ))
        });
        api.expect_cluster_exists().returning(|_| Ok(false));
        api.expect_nat_gateways_exist().returning(|_| Ok(false));
        api.expect_subnets_exist().returning(|_| Ok(false));
        api.expect_vpc_exists().returning(|_| Ok(false));
        api.expect_purge_dns_zones().times(1).returning(|_| Ok(()));
        api.expect_schedule_bucket_wipe().times(4).returning(|_| Ok(()));

        let mut dns = MockDnsService::new();
        dns.expect_ns_record_exists().returning(|_| Ok(false));

        let config = LifecycleConfig {
            provider: CloudProvider::Gcp,
            cluster_name: "tc".into(),
            aws_region: None,
            gcp_project_id: Some("proj".into()),
            gcp_region: Some("us-west2".into()),
        };
        let api: Arc<dyn CloudApi> = Arc::new(api);
        let dns: Arc<dyn DnsService> = Arc::new(dns);
        destroy_cluster(&config, api, dns).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_configuration_fails_before_any_provider_call() {
        let api: Arc<dyn CloudApi> = Arc::new(MockCloudApi::new());
        let dns: Arc<dyn DnsService> = Arc::new(MockDnsService::new());
        let mut config = aws_config();
        config.aws_region = None;
        let res = destroy_cluster(&config, api, dns).await;
        assert!(matches!(res, Err(LifecycleError::Configuration(_))));
    }
}

//! Concrete [`CloudApi`] / [`DnsService`] implementations.
//!
//! Provider calls shell out to the official `aws` and `gcloud` CLIs with
//! JSON output, so the orchestrator needs no long-lived provider
//! credentials of its own: whatever identity the operator's CLI session
//! carries is used. Stderr of failed invocations is classified into
//! [`ApiErrorKind`] by substring matching on the provider error codes.
//!
//! Resources without a deterministic per-cluster name are discovered via
//! the `capstan_cluster_name` tag that the installer stamps on everything
//! it creates.

use std::path::PathBuf;
use std::process::Stdio;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ApiErrorKind, CloudApi, CloudApiError, DnsService};
use crate::config::CloudProvider;

pub const CLUSTER_TAG: &str = "capstan_cluster_name";

/// Map a provider CLI's stderr onto an [`ApiErrorKind`]. Both CLIs embed
/// stable error codes in their messages; everything unrecognized is
/// `Other` and thus retried by the convergence loops.
#[must_use]
pub fn classify_stderr(stderr: &str) -> ApiErrorKind {
    const NOT_FOUND: &[&str] = &[
        "NotFound",
        "NoSuchEntity",
        "ResourceNotFoundException",
        "does not exist",
        "was not found",
    ];
    const ALREADY_EXISTS: &[&str] = &[
        "AlreadyExists",
        "EntityAlreadyExists",
        "Conflict",
        "Duplicate",
        "alreadyExists",
    ];
    const DEPENDENCY: &[&str] = &[
        "DependencyViolation",
        "DeleteConflict",
        "ResourceInUseException",
        "resourceInUse",
    ];
    const THROTTLED: &[&str] = &[
        "Throttling",
        "RequestLimitExceeded",
        "rateLimitExceeded",
        "TooManyRequestsException",
    ];

    // dependency codes go first: "DeleteConflict" also contains "Conflict"
    let matched = |needles: &[&str]| needles.iter().any(|n| stderr.contains(n));
    if matched(NOT_FOUND) {
        ApiErrorKind::NotFound
    } else if matched(DEPENDENCY) {
        ApiErrorKind::DependencyViolation
    } else if matched(ALREADY_EXISTS) {
        ApiErrorKind::AlreadyExists
    } else if matched(THROTTLED) {
        ApiErrorKind::Throttled
    } else {
        ApiErrorKind::Other
    }
}

pub struct CliCloud {
    provider: CloudProvider,
    region: Option<String>,
    project: Option<String>,
    http: reqwest::Client,
}

impl CliCloud {
    #[must_use]
    pub fn new(
        provider: CloudProvider,
        region: Option<String>,
        project: Option<String>,
    ) -> Self {
        Self {
            provider,
            region,
            project,
            http: reqwest::Client::new(),
        }
    }

    /// Run one CLI invocation and hand back its stdout. Non-zero exit
    /// becomes a classified [`CloudApiError`].
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, CloudApiError> {
        debug!("exec: {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CloudApiError::other(format!("failed to spawn {program}: {e}")))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            Err(CloudApiError::new(
                classify_stderr(&stderr),
                format!("{program} {}: {}", args.first().unwrap_or(&""), stderr.trim()),
            ))
        }
    }

    async fn aws(&self, args: &[&str]) -> Result<String, CloudApiError> {
        let region = self.region.clone().unwrap_or_default();
        let mut full = vec!["--output", "json", "--region", region.as_str()];
        full.extend_from_slice(args);
        self.run("aws", &full).await
    }

    async fn aws_json(&self, args: &[&str]) -> Result<Value, CloudApiError> {
        let out = self.aws(args).await?;
        if out.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&out)
            .map_err(|e| CloudApiError::other(format!("unparseable aws output: {e}")))
    }

    async fn gcloud(&self, args: &[&str]) -> Result<String, CloudApiError> {
        let project = self.project.clone().unwrap_or_default();
        let mut full = vec!["--format", "json", "--project", project.as_str()];
        full.extend_from_slice(args);
        self.run("gcloud", &full).await
    }

    async fn gcloud_json(&self, args: &[&str]) -> Result<Value, CloudApiError> {
        let out = self.gcloud(args).await?;
        if out.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&out)
            .map_err(|e| CloudApiError::other(format!("unparseable gcloud output: {e}")))
    }

    fn gcp_region(&self) -> String {
        self.region.clone().unwrap_or_default()
    }

    fn tag_filter(cluster: &str) -> String {
        format!("Name=tag:{CLUSTER_TAG},Values={cluster}")
    }

    /// Query EC2 for ids of tagged resources of one kind, e.g.
    /// (`describe-subnets`, `Subnets[].SubnetId`).
    async fn ec2_ids(
        &self,
        describe: &str,
        query: &str,
        cluster: &str,
    ) -> Result<Vec<String>, CloudApiError> {
        let filter = Self::tag_filter(cluster);
        let v = self
            .aws_json(&["ec2", describe, "--filters", &filter, "--query", query])
            .await?;
        Ok(v.as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|x| x.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Probe returning false instead of erroring on a not-found answer.
    fn exists_from(outcome: Result<String, CloudApiError>) -> Result<bool, CloudApiError> {
        match outcome {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn kubeconfig_path(cluster: &str) -> PathBuf {
        std::env::temp_dir().join(format!("capstan-{cluster}-kubeconfig"))
    }
}

#[async_trait::async_trait]
impl CloudApi for CliCloud {
    async fn cluster_exists(&self, cluster: &str) -> Result<bool, CloudApiError> {
        match self.provider {
            CloudProvider::Aws => Self::exists_from(
                self.aws(&["eks", "describe-cluster", "--name", cluster]).await,
            ),
            CloudProvider::Gcp => {
                let region = self.gcp_region();
                Self::exists_from(
                    self.gcloud(&[
                        "container",
                        "clusters",
                        "describe",
                        cluster,
                        "--region",
                        &region,
                    ])
                    .await,
                )
            }
        }
    }

    async fn delete_cluster(&self, cluster: &str) -> Result<(), CloudApiError> {
        match self.provider {
            CloudProvider::Aws => {
                self.aws(&["eks", "delete-cluster", "--name", cluster]).await?;
            }
            CloudProvider::Gcp => {
                let region = self.gcp_region();
                self.gcloud(&[
                    "container", "clusters", "delete", cluster, "--region", &region, "--quiet",
                ])
                .await?;
            }
        }
        Ok(())
    }

    async fn cluster_client(&self, cluster: &str) -> Result<Option<Client>, CloudApiError> {
        let path = Self::kubeconfig_path(cluster);
        let path_str = path.to_string_lossy().into_owned();
        let fetched = match self.provider {
            CloudProvider::Aws => {
                self.aws(&[
                    "eks",
                    "update-kubeconfig",
                    "--name",
                    cluster,
                    "--kubeconfig",
                    &path_str,
                ])
                .await
            }
            CloudProvider::Gcp => {
                let region = self.gcp_region();
                debug!("exec: gcloud container clusters get-credentials {cluster}");
                let output = Command::new("gcloud")
                    .args([
                        "container",
                        "clusters",
                        "get-credentials",
                        cluster,
                        "--region",
                        &region,
                        "--project",
                        &self.project.clone().unwrap_or_default(),
                    ])
                    .env("KUBECONFIG", &path)
                    .stdin(Stdio::null())
                    .output()
                    .await
                    .map_err(|e| CloudApiError::other(format!("failed to spawn gcloud: {e}")))?;
                if output.status.success() {
                    Ok(String::new())
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                    Err(CloudApiError::new(classify_stderr(&stderr), stderr))
                }
            }
        };
        match fetched {
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
            Ok(_) => {}
        }

        let kubeconfig = Kubeconfig::read_from(&path)
            .map_err(|e| CloudApiError::other(format!("kubeconfig at {path_str}: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| CloudApiError::other(format!("kubeconfig: {e}")))?;
        let client = Client::try_from(config)
            .map_err(|e| CloudApiError::other(format!("kubernetes client: {e}")))?;
        Ok(Some(client))
    }

    async fn image_exists(&self, image: &str) -> Result<bool, CloudApiError> {
        // split "repo/name:tag" and probe the public registry tag endpoint
        let (repo, tag) = image
            .rsplit_once(':')
            .ok_or_else(|| CloudApiError::other(format!("image reference without tag: {image}")))?;
        let url = format!("https://registry.hub.docker.com/v2/repositories/{repo}/tags/{tag}");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CloudApiError::other(format!("registry probe: {e}")))?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            s => Err(CloudApiError::other(format!(
                "registry probe for {image}: unexpected status {s}"
            ))),
        }
    }

    async fn autoscaling_group_exists(&self, name: &str) -> Result<bool, CloudApiError> {
        let v = self
            .aws_json(&[
                "autoscaling",
                "describe-auto-scaling-groups",
                "--auto-scaling-group-names",
                name,
                "--query",
                "AutoScalingGroups[].AutoScalingGroupName",
            ])
            .await?;
        Ok(v.as_array().is_some_and(|a| !a.is_empty()))
    }

    async fn delete_autoscaling_group(&self, name: &str) -> Result<(), CloudApiError> {
        self.aws(&[
            "autoscaling",
            "delete-auto-scaling-group",
            "--auto-scaling-group-name",
            name,
            "--force-delete",
        ])
        .await?;
        Ok(())
    }

    async fn launch_configuration_exists(&self, name: &str) -> Result<bool, CloudApiError> {
        let v = self
            .aws_json(&[
                "autoscaling",
                "describe-launch-configurations",
                "--launch-configuration-names",
                name,
                "--query",
                "LaunchConfigurations[].LaunchConfigurationName",
            ])
            .await?;
        Ok(v.as_array().is_some_and(|a| !a.is_empty()))
    }

    async fn delete_launch_configuration(&self, name: &str) -> Result<(), CloudApiError> {
        self.aws(&[
            "autoscaling",
            "delete-launch-configuration",
            "--launch-configuration-name",
            name,
        ])
        .await?;
        Ok(())
    }

    async fn remove_role_from_instance_profile(
        &self,
        profile: &str,
        role: &str,
    ) -> Result<(), CloudApiError> {
        self.aws(&[
            "iam",
            "remove-role-from-instance-profile",
            "--instance-profile-name",
            profile,
            "--role-name",
            role,
        ])
        .await?;
        Ok(())
    }

    async fn instance_profile_exists(&self, name: &str) -> Result<bool, CloudApiError> {
        Self::exists_from(
            self.aws(&["iam", "get-instance-profile", "--instance-profile-name", name])
                .await,
        )
    }

    async fn delete_instance_profile(&self, name: &str) -> Result<(), CloudApiError> {
        self.aws(&["iam", "delete-instance-profile", "--instance-profile-name", name])
            .await?;
        Ok(())
    }

    async fn find_policy_arn(&self, name: &str) -> Result<Option<String>, CloudApiError> {
        let query = format!("Policies[?PolicyName=='{name}'].Arn");
        let v = self
            .aws_json(&["iam", "list-policies", "--scope", "Local", "--query", &query])
            .await?;
        Ok(v.as_array()
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    async fn detach_policy(&self, role: &str, policy_arn: &str) -> Result<(), CloudApiError> {
        self.aws(&[
            "iam",
            "detach-role-policy",
            "--role-name",
            role,
            "--policy-arn",
            policy_arn,
        ])
        .await?;
        Ok(())
    }

    async fn delete_policy(&self, name: &str) -> Result<(), CloudApiError> {
        match self.find_policy_arn(name).await? {
            Some(arn) => {
                self.aws(&["iam", "delete-policy", "--policy-arn", &arn]).await?;
                Ok(())
            }
            None => Err(CloudApiError::new(
                ApiErrorKind::NotFound,
                format!("policy {name} not found"),
            )),
        }
    }

    async fn role_exists(&self, name: &str) -> Result<bool, CloudApiError> {
        Self::exists_from(self.aws(&["iam", "get-role", "--role-name", name]).await)
    }

    async fn delete_role(&self, name: &str) -> Result<(), CloudApiError> {
        self.aws(&["iam", "delete-role", "--role-name", name]).await?;
        Ok(())
    }

    async fn delete_service_account(&self, name: &str) -> Result<(), CloudApiError> {
        let project = self.project.clone().unwrap_or_default();
        let email = format!("{name}@{project}.iam.gserviceaccount.com");
        self.gcloud(&["iam", "service-accounts", "delete", &email, "--quiet"])
            .await?;
        Ok(())
    }

    async fn route_tables_exist(&self, cluster: &str) -> Result<bool, CloudApiError> {
        Ok(!self
            .ec2_ids("describe-route-tables", "RouteTables[].RouteTableId", cluster)
            .await?
            .is_empty())
    }

    async fn delete_route_tables(&self, cluster: &str) -> Result<(), CloudApiError> {
        for id in self
            .ec2_ids("describe-route-tables", "RouteTables[].RouteTableId", cluster)
            .await?
        {
            self.aws(&["ec2", "delete-route-table", "--route-table-id", &id])
                .await?;
        }
        Ok(())
    }

    async fn vpc_endpoints_exist(&self, cluster: &str) -> Result<bool, CloudApiError> {
        Ok(!self
            .ec2_ids("describe-vpc-endpoints", "VpcEndpoints[].VpcEndpointId", cluster)
            .await?
            .is_empty())
    }

    async fn delete_vpc_endpoints(&self, cluster: &str) -> Result<(), CloudApiError> {
        let ids = self
            .ec2_ids("describe-vpc-endpoints", "VpcEndpoints[].VpcEndpointId", cluster)
            .await?;
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = vec!["ec2", "delete-vpc-endpoints", "--vpc-endpoint-ids"];
        args.extend(ids.iter().map(String::as_str));
        self.aws(&args).await?;
        Ok(())
    }

    async fn subnets_exist(&self, cluster: &str) -> Result<bool, CloudApiError> {
        match self.provider {
            CloudProvider::Aws => Ok(!self
                .ec2_ids("describe-subnets", "Subnets[].SubnetId", cluster)
                .await?
                .is_empty()),
            CloudProvider::Gcp => {
                let region = self.gcp_region();
                Self::exists_from(
                    self.gcloud(&[
                        "compute", "networks", "subnets", "describe", cluster, "--region", &region,
                    ])
                    .await,
                )
            }
        }
    }

    async fn delete_subnets(&self, cluster: &str) -> Result<(), CloudApiError> {
        match self.provider {
            CloudProvider::Aws => {
                for id in self
                    .ec2_ids("describe-subnets", "Subnets[].SubnetId", cluster)
                    .await?
                {
                    self.aws(&["ec2", "delete-subnet", "--subnet-id", &id]).await?;
                }
            }
            CloudProvider::Gcp => {
                let region = self.gcp_region();
                self.gcloud(&[
                    "compute", "networks", "subnets", "delete", cluster, "--region", &region,
                    "--quiet",
                ])
                .await?;
            }
        }
        Ok(())
    }

    async fn nat_gateways_exist(&self, cluster: &str) -> Result<bool, CloudApiError> {
        match self.provider {
            CloudProvider::Aws => {
                let filter = Self::tag_filter(cluster);
                let v = self
                    .aws_json(&[
                        "ec2",
                        "describe-nat-gateways",
                        "--filter",
                        &filter,
                        "--query",
                        "NatGateways[?State!='deleted'].NatGatewayId",
                    ])
                    .await?;
                Ok(v.as_array().is_some_and(|a| !a.is_empty()))
            }
            CloudProvider::Gcp => {
                let region = self.gcp_region();
                let router = format!("{cluster}-router");
                Self::exists_from(
                    self.gcloud(&[
                        "compute", "routers", "describe", &router, "--region", &region,
                    ])
                    .await,
                )
            }
        }
    }

    async fn delete_nat_gateways(&self, cluster: &str) -> Result<(), CloudApiError> {
        match self.provider {
            CloudProvider::Aws => {
                let filter = Self::tag_filter(cluster);
                let v = self
                    .aws_json(&[
                        "ec2",
                        "describe-nat-gateways",
                        "--filter",
                        &filter,
                        "--query",
                        "NatGateways[?State!='deleted'].NatGatewayId",
                    ])
                    .await?;
                let ids: Vec<String> = v
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|x| x.as_str().map(str::to_owned))
                            .collect()
                    })
                    .unwrap_or_default();
                for id in ids {
                    self.aws(&["ec2", "delete-nat-gateway", "--nat-gateway-id", &id])
                        .await?;
                }
            }
            CloudProvider::Gcp => {
                let region = self.gcp_region();
                let router = format!("{cluster}-router");
                // deleting the router takes the NAT config with it
                self.gcloud(&[
                    "compute", "routers", "delete", &router, "--region", &region, "--quiet",
                ])
                .await?;
            }
        }
        Ok(())
    }

    async fn release_addresses(&self, cluster: &str) -> Result<(), CloudApiError> {
        let filter = Self::tag_filter(cluster);
        let v = self
            .aws_json(&[
                "ec2",
                "describe-addresses",
                "--filters",
                &filter,
                "--query",
                "Addresses[].AllocationId",
            ])
            .await?;
        let ids: Vec<String> = v
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|x| x.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        for id in ids {
            self.aws(&["ec2", "release-address", "--allocation-id", &id])
                .await?;
        }
        Ok(())
    }

    async fn internet_gateway_exists(&self, cluster: &str) -> Result<bool, CloudApiError> {
        Ok(!self
            .ec2_ids(
                "describe-internet-gateways",
                "InternetGateways[].InternetGatewayId",
                cluster,
            )
            .await?
            .is_empty())
    }

    async fn delete_internet_gateway(&self, cluster: &str) -> Result<(), CloudApiError> {
        let gw_ids = self
            .ec2_ids(
                "describe-internet-gateways",
                "InternetGateways[].InternetGatewayId",
                cluster,
            )
            .await?;
        let vpc_ids = self.ec2_ids("describe-vpcs", "Vpcs[].VpcId", cluster).await?;
        for id in gw_ids {
            // a gateway still attached to the VPC refuses deletion
            for vpc in &vpc_ids {
                let _ = self
                    .aws(&[
                        "ec2",
                        "detach-internet-gateway",
                        "--internet-gateway-id",
                        &id,
                        "--vpc-id",
                        vpc,
                    ])
                    .await;
            }
            self.aws(&["ec2", "delete-internet-gateway", "--internet-gateway-id", &id])
                .await?;
        }
        Ok(())
    }

    async fn revoke_security_group_rules(&self, group: &str) -> Result<(), CloudApiError> {
        let name_filter = format!("Name=group-name,Values={group}");
        let v = self
            .aws_json(&[
                "ec2",
                "describe-security-groups",
                "--filters",
                &name_filter,
                "--query",
                "SecurityGroups[].GroupId",
            ])
            .await?;
        let Some(id) = v.as_array().and_then(|a| a.first()).and_then(Value::as_str) else {
            return Err(CloudApiError::new(
                ApiErrorKind::NotFound,
                format!("security group {group} not found"),
            ));
        };
        let id = id.to_owned();
        let detail = self
            .aws_json(&[
                "ec2",
                "describe-security-groups",
                "--group-ids",
                &id,
                "--query",
                "SecurityGroups[0]",
            ])
            .await?;
        // revoke everything in both directions; rules referencing a peer
        // group would otherwise block that peer's deletion
        let directions = [
            ("revoke-security-group-ingress", "IpPermissions"),
            ("revoke-security-group-egress", "IpPermissionsEgress"),
        ];
        for (revoke, field) in directions {
            let perms = detail.get(field).cloned().unwrap_or(Value::Null);
            if !perms.as_array().is_some_and(|a| !a.is_empty()) {
                continue;
            }
            let perms_json = perms.to_string();
            let outcome = self
                .aws(&["ec2", revoke, "--group-id", &id, "--ip-permissions", &perms_json])
                .await;
            if let Err(e) = outcome {
                if !e.is_not_found() {
                    warn!("{revoke} on {group}: {e}");
                }
            }
        }
        Ok(())
    }

    async fn security_group_exists(&self, group: &str) -> Result<bool, CloudApiError> {
        let name_filter = format!("Name=group-name,Values={group}");
        let v = self
            .aws_json(&[
                "ec2",
                "describe-security-groups",
                "--filters",
                &name_filter,
                "--query",
                "SecurityGroups[].GroupId",
            ])
            .await?;
        Ok(v.as_array().is_some_and(|a| !a.is_empty()))
    }

    async fn delete_security_group(&self, group: &str) -> Result<(), CloudApiError> {
        self.aws(&["ec2", "delete-security-group", "--group-name", group])
            .await?;
        Ok(())
    }

    async fn vpc_exists(&self, cluster: &str) -> Result<bool, CloudApiError> {
        match self.provider {
            CloudProvider::Aws => Ok(!self
                .ec2_ids("describe-vpcs", "Vpcs[].VpcId", cluster)
                .await?
                .is_empty()),
            CloudProvider::Gcp => Self::exists_from(
                self.gcloud(&["compute", "networks", "describe", cluster]).await,
            ),
        }
    }

    async fn delete_vpc(&self, cluster: &str) -> Result<(), CloudApiError> {
        match self.provider {
            CloudProvider::Aws => {
                for id in self.ec2_ids("describe-vpcs", "Vpcs[].VpcId", cluster).await? {
                    self.aws(&["ec2", "delete-vpc", "--vpc-id", &id]).await?;
                }
            }
            CloudProvider::Gcp => {
                self.gcloud(&["compute", "networks", "delete", cluster, "--quiet"])
                    .await?;
            }
        }
        Ok(())
    }

    async fn purge_dns_zones(&self, dns_name: &str) -> Result<(), CloudApiError> {
        match self.provider {
            CloudProvider::Aws => {
                let query = format!("HostedZones[?Name=='{dns_name}'].Id");
                let v = self
                    .aws_json(&["route53", "list-hosted-zones", "--query", &query])
                    .await?;
                let ids: Vec<String> = v
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|x| x.as_str().map(str::to_owned))
                            .collect()
                    })
                    .unwrap_or_default();
                for id in ids {
                    self.aws(&["route53", "delete-hosted-zone", "--id", &id]).await?;
                }
            }
            CloudProvider::Gcp => {
                let zone = dns_name.trim_end_matches('.').replace('.', "-");
                self.gcloud(&["dns", "managed-zones", "delete", &zone]).await?;
            }
        }
        Ok(())
    }

    async fn schedule_bucket_wipe(&self, bucket: &str) -> Result<(), CloudApiError> {
        match self.provider {
            CloudProvider::Aws => {
                // expire every object immediately; S3 applies lifecycle
                // rules asynchronously, deletion continues after we exit
                let rule = serde_json::json!({
                    "Rules": [{
                        "ID": "capstan-wipe",
                        "Status": "Enabled",
                        "Filter": {},
                        "Expiration": { "Days": 1 },
                        "AbortIncompleteMultipartUpload": { "DaysAfterInitiation": 1 }
                    }]
                })
                .to_string();
                self.aws(&[
                    "s3api",
                    "put-bucket-lifecycle-configuration",
                    "--bucket",
                    bucket,
                    "--lifecycle-configuration",
                    &rule,
                ])
                .await?;
            }
            CloudProvider::Gcp => {
                let rule = serde_json::json!({
                    "rule": [{ "action": { "type": "Delete" }, "condition": { "age": 0 } }]
                })
                .to_string();
                let path = std::env::temp_dir().join(format!("capstan-{bucket}-lifecycle.json"));
                tokio::fs::write(&path, rule)
                    .await
                    .map_err(|e| CloudApiError::other(format!("write lifecycle file: {e}")))?;
                let url = format!("gs://{bucket}");
                let path_str = path.to_string_lossy().into_owned();
                self.run("gsutil", &["lifecycle", "set", &path_str, &url]).await?;
            }
        }
        Ok(())
    }
}

/// [`DnsService`] client over the hosted DNS service's HTTP API. The base
/// endpoint comes from the `CAPSTAN_DNS_API` environment variable.
pub struct HttpDnsService {
    endpoint: String,
    http: reqwest::Client,
}

pub const DNS_API_ENV: &str = "CAPSTAN_DNS_API";
const DEFAULT_DNS_API: &str = "https://dns-api.capstan.io/dns/cluster";

impl HttpDnsService {
    #[must_use]
    pub fn from_env() -> Self {
        let endpoint =
            std::env::var(DNS_API_ENV).unwrap_or_else(|_| DEFAULT_DNS_API.to_owned());
        Self {
            endpoint,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, cluster: &str) -> String {
        format!("{}/{cluster}", self.endpoint.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl DnsService for HttpDnsService {
    async fn ns_record_exists(&self, cluster: &str) -> Result<bool, CloudApiError> {
        let resp = self
            .http
            .get(self.url(cluster))
            .send()
            .await
            .map_err(|e| CloudApiError::other(format!("dns service probe: {e}")))?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            // a server-side resolution failure means the delegation record
            // is still there even though the user-side zone may be gone
            s if s.is_server_error() => Ok(true),
            s => Err(CloudApiError::other(format!(
                "dns service probe: unexpected status {s}"
            ))),
        }
    }

    async fn delete(&self, cluster: &str) -> Result<(), CloudApiError> {
        let resp = self
            .http
            .delete(self.url(cluster))
            .send()
            .await
            .map_err(|e| CloudApiError::other(format!("dns service delete: {e}")))?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::NOT_FOUND => Err(CloudApiError::new(
                ApiErrorKind::NotFound,
                format!("no NS record for {cluster}"),
            )),
            s => Err(CloudApiError::other(format!(
                "dns service delete: unexpected status {s}"
            ))),
        }
    }

    async fn ensure(&self, cluster: &str) -> Result<(), CloudApiError> {
        let resp = self
            .http
            .post(self.url(cluster))
            .send()
            .await
            .map_err(|e| CloudApiError::other(format!("dns service create: {e}")))?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::CONFLICT => Ok(()),
            s => Err(CloudApiError::other(format!(
                "dns service create: unexpected status {s}"
            ))),
        }
    }
}

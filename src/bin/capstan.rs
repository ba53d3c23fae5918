use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use capstan::cloud::cli::{CliCloud, HttpDnsService};
use capstan::cloud::{CloudApi, DnsService};
use capstan::{destroy, upgrade, CloudProvider, LifecycleConfig};

#[derive(Parser)]
#[command(name = "capstan", version, about = "Cluster lifecycle orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Tear down a cluster and every cloud resource created for it.
    Destroy(TargetArgs),
    /// Roll a cluster's controller to the image matching this tooling.
    Upgrade(TargetArgs),
}

#[derive(Args)]
struct TargetArgs {
    /// Name of the cluster to operate on.
    cluster_name: String,

    /// Cloud provider hosting the cluster.
    #[arg(long, value_enum)]
    provider: CloudProvider,

    /// Provider region of the cluster.
    #[arg(long, env = "CAPSTAN_REGION")]
    region: Option<String>,

    /// GCP project id (gcp provider only).
    #[arg(long, env = "CAPSTAN_PROJECT")]
    project: Option<String>,
}

impl TargetArgs {
    fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            provider: self.provider,
            cluster_name: self.cluster_name.clone(),
            aws_region: match self.provider {
                CloudProvider::Aws => self.region.clone(),
                CloudProvider::Gcp => None,
            },
            gcp_project_id: self.project.clone(),
            gcp_region: match self.provider {
                CloudProvider::Gcp => self.region.clone(),
                CloudProvider::Aws => None,
            },
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let (args, run_destroy) = match &cli.command {
        Command::Destroy(args) => (args, true),
        Command::Upgrade(args) => (args, false),
    };

    let config = args.lifecycle_config();
    let api: Arc<dyn CloudApi> = Arc::new(CliCloud::new(
        config.provider,
        args.region.clone(),
        args.project.clone(),
    ));

    let outcome = if run_destroy {
        let dns: Arc<dyn DnsService> = Arc::new(HttpDnsService::from_env());
        destroy::destroy_cluster(&config, api, dns).await
    } else {
        upgrade::upgrade_cluster(&config, api).await
    };

    if let Err(err) = outcome {
        error!("{err}");
        std::process::exit(err.exit_code());
    }
}

//! ---
//! ads_section: "05-demo-host"
//! ads_subsection: "binary"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Binary entrypoint for the R-ADS demo host."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use prometheus::{Registry, TextEncoder};
use r_ads_common::{init_tracing, SdkConfig};
use r_ads_core::model::CreateSnapshotTagValueSubscriptionRequest;
use r_ads_core::{AdapterHost, CallContext, FeatureCategory, Principal, SdkMetrics};
use r_ads_sim::SimulatedAdapter;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "configs/r-ads.toml";

#[derive(Debug, Parser)]
#[command(author, version, about = "R-ADS demo host", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "sim", help = "Identifier of the simulated adapter")]
    adapter_id: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Subscribe to tags and print every value as a JSON line")]
    Run {
        #[arg(long = "tag", value_name = "TAG", help = "Tag to subscribe (repeatable)")]
        tags: Vec<String>,

        #[arg(long, default_value = "console", help = "Connection id used for teardown")]
        connection: String,

        #[arg(long = "role", value_name = "ROLE", help = "Role granted to the caller")]
        roles: Vec<String>,

        #[arg(long, help = "Print the metrics exposition on exit")]
        print_metrics: bool,
    },
    #[command(about = "Print the adapter descriptor and its extension operations")]
    Describe,
}

fn load_config(explicit: Option<&PathBuf>) -> Result<(SdkConfig, Option<PathBuf>)> {
    let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let env_override = std::env::var(SdkConfig::ENV_CONFIG_PATH)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);
    if explicit.is_none() && !env_override && !default_path.exists() {
        return Ok((SdkConfig::default(), None));
    }
    let candidates: Vec<PathBuf> = explicit.into_iter().cloned().chain([default_path]).collect();
    let loaded = SdkConfig::load_with_source(&candidates)?;
    Ok((loaded.config, Some(loaded.source)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, source) = load_config(cli.config.as_ref())?;
    init_tracing("r-adsd", &config.logging)?;
    match &source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => warn!("no configuration file found; using defaults"),
    }

    let registry = Registry::new();
    let metrics = SdkMetrics::register(&registry).context("failed to register metrics")?;
    let host = AdapterHost::builder(&config).with_metrics(metrics).build();
    let adapter = SimulatedAdapter::builder(&cli.adapter_id)
        .config(config.simulation.clone())
        .build(&host);
    host.register(adapter)?;
    host.start_all().await?;

    let outcome = match cli.command.unwrap_or(Commands::Run {
        tags: Vec::new(),
        connection: "console".to_owned(),
        roles: Vec::new(),
        print_metrics: false,
    }) {
        Commands::Run {
            tags,
            connection,
            roles,
            print_metrics,
        } => {
            let tags = if tags.is_empty() {
                config.simulation.tags.clone()
            } else {
                tags
            };
            let principal = roles
                .into_iter()
                .fold(Principal::new(connection.clone()), |principal, role| {
                    principal.with_role(role)
                });
            let ctx = CallContext::for_principal(principal).with_connection(connection.clone());
            let result = run(&host, &ctx, &cli.adapter_id, tags).await;
            let released = host.disconnect(&connection).await;
            info!(connection = %connection, released, "connection released");
            if print_metrics {
                let exposition = TextEncoder::new()
                    .encode_to_string(&registry.gather())
                    .context("failed to encode metrics")?;
                print!("{}", exposition);
            }
            result
        }
        Commands::Describe => describe(&host, &cli.adapter_id).await,
    };

    host.shutdown().await;
    outcome
}

async fn run(host: &AdapterHost, ctx: &CallContext, adapter_id: &str, tags: Vec<String>) -> Result<()> {
    let request = CreateSnapshotTagValueSubscriptionRequest { tags };
    let mut subscription = host
        .subscribe_snapshot_tag_values(
            ctx,
            adapter_id,
            request,
            stream::pending().boxed(),
            CancellationToken::new(),
        )
        .await?;
    info!(subscription = %subscription.id(), "subscribed; waiting for values (ctrl-c to stop)");

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                info!("ctrl-c received; shutting down");
                break;
            }
            item = subscription.next() => match item {
                Some(Ok(value)) => println!("{}", serde_json::to_string(&value)?),
                Some(Err(err)) => {
                    warn!(error = %err, "subscription faulted");
                    break;
                }
                None => break,
            },
        }
    }
    Ok(())
}

async fn describe(host: &AdapterHost, adapter_id: &str) -> Result<()> {
    let ctx = CallContext::anonymous();
    let description = host.describe_adapter(&ctx, adapter_id)?;
    println!("{}", serde_json::to_string_pretty(&description)?);
    for feature in description
        .features
        .iter()
        .filter(|feature| feature.category == FeatureCategory::Extension)
    {
        let operations = host
            .get_extension_operations(&ctx, adapter_id, &feature.uri, CancellationToken::new())
            .await?;
        println!("{}", serde_json::to_string_pretty(&operations)?);
    }
    Ok(())
}

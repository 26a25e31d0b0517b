//! Bootstraps a node pool against a live cluster and prints where keys route.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use keyroute_client::{ClientConfig, NodePool};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Fmt,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "route-probe", about = "Show the vbucket and node each key routes to")]
struct Cli {
    /// Bootstrap URIs, e.g. `http://10.0.0.1:8091/pools`. Repeatable.
    #[arg(long = "bootstrap", env = "KEYROUTE_BOOTSTRAP", value_delimiter = ',')]
    bootstrap: Vec<String>,
    #[arg(long, env = "KEYROUTE_BUCKET", default_value = "default")]
    bucket: String,
    #[arg(long, env = "KEYROUTE_PASSWORD")]
    password: Option<String>,
    /// JSON client configuration. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "fmt")]
    log_format: LogFormat,
    /// Keys to route.
    #[arg(required = true)]
    keys: Vec<String>,
}

fn load_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text).context("failed to parse client configuration")?
        }
        None => ClientConfig::default(),
    };
    if !cli.bootstrap.is_empty() {
        config.bootstrap_uris.clone_from(&cli.bootstrap);
    }
    config.bucket.clone_from(&cli.bucket);
    if cli.password.is_some() {
        config.bucket_password.clone_from(&cli.password);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Fmt => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    let config = load_config(&cli)?;
    tracing::info!(bucket = %config.bucket, bootstrap = ?config.bootstrap_uris, "connecting");
    let pool = NodePool::connect(config)
        .await
        .context("failed to bootstrap the node pool")?;

    let snapshot = pool.snapshot();
    if let Some(cluster) = snapshot.config() {
        println!(
            "bucket {} rev {} nodes {} vbucket-aware {}",
            cluster.name,
            cluster.rev,
            snapshot.nodes().len(),
            snapshot.is_vbucket_aware()
        );
    }

    for key in &cli.keys {
        match snapshot.route(key) {
            Some(route) => {
                let master = route.master.as_ref().map_or("-", |n| n.endpoint());
                let replicas: Vec<&str> = route.replicas.iter().map(|n| n.endpoint()).collect();
                println!(
                    "{key}\tvbucket={}\tmaster={master}\treplicas={}",
                    route.vbucket.index(),
                    replicas.join(",")
                );
            }
            None => {
                let node = snapshot.locator().locate(key);
                println!("{key}\tnode={}", node.as_ref().map_or("-", |n| n.endpoint()));
            }
        }
    }

    pool.shutdown().await;
    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use spug_deploy::dispatch;
use spug_deploy::store::MemoryBackend;
use spug_deploy::types::{DeployRequest, FileTemplate, HostRecord, RegistryRecord};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "spug-deploy")]
#[command(about = "Run one deploy request against its target hosts")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct SpugDeployCli {
    /// Request descriptor JSON (request, hosts, registries, templates, configs)
    descriptor: PathBuf,

    /// Retry only the hosts that failed in the previous run
    #[arg(long)]
    fail_mode: bool,

    /// Root of the local source checkouts
    #[arg(long, default_value = "/data/spug/repos")]
    repos_dir: PathBuf,

    /// Root for packaged tarballs and staged template files
    #[arg(long, default_value = "/data/spug/build")]
    build_dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Everything one run needs, as exported by the management layer.
#[derive(Deserialize)]
struct Descriptor {
    request: DeployRequest,
    #[serde(default)]
    hosts: Vec<HostRecord>,
    #[serde(default)]
    registries: Vec<RegistryRecord>,
    #[serde(default)]
    templates: Vec<FileTemplate>,
    #[serde(default)]
    configs: Vec<ConfigSet>,
}

#[derive(Deserialize)]
struct ConfigSet {
    app_id: i64,
    env_id: i64,
    #[serde(default)]
    pairs: Vec<(String, String)>,
    /// `key = value` text body, the format the management console exports.
    #[serde(default)]
    text: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = SpugDeployCli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let raw = tokio::fs::read_to_string(&cli.descriptor)
        .await
        .with_context(|| format!("reading {}", cli.descriptor.display()))?;
    let descriptor: Descriptor =
        serde_json::from_str(&raw).context("parsing request descriptor")?;

    let backend = MemoryBackend::new();
    for host in descriptor.hosts {
        backend.hosts.insert(host);
    }
    for registry in descriptor.registries {
        backend.registries.insert(registry);
    }
    for template in descriptor.templates {
        backend.templates.insert(template);
    }
    for config in descriptor.configs {
        backend.configs.insert(config.app_id, config.env_id, config.pairs);
        if let Some(text) = &config.text {
            backend
                .configs
                .insert_text(config.app_id, config.env_id, text)
                .with_context(|| format!("parsing config text for app {}", config.app_id))?;
        }
    }

    let services = backend.ssh_services(&cli.repos_dir, &cli.build_dir);
    let mut request = descriptor.request;
    info!(request_id = request.id, "loaded deploy request");

    let outcome = dispatch::dispatch(&services, &mut request, cli.fail_mode).await;

    // Replay the log so the run is readable without the polling console.
    let stream_key = format!("request:{}", request.id);
    let read = services.log.read_from(&stream_key, 0);
    for event in &read.events {
        if let Some(data) = &event.data {
            print!("[{}] {}", event.key, data.replace('\r', ""));
        }
    }

    match outcome {
        Ok(()) => {
            println!("\ndeploy request {} succeeded", request.id);
            Ok(())
        }
        Err(e) => {
            println!(
                "\ndeploy request {} failed, outstanding hosts: {:?}",
                request.id, request.fail_host_ids
            );
            Err(e.into())
        }
    }
}

//! CAPV - Cluster API infrastructure controller for vSphere machines

use std::sync::Arc;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use capv::config::Config;
use capv::context::ControllerContext;
use capv::controller;
use capv::crd::{VSphereCluster, VSphereMachine};
use capv::provider::Simulator;
use capv::session::SessionCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize tracing
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if config.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    if config.crd {
        for crd in [VSphereMachine::crd(), VSphereCluster::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    run_controller(config).await
}

/// Run the VSphereMachine controller until a shutdown signal arrives
async fn run_controller(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        controller = %config.controller_name,
        namespace = %config.controller_namespace,
        ?config,
        "Starting CAPV controller"
    );

    if !config.simulator {
        anyhow::bail!("no vSphere binding is built in; run with --simulator");
    }
    let sessions = Arc::new(SessionCache::new(Arc::new(Simulator::new())));

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let ctx = Arc::new(
        ControllerContext::builder(client.clone(), sessions.clone())
            .credentials(config.credentials())
            .settings(config.settings())
            .build(),
    );

    controller::run(ctx, client, config.watch_namespace.clone()).await?;

    sessions.shutdown().await;
    tracing::info!("CAPV controller shutting down");
    Ok(())
}

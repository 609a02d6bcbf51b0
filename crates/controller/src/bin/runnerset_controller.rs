//! Controller entry point.
//!
//! Watches `AutoscalingRunnerSet` resources in one namespace and keeps
//! their owned children and remote scale-set registrations converged.

use runnerset_controller::run_scale_set_controller;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,runnerset_controller=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting runner set controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let namespace = std::env::var("WATCH_NAMESPACE").unwrap_or_else(|_| "runners".to_string());

    run_scale_set_controller(client, namespace).await?;
    info!("Controller stopped");

    Ok(())
}

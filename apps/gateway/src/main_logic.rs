use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::serve;
use tokio::net::TcpListener;
use tracing::{error, info};

use courier_providers::DefaultProviderFactory;
use courier_queue::DeliveryQueue;

use crate::backend::BackendClient;
use crate::config::GatewayConfig;
use crate::forwarder::Forwarder;
use crate::http::{build_router, AppState};
use crate::router::SendRouter;
use crate::janitor;
use crate::session::{Supervisor, SupervisorDeps};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Wires the components together and serves until interrupted. On
/// shutdown the sessions are torn down and the delivery queue is flushed;
/// overrunning the deadline exits the process with code 1.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let http_client = reqwest::Client::builder()
        .build()
        .context("build http client")?;

    let queue = DeliveryQueue::load(&config.queue_file).await;
    let forwarder = Forwarder::new(
        http_client.clone(),
        config.webhook_url.clone(),
        config.webhook_timeout,
        queue.clone(),
    );

    let factory = DefaultProviderFactory::new(
        config.providers.clone(),
        http_client.clone(),
        config.cloud_api_base.clone(),
        config.bridge_base.clone(),
    );
    let backend = config
        .backend
        .as_ref()
        .map(|settings| BackendClient::new(http_client.clone(), settings));

    let supervisor = Supervisor::new(SupervisorDeps {
        factory: Arc::new(factory),
        forwarder: forwarder.clone(),
        backend,
        fallback: config.fallback.clone(),
        polling: config.polling.clone(),
        auth_root: config.providers.auth_root.clone(),
    });
    let router = SendRouter::new(supervisor.clone(), config.fallback.clone());

    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.reconnect_existing_sessions().await });
    }
    tokio::spawn(janitor::run(supervisor.clone()));

    let app = build_router(AppState {
        supervisor: supervisor.clone(),
        router,
        forwarder,
        cloud_creds: config.providers.cloud_credentials.clone(),
    });

    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("bind {}", config.addr))?;
    info!("courier-gateway listening on {}", config.addr);

    serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
        })
        .await?;

    shutdown(supervisor, queue).await;
    Ok(())
}

async fn shutdown(supervisor: Supervisor, queue: DeliveryQueue) {
    let sequence = async {
        supervisor.shutdown().await;
        if let Err(err) = queue.persist_sync() {
            error!(error = %err, "failed to persist delivery queue during shutdown");
        }
    };
    match tokio::time::timeout(SHUTDOWN_DEADLINE, sequence).await {
        Ok(()) => info!("shutdown complete"),
        Err(_) => {
            error!("shutdown deadline exceeded; exiting");
            std::process::exit(1);
        }
    }
}

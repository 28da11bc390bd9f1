// Broker service main entry point.
mod observability;

use anyhow::{Context, Result};
use broker::{config, server};
use conveyor_broker::Broker;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("conveyor-broker");
    let config = config::BrokerConfig::from_env_or_yaml()?;

    if let Some(metrics_bind) = config.metrics_bind {
        tokio::spawn(async move {
            if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
                tracing::warn!(error = %err, "metrics listener exited");
            }
        });
    }

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind broker listener {}", config.bind))?;
    tracing::info!(addr = %listener.local_addr()?, "broker listening");

    let broker = Arc::new(Broker::new());
    let accept_task = tokio::spawn(async move {
        if let Err(err) = server::serve(listener, broker, config.max_frame_bytes).await {
            tracing::warn!(error = %err, "broker accept loop exited");
        }
    });

    shutdown.await;
    accept_task.abort();
    tracing::info!("broker stopped");
    Ok(())
}

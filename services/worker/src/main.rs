// Worker service main entry point.
mod observability;

use anyhow::{Context, Result};
use conveyor_client::Client;
use conveyor_middleware::Transport;
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use worker::config::WorkerConfig;
use worker::worker::{Exit, Worker};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    match run_with_shutdown(terminated()).await? {
        Exit::Shutdown => Ok(ExitCode::SUCCESS),
        Exit::Crashed(_) => Ok(ExitCode::FAILURE),
    }
}

async fn terminated() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("termination requested");
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<Exit>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("conveyor-worker");
    let config = WorkerConfig::from_env_or_yaml()?;

    if let Some(metrics_bind) = config.metrics_bind {
        tokio::spawn(async move {
            if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
                tracing::warn!(error = %err, "metrics listener exited");
            }
        });
    }

    let client = Client::connect_url(&config.broker_url)
        .await
        .with_context(|| format!("connect to {}", config.broker_url))?;
    let transport: Arc<dyn Transport> = Arc::new(client);
    let worker = Worker::new(&config, transport).await?;
    worker.run(shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    fn base_env(broker_url: &str, state_dir: &str) -> Vec<EnvGuard> {
        vec![
            EnvGuard::set("ID", "0"),
            EnvGuard::set("BROKER_URL", broker_url),
            EnvGuard::set("INPUT_EXCHANGE_NAMES", "movies"),
            EnvGuard::set("INPUT_QUEUE_NAMES", "relay"),
            EnvGuard::set("INPUT_COPIES", "1"),
            EnvGuard::unset("OUTPUT_EXCHANGE_NAME"),
            EnvGuard::unset("OUTPUT_QUEUE_NAMES"),
            EnvGuard::unset("OUTPUT_DELIVERY_TYPES"),
            EnvGuard::unset("OUTPUT_COPIES"),
            EnvGuard::unset("RUSSIAN_ROULETTE_CHANCE"),
            EnvGuard::unset("CRASH_MODE"),
            EnvGuard::unset("STAGE"),
            EnvGuard::unset("SELECT"),
            EnvGuard::unset("HEALTH_CHECK_PORT"),
            EnvGuard::unset("METRICS_BIND"),
            EnvGuard::unset("CONVEYOR_CONFIG"),
            EnvGuard::set("STATE_DIR", state_dir),
        ]
    }

    #[tokio::test]
    #[serial]
    async fn non_tcp_broker_urls_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _env = base_env("memory", dir.path().to_str().expect("utf-8 path"));
        let err = run_with_shutdown(async {}).await.expect_err("memory url");
        assert!(format!("{err:#}").contains("tcp://"), "{err:#}");
    }

    #[tokio::test]
    #[serial]
    async fn unreachable_broker_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let dir = tempfile::tempdir().expect("tempdir");
        let _env = base_env(
            &format!("tcp://{addr}"),
            dir.path().to_str().expect("utf-8 path"),
        );
        let err = run_with_shutdown(async {}).await.expect_err("nothing listening");
        assert!(err.to_string().contains("connect to tcp://"), "{err:#}");
    }

    #[tokio::test]
    #[serial]
    async fn shutdown_stops_a_connected_worker() -> Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let in_process = Arc::new(conveyor_broker::Broker::new());
        tokio::spawn(broker::server::serve(
            listener,
            in_process,
            conveyor_wire::DEFAULT_MAX_FRAME_BYTES,
        ));
        let dir = tempfile::tempdir()?;
        let _env = base_env(
            &format!("tcp://{addr}"),
            dir.path().to_str().expect("utf-8 path"),
        );
        let exit = run_with_shutdown(async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        })
        .await?;
        assert_eq!(exit, Exit::Shutdown);
        Ok(())
    }
}

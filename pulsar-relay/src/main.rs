use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{net::TcpListener, time::timeout};
use tracing::{info, info_span, warn};

use pulsar_relay::{
    cli::Cli,
    config::RelayConfig,
    device::PortOpener,
    hub::Hub,
    logging, server,
    source::SourceReader,
    supervisor::Supervisor,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RelayConfig::from_cli(&cli);
    logging::init(&config.log_file)?;

    info!(device = %config.device, "starting PULSAR relay");

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    let (hub, hub_task) = Hub::spawn(config.subscriber_write_timeout, info_span!("hub"));

    let opener = Arc::new(PortOpener::new(config.baud_rate, config.read_timeout));
    let reader = SourceReader::new(
        opener,
        hub.clone(),
        config.max_frame_len,
        info_span!("source", device = %config.device),
    );
    let (supervisor, supervisor_task) = Supervisor::spawn(
        reader,
        config.device.clone(),
        config.retry_interval,
        info_span!("supervisor"),
    );

    server::announce(listener.local_addr()?);
    let app = server::router(hub.clone(), config.origins.clone(), config.subscriber_queue);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("shutting down");
    supervisor.stop().await;
    if timeout(config.shutdown_grace, supervisor_task).await.is_err() {
        warn!(grace = ?config.shutdown_grace, "supervisor did not stop in time");
    }
    hub.shutdown().await;
    let _ = hub_task.await;

    served.context("http server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// Server entry point.
mod observability;

use anyhow::{Context, Result};
use caserve_core::Server;
use caserve_db::MemoryDatabase;
use caserver::config::ServerConfig;
use caserver::records::{self, Scanner};
use caserver::transport::{tcp, udp};
use std::future::Future;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;

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
    let metrics_handle = observability::init_observability("caserver");
    let config = ServerConfig::from_env_or_yaml()?;

    let db = Arc::new(MemoryDatabase::new());
    if let Some(path) = &config.records_path {
        let count = records::load_records_file(&db, path)?;
        tracing::info!(count, path = %path.display(), "records loaded");
    } else {
        tracing::info!("no record file configured (CASERVE_RECORDS not set)");
    }
    let server = Server::new(db.clone(), config.engine()).context("create server")?;

    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let listener = TcpListener::bind(config.tcp_bind)
        .await
        .context("bind stream listener")?;
    tracing::info!(addr = %listener.local_addr()?, "stream listener started");
    let socket = UdpSocket::bind(config.udp_bind)
        .await
        .context("bind search socket")?;
    tracing::info!(addr = %socket.local_addr()?, "search listener started");

    let (stop_stream, stream_stopped) = oneshot::channel::<()>();
    let stream_task = tokio::spawn({
        let server = Arc::clone(&server);
        async move {
            let stopped = async {
                let _ = stream_stopped.await;
            };
            if let Err(err) = tcp::serve(listener, server, stopped).await {
                tracing::warn!(error = %err, "stream accept loop exited");
            }
        }
    });
    let tasks = [
        tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                if let Err(err) = udp::serve(socket, server).await {
                    tracing::warn!(error = %err, "search responder exited");
                }
            }
        }),
        tokio::spawn(udp::reap_provisional(
            Arc::clone(&server),
            config.provisional_ttl(),
        )),
    ];

    let scanner = match config.scan_interval() {
        Some(interval) => Some(Scanner::start(db, interval)?),
        None => None,
    };
    tracing::info!("server started");

    shutdown.await;
    // Open connections are aborted and their sessions released first.
    let _ = stop_stream.send(());
    if let Err(err) = stream_task.await {
        tracing::warn!(error = %err, "stream listener task failed");
    }
    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        // Cancelled tasks must be gone before the engine is torn down.
        let _ = task.await;
    }
    drop(scanner);
    server.shutdown();
    tracing::info!("server stopped");
    Ok(())
}

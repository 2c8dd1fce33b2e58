// Stream listener: one session per connection, with a writer that drains
// the client's outbound buffer whenever frames are committed.
use anyhow::{Context, Result};
use caserve_core::{Client, Server, Session};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use super::READ_CHUNK;

/// Accept connections until `shutdown` resolves, then abort every open
/// connection and wait for its session to be released.
pub async fn serve<F>(listener: TcpListener, server: Arc<Server>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);
    let result = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = match accepted.context("accept connection") {
                    Ok(accepted) => accepted,
                    Err(err) => break Err(err),
                };
                let server = Arc::clone(&server);
                connections.spawn(async move {
                    if let Err(err) = handle_connection(server, stream, peer).await {
                        tracing::warn!(%peer, error = %err, "connection handler failed");
                    }
                });
            }
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = joined
                    && err.is_panic()
                {
                    tracing::warn!(error = %err, "connection task panicked");
                }
            }
        }
    };
    let open = connections.len();
    connections.shutdown().await;
    tracing::info!(connections = open, "stream listener stopped");
    result
}

pub(crate) async fn handle_connection(
    server: Arc<Server>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(%peer, error = %err, "set_nodelay failed");
    }
    let (mut reader, writer) = stream.into_split();
    let mut session = Session::stream(&server, peer.to_string());
    let client = Arc::clone(session.client());

    // Reader and writer share this task, so aborting it releases both.
    let read_side = async {
        let mut buf = vec![0u8; READ_CHUNK];
        let result = loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(err) => break Err(err).context("read from peer"),
            };
            if let Err(err) = session.on_bytes_received(&buf[..n]) {
                // Replies already buffered, including any error frame, still go out.
                tracing::warn!(client = %client.id(), %peer, error = %err, "closing session");
                break Ok(());
            }
        };
        session.on_connection_closed();
        result
    };
    let write_side = write_loop(Arc::clone(&server), Arc::clone(&client), writer);
    let (result, written) = tokio::join!(read_side, write_side);
    if let Err(err) = written {
        tracing::debug!(%peer, error = %err, "writer stopped");
    }
    result
}

// Runs until the client is closed and its buffer is empty.
async fn write_loop(
    server: Arc<Server>,
    client: Arc<Client>,
    mut writer: OwnedWriteHalf,
) -> Result<()> {
    loop {
        if let Some(bytes) = server.take_outbound(&client) {
            if let Err(err) = writer.write_all(&bytes).await {
                // Nobody is reading; stop the reader too.
                server.disconnect(&client);
                return Err(err).context("write to peer");
            }
            continue;
        }
        if client.is_closed() {
            break;
        }
        client.ready().await;
    }
    writer.shutdown().await.context("shutdown writer")?;
    Ok(())
}

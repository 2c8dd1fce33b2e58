// Datagram search responder and the reaper for channels it creates.
use anyhow::{Context, Result};
use caserve_core::{Server, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

use super::MAX_DATAGRAM;

pub async fn serve(socket: UdpSocket, server: Arc<Server>) -> Result<()> {
    let mut session = Session::datagram(&server);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, peer) = socket
            .recv_from(&mut buf)
            .await
            .context("receive datagram")?;
        if let Err(err) = session.on_datagram(&buf[..n]) {
            tracing::debug!(%peer, error = %err, "datagram rejected");
        }
        // Replies go back to whoever asked, in one datagram per drain.
        while let Some(reply) = session.take_outbound() {
            if let Err(err) = socket.send_to(&reply, peer).await {
                tracing::debug!(%peer, error = %err, "search reply dropped");
            }
        }
    }
}

/// Periodically release provisional channels nobody claimed.
pub async fn reap_provisional(server: Arc<Server>, ttl: Duration) {
    let mut ticker = tokio::time::interval(ttl.max(Duration::from_millis(10)) / 2);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        server.reap_provisional(ttl);
    }
}

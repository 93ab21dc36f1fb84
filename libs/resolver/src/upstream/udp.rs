//! Plain DNS over UDP.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use dns_types::{Query, Response};
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use super::tcp::TcpStrategy;

const TIMEOUT: Duration = Duration::from_secs(3);

// To avoid fragmentation, IP and thus also UDP packets can only reliably be
// sent with an MTU of <= 1500 on the public Internet.
const BUF_SIZE: usize = 1500;

/// Resolves against an upstream over UDP, re-using idle connected sockets.
///
/// A socket is checked out for the duration of one query so concurrent
/// queries never read each other's replies. A truncated reply is retried
/// once over TCP against the same upstream.
#[derive(Default)]
pub struct UdpStrategy {
    idle: Mutex<HashMap<SocketAddr, Vec<Arc<UdpSocket>>>>,
}

impl UdpStrategy {
    pub async fn resolve(
        &self,
        server: SocketAddr,
        query: &Query,
        tcp: &TcpStrategy,
    ) -> Result<Response> {
        let socket = self.checkout(server).await?;

        let response = tokio::time::timeout(TIMEOUT, query_one(&socket, query))
            .await
            .with_context(|| format!("UDP query to {server} timed out"))??;

        self.idle.lock().entry(server).or_default().push(socket);

        if response.truncated() {
            tracing::debug!(%server, domain = %query.domain(), "Reply truncated, retrying over TCP");

            return tcp
                .resolve(server, query)
                .await
                .context("TCP retry after truncated UDP reply failed");
        }

        Ok(response)
    }

    async fn checkout(&self, server: SocketAddr) -> Result<Arc<UdpSocket>> {
        if let Some(socket) = self
            .idle
            .lock()
            .get_mut(&server)
            .and_then(|sockets| sockets.pop())
        {
            return Ok(socket);
        }

        let bind_addr = match server {
            SocketAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            SocketAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        };

        let socket = UdpSocket::bind(bind_addr)
            .await
            .context("Failed to bind UDP socket")?;
        socket
            .connect(server)
            .await
            .with_context(|| format!("Failed to connect UDP socket to {server}"))?;

        Ok(Arc::new(socket))
    }
}

async fn query_one(socket: &UdpSocket, query: &Query) -> Result<Response> {
    socket
        .send(query.as_bytes())
        .await
        .context("Failed to send UDP query")?;

    // A connected socket only receives datagrams from the upstream, but a
    // stale reply to an earlier query on a re-used socket may still arrive
    // first. Skip anything that does not answer this query.
    loop {
        let mut buffer = vec![0u8; BUF_SIZE];
        let len = socket
            .recv(&mut buffer)
            .await
            .context("Failed to receive UDP reply")?;
        buffer.truncate(len);

        match Response::parse(&buffer) {
            Ok(response) if response.id() == query.id() => return Ok(response),
            Ok(response) => {
                tracing::trace!(got = response.id(), want = query.id(), "Skipping stale reply");
            }
            Err(e) => {
                tracing::debug!("Skipping unparseable datagram: {e}");
            }
        }
    }
}

//! A UDP DNS listener that operates on user-space sockets.
//!
//! The server only owns socket I/O and framing: it parses inbound datagrams
//! into queries and writes size-capped replies. Dispatching queries into a
//! resolver, deadlines and backpressure are the caller's business.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use anyhow::{Context as _, Result};
use futures::{
    FutureExt, StreamExt as _,
    future::BoxFuture,
    stream::{self, BoxStream, FuturesUnordered},
    task::AtomicWaker,
};
use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Weak},
    task::{Context, Poll},
};
use tokio::net::UdpSocket;

pub struct Server {
    // Strong reference to the UDP socket; the read stream holds a weak one.
    socket: Option<Arc<UdpSocket>>,

    reading_queries: BoxStream<'static, Result<(SocketAddr, Inbound)>>,

    sending_replies: FuturesUnordered<BoxFuture<'static, Result<()>>>,

    waker: AtomicWaker,
}

/// One datagram received from a client.
pub struct Packet {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub inbound: Inbound,
}

pub enum Inbound {
    Query(dns_types::Query),
    /// A datagram that did not parse as a query; carries the id if the
    /// header was intact so the caller can reply FORMERR.
    Malformed { id: Option<u16> },
}

impl Server {
    pub fn rebind(&mut self, socket: SocketAddr) -> Result<()> {
        self.socket = None;
        self.reading_queries = stream::empty().boxed();
        self.sending_replies.clear();

        let udp_socket = Arc::new(make_udp_socket(socket)?);

        self.reading_queries = udp_query_stream(Arc::downgrade(&udp_socket));
        self.socket = Some(udp_socket);

        self.waker.wake();

        tracing::debug!(%socket, "Listening for UDP DNS queries");

        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::other("No UDP socket"))?
            .local_addr()
    }

    /// Queues a reply, truncating it to `max_payload` with TC=1 if needed.
    ///
    /// `max_payload` is the client's EDNS0-advertised size, or 512 without
    /// EDNS; the client retries over TCP when it sees the TC bit.
    pub fn send_response(
        &mut self,
        to: SocketAddr,
        response: dns_types::Response,
        max_payload: u16,
    ) -> io::Result<()> {
        self.send_raw(to, response.into_bytes(max_payload))
    }

    /// Queues a raw reply, e.g. a FORMERR for a datagram that never parsed.
    pub fn send_raw(&mut self, to: SocketAddr, payload: Vec<u8>) -> io::Result<()> {
        let udp_socket = self
            .socket
            .clone()
            .ok_or_else(|| io::Error::other("No UDP socket"))?;

        self.sending_replies.push(
            async move {
                udp_socket
                    .send_to(&payload, to)
                    .await
                    .context("Failed to send UDP response")?;

                Ok(())
            }
            .boxed(),
        );

        self.waker.wake();

        Ok(())
    }

    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Packet>> {
        loop {
            if let Poll::Ready(Some(result)) = self.sending_replies.poll_next_unpin(cx) {
                result
                    .context("Failed to send UDP DNS response")
                    .map_err(anyhow_to_io)?;

                continue;
            }

            if let Poll::Ready(Some(result)) = self.reading_queries.poll_next_unpin(cx) {
                let (remote, inbound) = result
                    .context("Failed to read UDP DNS query")
                    .map_err(anyhow_to_io)?;

                let local = self
                    .socket
                    .as_ref()
                    .context("No UDP socket")
                    .map_err(anyhow_to_io)?
                    .local_addr()?;

                return Poll::Ready(Ok(Packet {
                    local,
                    remote,
                    inbound,
                }));
            }

            self.waker.register(cx.waker());
            return Poll::Pending;
        }
    }
}

/// Produces a stream of inbound DNS queries for as long as there is at least
/// one strong reference to the socket.
fn udp_query_stream(
    udp_socket: Weak<UdpSocket>,
) -> BoxStream<'static, Result<(SocketAddr, Inbound)>> {
    stream::repeat(udp_socket)
        .filter_map(|udp_socket| async move { udp_socket.upgrade() })
        .then(read_query)
        .boxed()
}

fn anyhow_to_io(e: anyhow::Error) -> io::Error {
    io::Error::other(format!("{e:#}"))
}

async fn read_query(socket: Arc<UdpSocket>) -> Result<(SocketAddr, Inbound)> {
    let mut buffer = vec![0u8; 2000]; // On the public Internet, any MTU > 1500 is very unlikely so 2000 is a safe bet.

    let (len, from) = socket
        .recv_from(&mut buffer)
        .await
        .context("Failed to receive UDP packet")?;

    buffer.truncate(len);

    let inbound = match dns_types::Query::parse(&buffer) {
        Ok(query) => Inbound::Query(query),
        Err(e) => {
            tracing::debug!(%from, "Failed to parse DNS message: {e}");

            Inbound::Malformed {
                id: header_id(&buffer),
            }
        }
    };

    Ok((from, inbound))
}

/// The message id, if the datagram has a complete 12-byte header.
fn header_id(payload: &[u8]) -> Option<u16> {
    let header: &[u8; 12] = payload.get(..12)?.try_into().ok()?;

    Some(u16::from_be_bytes([header[0], header[1]]))
}

fn make_udp_socket(socket: SocketAddr) -> Result<UdpSocket> {
    let udp_socket = std::net::UdpSocket::bind(socket)
        .with_context(|| format!("Failed to bind UDP socket on {socket}"))?;
    udp_socket
        .set_nonblocking(true)
        .context("Failed to set socket as non-blocking")?;

    let udp_socket =
        UdpSocket::from_std(udp_socket).context("Failed to convert std to tokio socket")?;

    Ok(udp_socket)
}

impl Default for Server {
    fn default() -> Self {
        Self {
            socket: None,
            reading_queries: stream::empty().boxed(),
            sending_replies: FuturesUnordered::new(),
            waker: AtomicWaker::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::net::Ipv4Addr;

    use super::*;

    #[tokio::test]
    async fn answers_a_query() {
        let mut server = Server::default();
        server
            .rebind((Ipv4Addr::LOCALHOST, 0).into())
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            loop {
                let packet = poll_fn(|cx| server.poll(cx)).await.unwrap();

                match packet.inbound {
                    Inbound::Query(query) => {
                        let max_payload = query.max_udp_payload();

                        server
                            .send_response(
                                packet.remote,
                                dns_types::Response::no_error(&query),
                                max_payload,
                            )
                            .unwrap();
                    }
                    Inbound::Malformed { id } => {
                        if let Some(id) = id {
                            server
                                .send_raw(packet.remote, dns_types::formerr_bytes(id))
                                .unwrap();
                        }
                    }
                }
            }
        });

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        client.connect(server_addr).await.unwrap();

        let query = dns_types::Query::new(
            dns_types::DomainName::vec_from_str("example.com").unwrap(),
            dns_types::RecordType::A,
        );

        client.send(query.as_bytes()).await.unwrap();

        let mut buffer = vec![0u8; 512];
        let len = client.recv(&mut buffer).await.unwrap();

        let response = dns_types::Response::parse(&buffer[..len]).unwrap();

        assert_eq!(response.id(), query.id());
        assert_eq!(
            response.response_code(),
            dns_types::ResponseCode::NOERROR
        );

        server_task.abort();
    }

    #[tokio::test]
    async fn malformed_datagram_yields_formerr() {
        let mut server = Server::default();
        server
            .rebind((Ipv4Addr::LOCALHOST, 0).into())
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            loop {
                let packet = poll_fn(|cx| server.poll(cx)).await.unwrap();

                if let Inbound::Malformed { id: Some(id) } = packet.inbound {
                    server
                        .send_raw(packet.remote, dns_types::formerr_bytes(id))
                        .unwrap();
                }
            }
        });

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        client.connect(server_addr).await.unwrap();

        // A valid header followed by garbage instead of a question.
        let mut datagram = vec![0u8; 16];
        datagram[0] = 0xab;
        datagram[1] = 0xcd;
        datagram[5] = 1; // QDCOUNT 1, but no question follows.
        client.send(&datagram).await.unwrap();

        let mut buffer = vec![0u8; 512];
        let len = client.recv(&mut buffer).await.unwrap();

        assert_eq!(buffer[0], 0xab);
        assert_eq!(buffer[1], 0xcd);
        assert_eq!(buffer[3] & 0x0f, 1); // FORMERR
        assert!(len >= 12);

        server_task.abort();
    }
}

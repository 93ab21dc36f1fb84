//! A TCP DNS listener that operates on user-space sockets.
//!
//! Replies on a connection are written before the next query is read from
//! it, so each client sees its answers in request order. Like its UDP
//! sibling, the server owns only I/O and framing.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use anyhow::{Context as _, Result};
use futures::{
    FutureExt, StreamExt as _, future::BoxFuture, stream::FuturesUnordered, task::AtomicWaker,
};
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpListener, TcpStream},
};

#[derive(Default)]
pub struct Server {
    listener: Option<TcpListener>,

    /// Open TCP streams by their remote address.
    ///
    /// After reading a query from a stream, it is parked here until the
    /// caller sends the response back.
    tcp_streams_by_remote: HashMap<SocketAddr, TcpStream>,

    reading_queries:
        FuturesUnordered<BoxFuture<'static, Result<Option<(SocketAddr, Inbound, TcpStream)>>>>,
    sending_replies: FuturesUnordered<BoxFuture<'static, Result<(TcpStream, SocketAddr)>>>,
    /// Replies that close the connection afterwards (malformed queries).
    sending_final_replies: FuturesUnordered<BoxFuture<'static, Result<()>>>,

    waker: AtomicWaker,
}

pub struct Packet {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub inbound: Inbound,
}

pub enum Inbound {
    Query(dns_types::Query),
    /// A frame that did not parse as a query; carries the id if the header
    /// was intact so the caller can reply FORMERR.
    Malformed { id: Option<u16> },
}

impl Server {
    pub fn rebind(&mut self, socket: SocketAddr) -> Result<()> {
        self.listener = None;

        let tcp_listener = make_tcp_listener(socket)?;

        self.listener = Some(tcp_listener);

        self.waker.wake();

        tracing::debug!(%socket, "Listening for TCP DNS queries");

        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener
            .as_ref()
            .ok_or_else(|| io::Error::other("No TCP listener"))?
            .local_addr()
    }

    /// Queues a reply and keeps the connection open for further queries.
    pub fn send_response(
        &mut self,
        to: SocketAddr,
        response: dns_types::Response,
    ) -> io::Result<()> {
        let mut stream = self
            .tcp_streams_by_remote
            .remove(&to)
            .ok_or_else(|| io::Error::other("No TCP stream"))?;

        self.sending_replies.push(
            async move {
                // DNS over TCP has a 16-bit length field, we can't encode anything bigger than that.
                let response = response.into_bytes(u16::MAX);

                write_frame(&mut stream, &response).await?;

                Ok((stream, to))
            }
            .boxed(),
        );

        self.waker.wake();

        Ok(())
    }

    /// Queues a raw reply and closes the connection afterwards.
    pub fn send_final_raw(&mut self, to: SocketAddr, payload: Vec<u8>) -> io::Result<()> {
        let mut stream = self
            .tcp_streams_by_remote
            .remove(&to)
            .ok_or_else(|| io::Error::other("No TCP stream"))?;

        self.sending_final_replies.push(
            async move {
                write_frame(&mut stream, &payload).await?;
                stream.shutdown().await.context("Failed to close stream")?;

                Ok(())
            }
            .boxed(),
        );

        self.waker.wake();

        Ok(())
    }

    /// Drops the parked connection for `remote`, e.g. when a query is
    /// rejected without a reply.
    pub fn drop_connection(&mut self, remote: SocketAddr) {
        self.tcp_streams_by_remote.remove(&remote);
    }

    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Packet>> {
        loop {
            if let Poll::Ready(Some(result)) = self.sending_replies.poll_next_unpin(cx) {
                let (stream, from) = result
                    .context("Failed to send TCP DNS response")
                    .map_err(anyhow_to_io)?;

                // Response is out, read the next query. (Clients may reuse
                // the stream for multiple queries.)
                self.reading_queries.push(read_query(stream, from).boxed());

                continue;
            }

            if let Poll::Ready(Some(result)) = self.sending_final_replies.poll_next_unpin(cx) {
                if let Err(e) = result {
                    tracing::debug!("Failed to send final TCP reply: {e:#}");
                }

                continue;
            }

            if let Poll::Ready(Some(result)) = self.reading_queries.poll_next_unpin(cx) {
                let Some((from, inbound, stream)) = result
                    .context("Failed to read TCP DNS query")
                    .map_err(anyhow_to_io)?
                else {
                    continue;
                };

                let local = stream.local_addr()?;

                // Park the stream so a response can be sent back later.
                self.tcp_streams_by_remote.insert(from, stream);

                return Poll::Ready(Ok(Packet {
                    local,
                    remote: from,
                    inbound,
                }));
            }

            if let Some(tcp) = self.listener.as_mut()
                && let Poll::Ready((stream, from)) = tcp.poll_accept(cx)?
            {
                self.reading_queries.push(read_query(stream, from).boxed());
                continue;
            }

            self.waker.register(cx.waker());
            return Poll::Pending;
        }
    }
}

fn anyhow_to_io(e: anyhow::Error) -> io::Error {
    io::Error::other(format!("{e:#}"))
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u16;

    stream
        .write_all(&len.to_be_bytes())
        .await
        .context("Failed to write TCP DNS header")?;
    stream
        .write_all(payload)
        .await
        .context("Failed to write TCP DNS message")?;

    Ok(())
}

/// Reads one length-prefixed query from the stream; `None` on a clean close.
async fn read_query(
    mut stream: TcpStream,
    from: SocketAddr,
) -> Result<Option<(SocketAddr, Inbound, TcpStream)>> {
    let mut buf = [0; 2];
    match stream.read_exact(&mut buf).await {
        Ok(2) => {}
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(anyhow::Error::new(e).context("Failed to read TCP DNS header")),
    }

    let len = u16::from_be_bytes(buf) as usize;

    let mut buf = vec![0; len];
    stream
        .read_exact(&mut buf)
        .await
        .context("Failed to read TCP DNS message")?;

    let inbound = match dns_types::Query::parse(&buf) {
        Ok(query) => Inbound::Query(query),
        Err(e) => {
            tracing::debug!(%from, "Failed to parse DNS message: {e}");

            Inbound::Malformed {
                id: header_id(&buf),
            }
        }
    };

    Ok(Some((from, inbound, stream)))
}

fn header_id(payload: &[u8]) -> Option<u16> {
    let header: &[u8; 12] = payload.get(..12)?.try_into().ok()?;

    Some(u16::from_be_bytes([header[0], header[1]]))
}

fn make_tcp_listener(socket: SocketAddr) -> Result<TcpListener> {
    let tcp_listener = std::net::TcpListener::bind(socket)
        .with_context(|| format!("Failed to bind TCP listener on {socket}"))?;
    tcp_listener
        .set_nonblocking(true)
        .context("Failed to set listener to non-blocking")?;

    let tcp_listener =
        TcpListener::from_std(tcp_listener).context("Failed to convert std to tokio listener")?;

    Ok(tcp_listener)
}

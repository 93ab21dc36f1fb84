//! DNS listener loops: dispatching queries into the pipeline.
//!
//! Each accepted query runs as its own task under an in-flight limit. UDP
//! replies are capped at the client's EDNS0 size (512 without EDNS) and
//! truncated with TC=1 beyond it; TCP replies go out in request order per
//! connection.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use anyhow::{Context as _, Result};
use dns_types::{MIN_UDP_PAYLOAD, Query, Response};
use opentelemetry::metrics::Counter;
use resolver::{QueryCtx, Resolve as _};
use tokio::sync::{Semaphore, mpsc};

use crate::proxy::Proxy;

fn saturation_counter() -> Counter<u64> {
    opentelemetry::global::meter("outway")
        .u64_counter("dns.queries.saturated")
        .with_description("Queries rejected or dropped because the in-flight limit was reached.")
        .build()
}

/// Upper bound on concurrently processed queries across both listeners.
pub const MAX_IN_FLIGHT: usize = 4096;

/// How long shutdown waits for in-flight queries.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Servers {
    pub udp_addr: SocketAddr,
    pub tcp_addr: SocketAddr,
    udp_task: tokio::task::JoinHandle<()>,
    tcp_task: tokio::task::JoinHandle<()>,
    in_flight: Arc<Semaphore>,
}

impl Servers {
    /// Binds both listeners at the configured addresses and starts serving.
    pub fn bind(proxy: Proxy) -> Result<Self> {
        let config = proxy.config.current();

        let mut udp = udp_dns_server::Server::default();
        udp.rebind(config.listen_udp)
            .context("Failed to bind UDP listener")?;
        let udp_addr = udp.local_addr()?;

        let mut tcp = tcp_dns_server::Server::default();
        tcp.rebind(config.listen_tcp)
            .context("Failed to bind TCP listener")?;
        let tcp_addr = tcp.local_addr()?;

        let in_flight = Arc::new(Semaphore::new(MAX_IN_FLIGHT));

        let udp_task = tokio::spawn(serve_udp(udp, proxy.clone(), in_flight.clone()));
        let tcp_task = tokio::spawn(serve_tcp(tcp, proxy, in_flight.clone()));

        tracing::info!(%udp_addr, %tcp_addr, "Serving DNS");

        Ok(Self {
            udp_addr,
            tcp_addr,
            udp_task,
            tcp_task,
            in_flight,
        })
    }

    /// Stops accepting queries and waits for in-flight ones, bounded by
    /// [`DRAIN_TIMEOUT`].
    pub async fn shutdown(self) {
        self.udp_task.abort();
        self.tcp_task.abort();

        let drained = tokio::time::timeout(
            DRAIN_TIMEOUT,
            self.in_flight.acquire_many(MAX_IN_FLIGHT as u32),
        )
        .await;

        match drained {
            Ok(_) => tracing::debug!("All in-flight queries drained"),
            Err(_) => tracing::warn!("Shutdown drain timed out with queries in flight"),
        }
    }
}

enum UdpReply {
    Response {
        to: SocketAddr,
        response: Response,
        max_payload: u16,
    },
}

enum Event<R, P> {
    Reply(R),
    Packet(io::Result<P>),
}

async fn serve_udp(mut server: udp_dns_server::Server, proxy: Proxy, in_flight: Arc<Semaphore>) {
    let (reply_tx, mut reply_rx) = mpsc::channel::<UdpReply>(1024);
    let saturated = saturation_counter();

    loop {
        // Sending replies and reading queries share the socket, so both are
        // driven from one poll; handlers below get exclusive server access.
        let event = poll_fn(|cx| {
            if let Poll::Ready(Some(reply)) = reply_rx.poll_recv(cx) {
                return Poll::Ready(Event::Reply(reply));
            }

            server.poll(cx).map(Event::Packet)
        })
        .await;

        match event {
            Event::Reply(UdpReply::Response {
                to,
                response,
                max_payload,
            }) => {
                if let Err(e) = server.send_response(to, response, max_payload) {
                    tracing::debug!("Failed to queue UDP reply: {e}");
                }
            }
            Event::Packet(Err(e)) => {
                tracing::warn!("UDP listener error: {e}");
            }
            Event::Packet(Ok(packet)) => match packet.inbound {
                udp_dns_server::Inbound::Query(query) => {
                    // An overloaded server silently drops UDP queries;
                    // clients retry on their own schedule.
                    let Ok(permit) = in_flight.clone().try_acquire_owned() else {
                        tracing::debug!("In-flight limit reached, dropping UDP query");
                        saturated.add(1, &[]);
                        continue;
                    };

                    let max_payload = query.max_udp_payload().max(MIN_UDP_PAYLOAD);
                    let reply_tx = reply_tx.clone();
                    let proxy = proxy.clone();
                    let remote = packet.remote;

                    tokio::spawn(async move {
                        let response = resolve(&proxy, &query, remote).await;

                        let _ = reply_tx
                            .send(UdpReply::Response {
                                to: remote,
                                response,
                                max_payload,
                            })
                            .await;

                        drop(permit);
                    });
                }
                udp_dns_server::Inbound::Malformed { id: Some(id) } => {
                    if let Err(e) =
                        server.send_raw(packet.remote, dns_types::formerr_bytes(id))
                    {
                        tracing::debug!("Failed to queue FORMERR: {e}");
                    }
                }
                udp_dns_server::Inbound::Malformed { id: None } => {}
            },
        }
    }
}

enum TcpReply {
    Response { to: SocketAddr, response: Response },
}

async fn serve_tcp(mut server: tcp_dns_server::Server, proxy: Proxy, in_flight: Arc<Semaphore>) {
    let (reply_tx, mut reply_rx) = mpsc::channel::<TcpReply>(1024);
    let saturated = saturation_counter();

    loop {
        let event = poll_fn(|cx| {
            if let Poll::Ready(Some(reply)) = reply_rx.poll_recv(cx) {
                return Poll::Ready(Event::Reply(reply));
            }

            server.poll(cx).map(Event::Packet)
        })
        .await;

        match event {
            Event::Reply(TcpReply::Response { to, response }) => {
                if let Err(e) = server.send_response(to, response) {
                    tracing::debug!("Failed to queue TCP reply: {e}");
                }
            }
            Event::Packet(Err(e)) => {
                tracing::warn!("TCP listener error: {e}");
            }
            Event::Packet(Ok(packet)) => match packet.inbound {
                tcp_dns_server::Inbound::Query(query) => {
                    // TCP clients get a definitive SERVFAIL when the server
                    // is saturated.
                    let Ok(permit) = in_flight.clone().try_acquire_owned() else {
                        saturated.add(1, &[]);
                        if let Err(e) =
                            server.send_response(packet.remote, Response::servfail(&query))
                        {
                            tracing::debug!("Failed to queue SERVFAIL: {e}");
                        }
                        continue;
                    };

                    let reply_tx = reply_tx.clone();
                    let proxy = proxy.clone();
                    let remote = packet.remote;

                    tokio::spawn(async move {
                        let response = resolve(&proxy, &query, remote).await;

                        let _ = reply_tx
                            .send(TcpReply::Response {
                                to: remote,
                                response,
                            })
                            .await;

                        drop(permit);
                    });
                }
                tcp_dns_server::Inbound::Malformed { id: Some(id) } => {
                    if let Err(e) =
                        server.send_final_raw(packet.remote, dns_types::formerr_bytes(id))
                    {
                        tracing::debug!("Failed to queue FORMERR: {e}");
                    }
                }
                tcp_dns_server::Inbound::Malformed { id: None } => {
                    server.drop_connection(packet.remote);
                }
            },
        }
    }
}

/// Runs one query through the pipeline; any error becomes SERVFAIL.
async fn resolve(proxy: &Proxy, query: &Query, client: SocketAddr) -> Response {
    let ctx = QueryCtx {
        client,
        snapshot: proxy.config.current().snapshot.clone(),
    };

    match proxy.active().resolve(query, &ctx).await {
        Ok(resolved) => resolved.response,
        Err(e) => {
            tracing::debug!(domain = %query.domain(), "Query failed: {e:#}");

            Response::servfail(query)
        }
    }
}

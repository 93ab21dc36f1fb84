//! Plain DNS over TCP: length-prefixed, single-shot, pooled connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use dns_types::{Query, Response};
use parking_lot::Mutex;
use tokio::net::TcpStream;

use super::exchange_framed;

const TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_IDLE_PER_UPSTREAM: usize = 4;

#[derive(Default)]
pub struct TcpStrategy {
    idle: Mutex<HashMap<SocketAddr, Vec<IdleConn>>>,
}

struct IdleConn {
    stream: TcpStream,
    since: Instant,
}

impl TcpStrategy {
    pub async fn resolve(&self, server: SocketAddr, query: &Query) -> Result<Response> {
        let mut stream = match self.checkout(server) {
            Some(stream) => stream,
            None => tokio::time::timeout(TIMEOUT, TcpStream::connect(server))
                .await
                .with_context(|| format!("Connecting to {server} timed out"))?
                .with_context(|| format!("Failed to connect to {server}"))?,
        };

        let response = tokio::time::timeout(TIMEOUT, exchange_framed(&mut stream, query))
            .await
            .with_context(|| format!("TCP query to {server} timed out"))??;

        self.checkin(server, stream);

        Ok(response)
    }

    fn checkout(&self, server: SocketAddr) -> Option<TcpStream> {
        let mut idle = self.idle.lock();
        let conns = idle.get_mut(&server)?;

        while let Some(conn) = conns.pop() {
            if conn.since.elapsed() < IDLE_TIMEOUT {
                return Some(conn.stream);
            }
            // Dropped; the upstream has most likely closed it by now anyway.
        }

        None
    }

    fn checkin(&self, server: SocketAddr, stream: TcpStream) {
        let mut idle = self.idle.lock();
        let conns = idle.entry(server).or_default();

        conns.retain(|conn| conn.since.elapsed() < IDLE_TIMEOUT);

        if conns.len() < MAX_IDLE_PER_UPSTREAM {
            conns.push(IdleConn {
                stream,
                since: Instant::now(),
            });
        }
    }
}

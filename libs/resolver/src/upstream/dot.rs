//! DNS over TLS (RFC 7858): the TCP framing inside a rustls session.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use dns_types::{DomainName, Query, RecordType, Response};
use parking_lot::Mutex;
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};

use super::exchange_framed;

const TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_IDLE_PER_UPSTREAM: usize = 2;

pub struct DotStrategy {
    connector: TlsConnector,
    idle: Mutex<HashMap<String, Vec<IdleConn>>>,
    /// Upstreams that already passed their first-use probe.
    probed: Mutex<HashSet<String>>,
}

struct IdleConn {
    stream: TlsStream<TcpStream>,
    since: Instant,
}

impl Default for DotStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl DotStrategy {
    pub fn new() -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            connector: TlsConnector::from(Arc::new(config)),
            idle: Mutex::default(),
            probed: Mutex::default(),
        }
    }

    pub async fn resolve(&self, host: &str, port: u16, query: &Query) -> Result<Response> {
        let key = format!("{host}:{port}");

        let mut stream = match self.checkout(&key) {
            Some(stream) => stream,
            None => {
                let mut stream = tokio::time::timeout(TIMEOUT, self.connect(host, port))
                    .await
                    .with_context(|| format!("TLS connect to {key} timed out"))??;

                // One throw-away exchange on a fresh upstream proves the
                // session actually answers DNS before we rely on it.
                if !self.probed.lock().contains(&key) {
                    let probe = Query::new(DomainName::root_vec(), RecordType::NS);

                    tokio::time::timeout(TIMEOUT, exchange_framed(&mut stream, &probe))
                        .await
                        .with_context(|| format!("Probe query to {key} timed out"))?
                        .with_context(|| format!("Probe query to {key} failed"))?;

                    self.probed.lock().insert(key.clone());
                }

                stream
            }
        };

        let response = tokio::time::timeout(TIMEOUT, exchange_framed(&mut stream, query))
            .await
            .with_context(|| format!("DoT query to {key} timed out"))??;

        self.checkin(key, stream);

        Ok(response)
    }

    async fn connect(&self, host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
        let mut addresses = tokio::net::lookup_host((host, port))
            .await
            .with_context(|| format!("Failed to resolve DoT host '{host}'"))?
            .collect::<Vec<_>>();

        addresses.sort_by_key(SocketAddr::is_ipv6); // Prefer v4; v6 reachability is less common.

        let mut last_error = anyhow::anyhow!("'{host}' resolved to no addresses");

        for address in addresses {
            let stream = match TcpStream::connect(address).await {
                Ok(stream) => stream,
                Err(e) => {
                    last_error = anyhow::Error::new(e).context(format!("Failed to connect to {address}"));
                    continue;
                }
            };

            let server_name =
                ServerName::try_from(host.to_owned()).context("Invalid TLS server name")?;

            match self.connector.connect(server_name, stream).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last_error =
                        anyhow::Error::new(e).context(format!("TLS handshake with {address} failed"));
                }
            }
        }

        Err(last_error)
    }

    fn checkout(&self, key: &str) -> Option<TlsStream<TcpStream>> {
        let mut idle = self.idle.lock();
        let conns = idle.get_mut(key)?;

        while let Some(conn) = conns.pop() {
            if conn.since.elapsed() < IDLE_TIMEOUT {
                return Some(conn.stream);
            }
        }

        None
    }

    fn checkin(&self, key: String, stream: TlsStream<TcpStream>) {
        let mut idle = self.idle.lock();
        let conns = idle.entry(key).or_default();

        conns.retain(|conn| conn.since.elapsed() < IDLE_TIMEOUT);

        if conns.len() < MAX_IDLE_PER_UPSTREAM {
            conns.push(IdleConn {
                stream,
                since: Instant::now(),
            });
        }
    }
}

//! DNS over HTTPS (RFC 8484): binary DNS messages POSTed over HTTP/2.

use std::collections::{HashMap, hash_map};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use dns_types::{DohUrl, Query, Response};
use http_body_util::{BodyExt as _, Full};
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;

const TIMEOUT: Duration = Duration::from_secs(5);

type SendRequest = hyper::client::conn::http2::SendRequest<Full<Bytes>>;

pub struct DohStrategy {
    tls_config: Arc<rustls::ClientConfig>,
    clients: Mutex<HashMap<String, SendRequest>>,
}

impl Default for DohStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl DohStrategy {
    pub fn new() -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];

        Self {
            tls_config: Arc::new(config),
            clients: Mutex::new(HashMap::default()),
        }
    }

    pub async fn resolve(&self, url: &DohUrl, query: &Query) -> Result<Response> {
        tokio::time::timeout(TIMEOUT, self.resolve_inner(url, query))
            .await
            .with_context(|| format!("DoH query to {url} timed out"))?
    }

    async fn resolve_inner(&self, url: &DohUrl, query: &Query) -> Result<Response> {
        let key = url.as_str().to_owned();

        // Take the client out of the map so a failed request discards it and
        // the next query bootstraps a fresh connection.
        let mut client = {
            let mut clients = self.clients.lock().await;

            match clients.entry(key.clone()) {
                hash_map::Entry::Occupied(o) if !o.get().is_closed() => o.remove(),
                hash_map::Entry::Occupied(_) | hash_map::Entry::Vacant(_) => {
                    connect(url, self.tls_config.clone()).await?
                }
            }
        };

        client
            .ready()
            .await
            .context("Failed to await readiness of HTTP2 client")?;

        let request = query
            .clone()
            .try_into_doh_request(url)
            .context("Failed to build DoH request")?;
        let (parts, body) = request.into_parts();
        let request = http::Request::from_parts(parts, Full::new(body));

        let response = client
            .send_request(request)
            .await
            .context("Failed to send DoH request")?;

        let (parts, incoming) = response.into_parts();
        let body = incoming
            .collect()
            .await
            .context("Failed to receive DoH response body")?;

        let response = Response::try_from_http_response(http::Response::from_parts(
            parts,
            body.to_bytes(),
        ))
        .context("Upstream returned an invalid DoH response")?;

        self.clients.lock().await.insert(key, client);

        // DoH queries go out with id 0; restore the client's id.
        Ok(response.with_id(query.id()))
    }
}

async fn connect(url: &DohUrl, tls_config: Arc<rustls::ClientConfig>) -> Result<SendRequest> {
    let host = url.host().into_owned();
    let port = url.port();

    let addresses = tokio::net::lookup_host((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to resolve DoH host '{host}'"))?;

    let mut last_error = anyhow::anyhow!("'{host}' resolved to no addresses");

    for address in addresses {
        match connect_one(address, &host, tls_config.clone()).await {
            Ok(client) => {
                tracing::debug!(%address, %host, "Created new HTTP2 connection");

                return Ok(client);
            }
            Err(e) => {
                tracing::debug!(%address, %host, "Failed to create HTTP2 client: {e:#}");
                last_error = e;
            }
        }
    }

    Err(last_error.context(format!("Failed to connect to '{host}'")))
}

async fn connect_one(
    address: SocketAddr,
    host: &str,
    tls_config: Arc<rustls::ClientConfig>,
) -> Result<SendRequest> {
    let stream = TcpStream::connect(address)
        .await
        .context("Failed to connect TCP stream")?;

    let connector = TlsConnector::from(tls_config);
    let server_name = ServerName::try_from(host.to_owned()).context("Invalid TLS server name")?;

    let stream = connector
        .connect(server_name, stream)
        .await
        .context("TLS handshake failed")?;

    let mut builder =
        hyper::client::conn::http2::Builder::new(hyper_util::rt::TokioExecutor::new());
    builder.timer(hyper_util::rt::TokioTimer::default());
    builder.keep_alive_while_idle(true);
    builder.keep_alive_interval(Some(Duration::from_secs(5)));

    let (client, connection) = builder
        .handshake(hyper_util::rt::TokioIo::new(stream))
        .await
        .context("Failed to handshake HTTP2 connection")?;

    tokio::spawn({
        let host = host.to_owned();

        async move {
            match connection.await.context("HTTP2 connection failed") {
                Ok(()) => tracing::debug!(%host, "HTTP2 connection finished"),
                Err(e) => tracing::debug!(%host, "{e:#}"),
            }
        }
    });

    Ok(client)
}

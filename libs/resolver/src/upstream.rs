//! Upstream resolver transports.
//!
//! One strategy per transport; each turns a DNS query into a reply against a
//! single upstream server. Retry logic across upstreams lives in the chain,
//! not here; the only in-strategy retry is UDP falling back to TCP when the
//! reply comes back truncated.

pub mod doh;
pub mod dot;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use anyhow::{Context as _, Result, bail};
use dns_types::{DohUrl, Query, Response};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

pub const DNS_PORT: u16 = 53;
pub const DOT_PORT: u16 = 853;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
    Dot,
    Doh,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => "udp".fmt(f),
            Transport::Tcp => "tcp".fmt(f),
            Transport::Dot => "dot".fmt(f),
            Transport::Doh => "doh".fmt(f),
        }
    }
}

/// A configured upstream resolver.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub name: String,
    pub transport: Transport,
    pub address: Address,
    /// Higher weight is tried first; weight 0 disables the upstream.
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Plain DNS over UDP or TCP.
    Socket(SocketAddr),
    /// DNS over TLS; the hostname doubles as the SNI.
    Tls { host: String, port: u16 },
    /// DNS over HTTPS.
    Https(DohUrl),
}

impl Address {
    /// Parses the config `address` field for the given transport.
    ///
    /// Plain transports take `ip` or `ip:port` (default 53), DoT takes
    /// `hostname[:port]` (default 853), DoH takes an `https://` URL.
    pub fn parse(transport: Transport, raw: &str) -> Result<Self> {
        let raw = raw.trim();

        match transport {
            Transport::Udp | Transport::Tcp => {
                let addr = if let Ok(addr) = SocketAddr::from_str(raw) {
                    addr
                } else {
                    let ip = IpAddr::from_str(raw)
                        .with_context(|| format!("'{raw}' is not an IP address or socket address"))?;

                    SocketAddr::new(ip, DNS_PORT)
                };

                Ok(Address::Socket(addr))
            }
            Transport::Dot => {
                let (host, port) = match raw.rsplit_once(':') {
                    Some((host, port)) if !host.contains(':') => (
                        host,
                        port.parse::<u16>()
                            .with_context(|| format!("'{port}' is not a port number"))?,
                    ),
                    _ => (raw, DOT_PORT),
                };

                if host.is_empty() {
                    bail!("DoT address '{raw}' has no hostname");
                }

                // TLS needs a name to verify the certificate against.
                if IpAddr::from_str(host).is_ok() {
                    bail!("DoT upstreams require a hostname for certificate verification, got '{host}'");
                }

                Ok(Address::Tls {
                    host: host.to_owned(),
                    port,
                })
            }
            Transport::Doh => {
                let url = raw
                    .parse::<DohUrl>()
                    .with_context(|| format!("'{raw}' is not a DoH URL"))?;

                Ok(Address::Https(url))
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => addr.fmt(f),
            Address::Tls { host, port } => write!(f, "{host}:{port}"),
            Address::Https(url) => url.fmt(f),
        }
    }
}

/// Writes a length-prefixed DNS query and reads one length-prefixed reply,
/// the framing shared by DNS over TCP and DNS over TLS.
pub(crate) async fn exchange_framed<S>(stream: &mut S, query: &Query) -> Result<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = query.as_bytes();
    let len = u16::try_from(payload.len()).context("DNS query exceeds 16-bit length prefix")?;

    stream
        .write_all(&len.to_be_bytes())
        .await
        .context("Failed to write length prefix")?;
    stream
        .write_all(payload)
        .await
        .context("Failed to write DNS query")?;

    let mut len = [0u8; 2];
    stream
        .read_exact(&mut len)
        .await
        .context("Failed to read length prefix")?;

    let mut buffer = vec![0u8; u16::from_be_bytes(len) as usize];
    stream
        .read_exact(&mut buffer)
        .await
        .context("Failed to read DNS reply")?;

    let response = Response::parse(&buffer).context("Failed to parse DNS reply")?;

    if response.id() != query.id() {
        bail!(
            "Reply id {} does not match query id {}",
            response.id(),
            query.id()
        );
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_address_defaults_to_port_53() {
        let address = Address::parse(Transport::Udp, "1.1.1.1").unwrap();

        assert_eq!(
            address,
            Address::Socket(SocketAddr::from(([1, 1, 1, 1], 53)))
        );
    }

    #[test]
    fn plain_address_keeps_explicit_port() {
        let address = Address::parse(Transport::Tcp, "9.9.9.9:5353").unwrap();

        assert_eq!(
            address,
            Address::Socket(SocketAddr::from(([9, 9, 9, 9], 5353)))
        );
    }

    #[test]
    fn dot_address_defaults_to_port_853() {
        let address = Address::parse(Transport::Dot, "dns.quad9.net").unwrap();

        assert_eq!(
            address,
            Address::Tls {
                host: "dns.quad9.net".to_owned(),
                port: 853
            }
        );
    }

    #[test]
    fn dot_address_requires_hostname() {
        assert!(Address::parse(Transport::Dot, "9.9.9.9").is_err());
    }

    #[test]
    fn doh_address_must_be_https_url() {
        assert!(Address::parse(Transport::Doh, "https://dns.example/dns-query").is_ok());
        assert!(Address::parse(Transport::Doh, "dns.example").is_err());
    }
}

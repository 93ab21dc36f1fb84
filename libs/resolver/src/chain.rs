//! Weight-ordered failover across the configured upstreams.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dns_types::{Query, Response, ResponseCode};

use crate::upstream::{Address, Transport, Upstream, doh::DohStrategy, dot::DotStrategy, tcp::TcpStrategy, udp::UdpStrategy};
use crate::{QueryCtx, Resolve, Resolved, Source};

/// Tries upstreams in weight-descending order until one produces an answer.
///
/// Ties keep config order. Every upstream is tried at most once per query;
/// there is no backoff within a query.
#[derive(Default)]
pub struct ChainResolver {
    udp: UdpStrategy,
    tcp: TcpStrategy,
    dot: DotStrategy,
    doh: DohStrategy,
}

impl ChainResolver {
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolve_one(&self, upstream: &Upstream, query: &Query) -> Result<Response> {
        match (&upstream.address, upstream.transport) {
            (Address::Socket(addr), Transport::Udp) => {
                self.udp.resolve(*addr, query, &self.tcp).await
            }
            (Address::Socket(addr), Transport::Tcp) => self.tcp.resolve(*addr, query).await,
            (Address::Tls { host, port }, Transport::Dot) => {
                self.dot.resolve(host, *port, query).await
            }
            (Address::Https(url), Transport::Doh) => self.doh.resolve(url, query).await,
            (address, transport) => Err(anyhow!(
                "Upstream '{}' pairs transport {transport} with address {address}",
                upstream.name
            )),
        }
    }
}

#[async_trait]
impl Resolve for ChainResolver {
    async fn resolve(&self, query: &Query, ctx: &QueryCtx) -> Result<Resolved> {
        let mut candidates = ctx
            .snapshot
            .upstreams
            .iter()
            .filter(|upstream| upstream.weight > 0)
            .collect::<Vec<_>>();

        // Stable sort, so equal weights keep their config order.
        candidates.sort_by_key(|upstream| std::cmp::Reverse(upstream.weight));

        if candidates.is_empty() {
            anyhow::bail!("No enabled upstreams configured");
        }

        let mut last_error = None;

        for upstream in candidates {
            match self.resolve_one(upstream, query).await {
                Ok(response) if falls_through(&response) => {
                    tracing::debug!(upstream = %upstream.name, domain = %query.domain(), "SERVFAIL without records, trying next upstream");

                    last_error = Some(anyhow!(
                        "Upstream '{}' answered SERVFAIL without records",
                        upstream.name
                    ));
                }
                Ok(response) => {
                    return Ok(Resolved {
                        response: response.with_id(query.id()),
                        source: Source::Upstream {
                            name: upstream.name.clone(),
                            transport: upstream.transport,
                        },
                    });
                }
                Err(e) => {
                    tracing::debug!(upstream = %upstream.name, domain = %query.domain(), "Upstream failed: {e:#}");

                    last_error =
                        Some(e.context(format!("Upstream '{}' failed", upstream.name)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("No upstream produced a result")))
    }
}

/// A SERVFAIL falls through to the next upstream unless it carries records;
/// an authoritative SERVFAIL with an SOA is an answer, not an outage.
fn falls_through(response: &Response) -> bool {
    response.response_code() == ResponseCode::SERVFAIL && !response.carries_records()
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use dns_types::{DomainName, Query, RecordType, ResponseBuilder, Ttl, records};

    use super::*;
    use crate::Snapshot;
    use crate::upstream::{Address, Transport, Upstream};

    #[tokio::test]
    async fn zero_weight_upstreams_are_never_contacted() {
        let chain = ChainResolver::new();

        // The address is unroutable on purpose; a weight of 0 means the
        // chain must error out before ever dialling it.
        let ctx = ctx_with_upstreams(vec![Upstream {
            name: "disabled".to_owned(),
            transport: Transport::Udp,
            address: Address::Socket("192.0.2.1:53".parse::<SocketAddr>().unwrap()),
            weight: 0,
        }]);

        let query = Query::new(name("example.com"), RecordType::A);

        let result = chain.resolve(&query, &ctx).await;

        assert!(result.is_err());
    }

    #[test]
    fn bare_servfail_falls_through_but_one_with_records_does_not() {
        let query = Query::new(name("example.com"), RecordType::A);

        let bare = ResponseBuilder::for_query(&query, ResponseCode::SERVFAIL).build();
        let with_soa = ResponseBuilder::for_query(&query, ResponseCode::SERVFAIL)
            .build_with_authority(std::iter::once((
                name("com"),
                300,
                records::soa(name("ns1.com"), name("admin.com"), Ttl::from_secs(60)),
            )));

        assert!(falls_through(&bare));
        assert!(!falls_through(&with_soa));
    }

    #[test]
    fn nxdomain_never_falls_through() {
        let query = Query::new(name("example.com"), RecordType::A);

        let nxdomain = ResponseBuilder::for_query(&query, ResponseCode::NXDOMAIN).build();

        assert!(!falls_through(&nxdomain));
    }

    fn ctx_with_upstreams(upstreams: Vec<Upstream>) -> QueryCtx {
        QueryCtx {
            client: "127.0.0.1:50000".parse::<SocketAddr>().unwrap(),
            snapshot: Arc::new(Snapshot {
                upstreams,
                ..Snapshot::default()
            }),
        }
    }

    fn name(domain: &str) -> DomainName {
        DomainName::vec_from_str(domain).unwrap()
    }
}

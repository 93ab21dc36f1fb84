//! Static host overrides, answered locally instead of being forwarded.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::Result;
use async_trait::async_trait;
use dns_types::{DomainName, Query, RecordType, ResponseBuilder, ResponseCode, records};

use crate::{QueryCtx, Resolve, Resolved, Source};

pub const DEFAULT_TTL: u32 = 60;

#[derive(Debug, Clone)]
pub struct HostOverride {
    pub name: DomainName,
    pub a: Vec<Ipv4Addr>,
    pub aaaa: Vec<Ipv6Addr>,
    pub ttl: u32,
}

/// All host overrides of one config snapshot.
#[derive(Debug, Clone, Default)]
pub struct HostsTable {
    entries: HashMap<DomainName, HostOverride>,
}

impl HostsTable {
    pub fn new(overrides: impl IntoIterator<Item = HostOverride>) -> Self {
        Self {
            entries: overrides
                .into_iter()
                .map(|entry| (entry.name.clone(), entry))
                .collect(),
        }
    }

    pub fn get(&self, name: &DomainName) -> Option<&HostOverride> {
        self.entries.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Answers queries for overridden names; everything else passes through.
pub struct HostsResolver<R> {
    inner: R,
}

impl<R> HostsResolver<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R> Resolve for HostsResolver<R>
where
    R: Resolve,
{
    async fn resolve(&self, query: &Query, ctx: &QueryCtx) -> Result<Resolved> {
        let domain = query.domain();

        let Some(entry) = ctx.snapshot.hosts.get(&domain) else {
            return self.inner.resolve(query, ctx).await;
        };

        // Only address queries are answered from the table. A known name with
        // no address of the requested family yields NODATA rather than a
        // referral upstream, which would contradict the override.
        let addresses = match query.qtype() {
            RecordType::A => entry.a.iter().copied().map(records::a).collect::<Vec<_>>(),
            RecordType::AAAA => entry
                .aaaa
                .iter()
                .copied()
                .map(records::aaaa)
                .collect::<Vec<_>>(),
            _ => return self.inner.resolve(query, ctx).await,
        };

        tracing::trace!(%domain, qtype = %query.qtype(), count = addresses.len(), "Answering from hosts table");

        let response = ResponseBuilder::for_query(query, ResponseCode::NOERROR)
            .authoritative()
            .with_records(
                addresses
                    .into_iter()
                    .map(|rdata| (domain.clone(), entry.ttl, rdata)),
            )
            .build();

        Ok(Resolved {
            response,
            source: Source::Hosts,
        })
    }
}

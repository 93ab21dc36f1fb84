//! The layered resolver pipeline.
//!
//! A query travels metrics → cache → mark → hosts → chain. Each layer is a
//! concrete type owning the next, monomorphized all the way down; only the
//! assembled stack is published as a trait object so the admin surface can
//! hold "the active resolver" without knowing its shape.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod cache;
pub mod chain;
pub mod history;
pub mod hosts;
pub mod mark;
pub mod metrics;
pub mod rules;
pub mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dns_types::Query;
use steer::Steering;

use cache::{Cache, CacheResolver};
use chain::ChainResolver;
use history::History;
use hosts::{HostsResolver, HostsTable};
use mark::MarkResolver;
use metrics::MetricsResolver;
use rules::RuleSet;
use upstream::{Transport, Upstream};

/// One layer of the resolver pipeline.
#[async_trait]
pub trait Resolve: Send + Sync + 'static {
    async fn resolve(&self, query: &Query, ctx: &QueryCtx) -> Result<Resolved>;
}

/// Per-query context: the client and the config snapshot captured at ingress.
///
/// The snapshot is pinned for the query's whole lifetime, so a concurrent
/// config swap can never show a query a mix of old and new state.
#[derive(Clone)]
pub struct QueryCtx {
    pub client: SocketAddr,
    pub snapshot: Arc<Snapshot>,
}

/// The parts of the configuration the pipeline reads per query.
#[derive(Clone)]
pub struct Snapshot {
    pub rules: RuleSet,
    pub hosts: HostsTable,
    pub upstreams: Vec<Upstream>,
    pub cache_enabled: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            rules: RuleSet::default(),
            hosts: HostsTable::default(),
            upstreams: Vec::new(),
            cache_enabled: true,
        }
    }
}

#[derive(Clone)]
pub struct Resolved {
    pub response: dns_types::Response,
    pub source: Source,
}

/// Where an answer came from, for metrics and history labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Cache,
    Hosts,
    Upstream { name: String, transport: Transport },
}

impl Source {
    pub fn label(&self) -> String {
        match self {
            Source::Cache => "cache".to_owned(),
            Source::Hosts => "hosts".to_owned(),
            Source::Upstream { name, transport } => format!("{transport}:{name}"),
        }
    }
}

/// Assembles the full pipeline around the given shared components.
pub fn pipeline(
    cache: Arc<Cache>,
    backend: Arc<dyn Steering>,
    history: Arc<History>,
    deadline: Duration,
) -> Arc<dyn Resolve> {
    opentelemetry::global::meter("outway")
        .u64_observable_gauge("dns.cache.size")
        .with_description("The number of entries in the response cache.")
        .with_callback({
            let cache = cache.clone();

            move |observer| observer.observe(cache.len() as u64, &[])
        })
        .build();

    let chain = ChainResolver::new();
    let hosts = HostsResolver::new(chain);
    let mark = MarkResolver::new(hosts, backend);
    let cached = CacheResolver::new(mark, cache);
    let metrics = MetricsResolver::new(cached, history, deadline);

    Arc::new(metrics)
}

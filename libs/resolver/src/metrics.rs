//! Outermost pipeline layer: counters, latency and the query history feed.
//!
//! This layer also owns the per-query deadline, so that a query which times
//! out deep in the pipeline is still counted and still lands in the history
//! ring.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dns_types::{Query, ResponseCode};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram};

use crate::history::{History, QueryEvent, Status};
use crate::{QueryCtx, Resolve, Resolved};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(8);

pub struct MetricsResolver<R> {
    inner: R,
    history: Arc<History>,
    deadline: Duration,

    queries: Counter<u64>,
    qtypes: Counter<u64>,
    duration: Histogram<f64>,
}

impl<R> MetricsResolver<R> {
    pub fn new(inner: R, history: Arc<History>, deadline: Duration) -> Self {
        let meter = opentelemetry::global::meter("outway");

        Self {
            inner,
            history,
            deadline,
            queries: meter
                .u64_counter("dns.queries")
                .with_description("The number of handled DNS queries.")
                .build(),
            qtypes: meter
                .u64_counter("dns.queries.by_type")
                .with_description("The number of handled DNS queries per query type.")
                .build(),
            duration: meter
                .f64_histogram("dns.query.duration")
                .with_description("End-to-end duration of DNS queries.")
                .with_unit("s")
                .build(),
        }
    }
}

#[async_trait]
impl<R> Resolve for MetricsResolver<R>
where
    R: Resolve,
{
    async fn resolve(&self, query: &Query, ctx: &QueryCtx) -> Result<Resolved> {
        let started = Instant::now();

        let result = tokio::time::timeout(self.deadline, self.inner.resolve(query, ctx)).await;

        let elapsed = started.elapsed();

        let (status, rcode, answers, source) = match &result {
            Ok(Ok(resolved)) => {
                let rcode = resolved.response.response_code();
                let status = match rcode {
                    ResponseCode::REFUSED => Status::Refused,
                    _ => Status::Ok,
                };

                (
                    status,
                    Some(rcode),
                    resolved.response.answer_count(),
                    Some(resolved.source.label()),
                )
            }
            Ok(Err(_)) => (Status::Servfail, None, 0, None),
            Err(_) => (Status::Timeout, None, 0, None),
        };

        let source_label = source.clone().unwrap_or_else(|| "none".to_owned());
        let rcode_label = rcode
            .map(|rcode| rcode.to_string())
            .unwrap_or_else(|| "error".to_owned());

        self.queries.add(
            1,
            &[
                KeyValue::new("dns.rcode", rcode_label),
                KeyValue::new("dns.source", source_label),
            ],
        );
        self.qtypes.add(
            1,
            &[KeyValue::new("dns.qtype", query.qtype().to_string())],
        );
        self.duration.record(elapsed.as_secs_f64(), &[]);

        self.history.push(QueryEvent {
            seq: 0, // Assigned by the ring.
            time: SystemTime::now(),
            client: ctx.client,
            qname: query.domain().to_string(),
            qtype: query.qtype().to_string(),
            rcode: rcode.map(|rcode| rcode.to_string()),
            answers,
            source,
            duration: elapsed,
            status,
        });

        match result {
            Ok(inner) => inner,
            Err(_) => Err(anyhow!(
                "Query for {} exceeded the {:?} deadline",
                query.domain(),
                self.deadline
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use dns_types::{DomainName, RecordType, Response};

    use super::*;
    use crate::{Snapshot, Source};

    #[tokio::test]
    async fn timed_out_query_is_recorded_in_history() {
        let history = Arc::new(History::default());
        let resolver =
            MetricsResolver::new(Stall, history.clone(), Duration::from_millis(50));

        let query = Query::new(name("slow.test"), RecordType::A);

        let result = resolver.resolve(&query, &ctx()).await;

        assert!(result.is_err());

        let events = history.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, Status::Timeout);
        assert_eq!(events[0].qname, "slow.test");
    }

    #[tokio::test]
    async fn successful_query_records_source_and_rcode() {
        let history = Arc::new(History::default());
        let resolver = MetricsResolver::new(Hosts, history.clone(), DEFAULT_DEADLINE);

        let query = Query::new(name("printer.lan"), RecordType::A);

        resolver.resolve(&query, &ctx()).await.unwrap();

        let events = history.snapshot();
        assert_eq!(events[0].status, Status::Ok);
        assert_eq!(events[0].source.as_deref(), Some("hosts"));
        assert_eq!(events[0].rcode.as_deref(), Some("NOERROR"));
    }

    #[tokio::test]
    async fn failed_query_is_recorded_as_servfail() {
        let history = Arc::new(History::default());
        let resolver = MetricsResolver::new(Fail, history.clone(), DEFAULT_DEADLINE);

        let query = Query::new(name("down.test"), RecordType::A);

        let result = resolver.resolve(&query, &ctx()).await;

        assert!(result.is_err());
        assert_eq!(history.snapshot()[0].status, Status::Servfail);
    }

    struct Stall;

    #[async_trait]
    impl Resolve for Stall {
        async fn resolve(&self, _: &Query, _: &QueryCtx) -> Result<Resolved> {
            tokio::time::sleep(Duration::from_secs(60)).await;

            anyhow::bail!("unreachable")
        }
    }

    struct Hosts;

    #[async_trait]
    impl Resolve for Hosts {
        async fn resolve(&self, query: &Query, _: &QueryCtx) -> Result<Resolved> {
            Ok(Resolved {
                response: Response::no_error(query),
                source: Source::Hosts,
            })
        }
    }

    struct Fail;

    #[async_trait]
    impl Resolve for Fail {
        async fn resolve(&self, _: &Query, _: &QueryCtx) -> Result<Resolved> {
            anyhow::bail!("all upstreams failed")
        }
    }

    fn ctx() -> QueryCtx {
        QueryCtx {
            client: "127.0.0.1:50000".parse::<SocketAddr>().unwrap(),
            snapshot: Arc::new(Snapshot::default()),
        }
    }

    fn name(domain: &str) -> DomainName {
        DomainName::vec_from_str(domain).unwrap()
    }
}

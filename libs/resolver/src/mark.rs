//! Harvests answered addresses into the packet-steering backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dns_types::{Query, Ttl, records};
use futures::StreamExt as _;
use steer::Steering;

use crate::{QueryCtx, Resolve, Resolved};

/// How many backend calls may run at once per query.
const FAN_OUT: usize = 8;

/// Steering TTL floor when a rule pins it.
const PIN_FLOOR: Duration = Duration::from_secs(300);

/// Marks the A/AAAA answers of rule-matching queries for steering.
///
/// Backend failures are logged and swallowed; a broken route table must not
/// turn into a DNS outage.
pub struct MarkResolver<R> {
    inner: R,
    backend: Arc<dyn Steering>,
}

impl<R> MarkResolver<R> {
    pub fn new(inner: R, backend: Arc<dyn Steering>) -> Self {
        Self { inner, backend }
    }
}

#[async_trait]
impl<R> Resolve for MarkResolver<R>
where
    R: Resolve,
{
    async fn resolve(&self, query: &Query, ctx: &QueryCtx) -> Result<Resolved> {
        let resolved = self.inner.resolve(query, ctx).await?;

        let domain = query.domain();

        let Some(rule) = ctx.snapshot.rules.matching(&domain) else {
            return Ok(resolved);
        };

        // Terminal A/AAAA records only; CNAMEs in the chain carry no address.
        let marks = resolved
            .response
            .records()
            .filter_map(records::extract_ip_with_ttl)
            .map(|(ip, rr_ttl)| (ip, steering_ttl(rule.pin_ttl, rr_ttl)))
            .collect::<Vec<_>>();

        if marks.is_empty() {
            return Ok(resolved);
        }

        tracing::debug!(%domain, via = %rule.via, count = marks.len(), "Steering answered addresses");

        futures::stream::iter(marks)
            .for_each_concurrent(FAN_OUT, |(ip, ttl)| {
                let backend = self.backend.clone();
                let via = rule.via.clone();

                async move {
                    if let Err(e) = backend.mark_ip(&via, ip, ttl).await {
                        tracing::warn!(iface = %via, %ip, "Failed to steer address: {e:#}");
                    }
                }
            })
            .await;

        Ok(resolved)
    }
}

fn steering_ttl(pin: bool, rr_ttl: Ttl) -> Duration {
    let rr_ttl = rr_ttl.into_duration();

    if pin {
        rr_ttl.max(PIN_FLOOR)
    } else {
        rr_ttl.clamp(steer::MIN_TTL, steer::MAX_TTL)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Mutex;

    use dns_types::{DomainName, RecordType, ResponseBuilder, ResponseCode};

    use super::*;
    use crate::rules::{Pattern, Rule, RuleSet};
    use crate::upstream::Transport;
    use crate::{Snapshot, Source};

    #[tokio::test]
    async fn matching_query_marks_each_answer_once() {
        let (backend, calls) = RecordingBackend::new();
        let resolver = MarkResolver::new(
            StubInner {
                ttl: 120,
                ips: vec![Ipv4Addr::new(10, 0, 0, 7)],
            },
            backend,
        );

        let query = Query::new(name("api.vpn.test"), RecordType::A);

        let resolved = resolver
            .resolve(&query, &ctx_with_rule("*.vpn.test", "tun0", false))
            .await
            .unwrap();

        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &[(
                "tun0".to_owned(),
                IpAddr::from(Ipv4Addr::new(10, 0, 0, 7)),
                Duration::from_secs(120)
            )]
        );
        assert_eq!(resolved.response.records().count(), 1); // Reply is untouched.
    }

    #[tokio::test]
    async fn non_matching_query_never_touches_the_backend() {
        let (backend, calls) = RecordingBackend::new();
        let resolver = MarkResolver::new(
            StubInner {
                ttl: 120,
                ips: vec![Ipv4Addr::new(10, 0, 0, 7)],
            },
            backend,
        );

        let query = Query::new(name("example.com"), RecordType::A);

        resolver
            .resolve(&query, &ctx_with_rule("*.vpn.test", "tun0", false))
            .await
            .unwrap();

        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pin_ttl_floors_the_steering_ttl() {
        let (backend, calls) = RecordingBackend::new();
        let resolver = MarkResolver::new(
            StubInner {
                ttl: 60,
                ips: vec![Ipv4Addr::new(10, 0, 0, 7)],
            },
            backend,
        );

        let query = Query::new(name("api.vpn.test"), RecordType::A);

        resolver
            .resolve(&query, &ctx_with_rule("*.vpn.test", "tun0", true))
            .await
            .unwrap();

        assert_eq!(calls.lock().unwrap()[0].2, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn backend_failure_does_not_fail_the_query() {
        let resolver = MarkResolver::new(
            StubInner {
                ttl: 120,
                ips: vec![Ipv4Addr::new(10, 0, 0, 7)],
            },
            Arc::new(FailingBackend),
        );

        let query = Query::new(name("api.vpn.test"), RecordType::A);

        let result = resolver
            .resolve(&query, &ctx_with_rule("*.vpn.test", "tun0", false))
            .await;

        assert!(result.is_ok());
    }

    #[test]
    fn unpinned_ttl_is_clamped_to_backend_bounds() {
        assert_eq!(
            steering_ttl(false, Ttl::from_secs(5)),
            Duration::from_secs(30)
        );
        assert_eq!(
            steering_ttl(false, Ttl::from_secs(86_400)),
            Duration::from_secs(3600)
        );
        assert_eq!(
            steering_ttl(true, Ttl::from_secs(86_400)),
            Duration::from_secs(86_400)
        );
    }

    struct StubInner {
        ttl: u32,
        ips: Vec<Ipv4Addr>,
    }

    #[async_trait]
    impl Resolve for StubInner {
        async fn resolve(&self, query: &Query, _: &QueryCtx) -> Result<Resolved> {
            let domain = query.domain();

            let response = ResponseBuilder::for_query(query, ResponseCode::NOERROR)
                .with_records(
                    self.ips
                        .iter()
                        .map(|ip| (domain.clone(), self.ttl, records::a(*ip))),
                )
                .build();

            Ok(Resolved {
                response,
                source: Source::Upstream {
                    name: "stub".to_owned(),
                    transport: Transport::Udp,
                },
            })
        }
    }

    struct RecordingBackend {
        calls: Arc<Mutex<Vec<(String, IpAddr, Duration)>>>,
    }

    impl RecordingBackend {
        fn new() -> (Arc<Self>, Arc<Mutex<Vec<(String, IpAddr, Duration)>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));

            (
                Arc::new(Self {
                    calls: calls.clone(),
                }),
                calls,
            )
        }
    }

    #[async_trait]
    impl Steering for RecordingBackend {
        async fn mark_ip(&self, iface: &str, ip: IpAddr, ttl: Duration) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((iface.to_owned(), ip, ttl));

            Ok(())
        }

        async fn cleanup_all(&self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl Steering for FailingBackend {
        async fn mark_ip(&self, _: &str, _: IpAddr, _: Duration) -> Result<()> {
            anyhow::bail!("netlink unavailable")
        }

        async fn cleanup_all(&self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn ctx_with_rule(pattern: &str, via: &str, pin_ttl: bool) -> QueryCtx {
        QueryCtx {
            client: "127.0.0.1:50000".parse::<SocketAddr>().unwrap(),
            snapshot: Arc::new(Snapshot {
                rules: RuleSet::new(vec![Rule {
                    pattern: Pattern::parse(pattern).unwrap(),
                    via: via.to_owned(),
                    pin_ttl,
                }]),
                ..Snapshot::default()
            }),
        }
    }

    fn name(domain: &str) -> DomainName {
        DomainName::vec_from_str(domain).unwrap()
    }
}

//! Positive/negative response cache with single-flight coalescing.
//!
//! Entries are keyed by `(qname, qtype)` and bounded both by TTL and an LRU
//! capacity. Concurrent misses on the same key share one upstream fetch; the
//! fetch is detached from its initiator, so an impatient client cannot
//! starve the other waiters (or the cache) of the result.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, anyhow};
use async_trait::async_trait;
use dns_types::{DomainName, Query, RecordType, Response, ResponseCode, Ttl};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{QueryCtx, Resolve, Resolved, Source};

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

const POSITIVE_FLOOR: Duration = Duration::from_secs(5);
const POSITIVE_CEILING: Duration = Duration::from_secs(86_400);
const NEGATIVE_FLOOR: Duration = Duration::from_secs(5);
const NEGATIVE_CEILING: Duration = Duration::from_secs(300);
const NEGATIVE_DEFAULT: Duration = Duration::from_secs(60);

pub type CacheKey = (DomainName, RecordType);

#[derive(Debug)]
struct Entry {
    response: Response,
    stored_at: Instant,
    expires_at: Instant,
}

/// A cache lookup result: the stored response plus its remaining lifetime.
pub struct Hit {
    pub response: Response,
    pub expires_at: Instant,
}

pub struct Cache {
    entries: Mutex<LruCache<CacheKey, Entry>>,
    subscribers: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl Cache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity(max_entries))),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_capacity(&self, max_entries: usize) {
        self.entries.lock().resize(capacity(max_entries));
    }

    /// Registers a listener invoked after every cache mutation.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.subscribers.lock().push(Box::new(listener));
    }

    pub fn get(&self, key: &CacheKey, now: Instant) -> Option<Hit> {
        let mut entries = self.entries.lock();

        let entry = entries.get(key)?;

        if entry.expires_at <= now {
            entries.pop(key);

            return None;
        }

        Some(Hit {
            response: entry.response.clone(),
            expires_at: entry.expires_at,
        })
    }

    /// Stores a response if it is cacheable; returns the stored lifetime.
    pub fn put(&self, key: CacheKey, response: &Response, now: Instant) -> Option<Duration> {
        let ttl = storage_ttl(response)?;

        self.entries.lock().put(
            key,
            Entry {
                response: response.clone(),
                stored_at: now,
                expires_at: now + ttl,
            },
        );
        self.notify();

        Some(ttl)
    }

    /// Removes entries for `name`; `qtype` 0 clears all types.
    pub fn delete(&self, name: &DomainName, qtype: u16) -> usize {
        let removed = {
            let mut entries = self.entries.lock();

            let doomed = entries
                .iter()
                .filter(|((entry_name, entry_type), _)| {
                    entry_name == name && (qtype == 0 || entry_type.to_int() == qtype)
                })
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();

            for key in &doomed {
                entries.pop(key);
            }

            doomed.len()
        };

        if removed > 0 {
            self.notify();
        }

        removed
    }

    /// Removes one entry by its raw key as rendered in [`Cache::list`].
    pub fn delete_key(&self, raw_key: &str) -> Result<bool> {
        let (name, qtype) = raw_key
            .rsplit_once('/')
            .with_context(|| format!("Malformed cache key '{raw_key}'"))?;

        let name = DomainName::vec_from_str(name)
            .map_err(|_| anyhow!("Malformed domain in cache key '{raw_key}'"))?;
        let qtype = qtype
            .parse::<u16>()
            .with_context(|| format!("Malformed qtype in cache key '{raw_key}'"))?;

        let removed = self
            .entries
            .lock()
            .pop(&(name, RecordType::from_int(qtype)))
            .is_some();

        if removed {
            self.notify();
        }

        Ok(removed)
    }

    pub fn flush(&self) -> usize {
        let mut entries = self.entries.lock();
        let flushed = entries.len();
        entries.clear();
        drop(entries);

        self.notify();

        flushed
    }

    /// Drops entries that outlived their TTL. Expiry is otherwise lazy on
    /// [`Cache::get`], so a periodic sweep keeps unqueried keys from
    /// lingering until LRU pressure gets to them.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let removed = {
            let mut entries = self.entries.lock();

            let doomed = entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();

            for key in &doomed {
                entries.pop(key);
            }

            doomed.len()
        };

        if removed > 0 {
            self.notify();
        }

        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn list(&self, query: &ListQuery, now: Instant) -> (Vec<CacheItem>, usize) {
        let mut items = self
            .entries
            .lock()
            .iter()
            .map(|((name, qtype), entry)| CacheItem {
                key: format!("{name}/{}", qtype.to_int()),
                name: name.to_string(),
                qtype: qtype.to_string(),
                rcode: entry.response.response_code().to_string(),
                answers: entry.response.answer_count(),
                expires_in: entry.expires_at.saturating_duration_since(now),
                stored_ago: now.saturating_duration_since(entry.stored_at),
            })
            .filter(|item| match &query.filter {
                Some(filter) => item.name.contains(filter.as_str()),
                None => true,
            })
            .collect::<Vec<_>>();

        items.sort_by(|a, b| {
            let ordering = match query.sort_by {
                SortBy::Name => a.name.cmp(&b.name),
                SortBy::Expires => a.expires_in.cmp(&b.expires_in),
                SortBy::Type => a.qtype.cmp(&b.qtype).then_with(|| a.name.cmp(&b.name)),
            };

            match query.order {
                Order::Asc => ordering,
                Order::Desc => ordering.reverse(),
            }
        });

        let total = items.len();
        let items = items
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect();

        (items, total)
    }

    fn notify(&self) {
        for listener in self.subscribers.lock().iter() {
            listener();
        }
    }
}

fn capacity(max_entries: usize) -> NonZeroUsize {
    NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN)
}

/// How long a response may be cached, or `None` if it must not be.
fn storage_ttl(response: &Response) -> Option<Duration> {
    if response.truncated() {
        return None;
    }

    let negative = || {
        let derived = response
            .negative_ttl()
            .map(|ttl| ttl.into_duration())
            .unwrap_or(NEGATIVE_DEFAULT);

        derived.clamp(NEGATIVE_FLOOR, NEGATIVE_CEILING)
    };

    match response.response_code() {
        ResponseCode::NXDOMAIN => Some(negative()),
        ResponseCode::NOERROR if response.answer_count() == 0 => Some(negative()),
        ResponseCode::NOERROR => {
            let min_ttl = response.min_ttl()?.into_duration();

            Some(min_ttl.clamp(POSITIVE_FLOOR, POSITIVE_CEILING))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheItem {
    pub key: String,
    pub name: String,
    pub qtype: String,
    pub rcode: String,
    pub answers: u16,
    pub expires_in: Duration,
    pub stored_ago: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default)]
    pub order: Order,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: default_limit(),
            filter: None,
            sort_by: SortBy::default(),
            order: Order::default(),
        }
    }
}

fn default_limit() -> usize {
    100
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Name,
    Expires,
    Type,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

type FetchResult = Result<Resolved, SharedError>;

/// An error shared verbatim with every waiter of a single-flight fetch.
#[derive(Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// The caching layer of the pipeline.
pub struct CacheResolver<R> {
    inner: Arc<R>,
    cache: Arc<Cache>,
    pending: Arc<Mutex<HashMap<CacheKey, watch::Receiver<Option<FetchResult>>>>>,
}

impl<R> CacheResolver<R> {
    pub fn new(inner: R, cache: Arc<Cache>) -> Self {
        Self {
            inner: Arc::new(inner),
            cache,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl<R> Resolve for CacheResolver<R>
where
    R: Resolve,
{
    async fn resolve(&self, query: &Query, ctx: &QueryCtx) -> Result<Resolved> {
        if !ctx.snapshot.cache_enabled {
            return self.inner.resolve(query, ctx).await;
        }

        let key = (query.domain(), query.qtype());
        let now = Instant::now();

        if let Some(hit) = self.cache.get(&key, now) {
            let remaining = hit.expires_at.saturating_duration_since(now);
            let ttl = Ttl::from_secs(remaining.as_secs().max(1) as u32);

            return Ok(Resolved {
                response: hit.response.for_serving(ttl, query.id()),
                source: Source::Cache,
            });
        }

        let mut receiver = {
            let mut pending = self.pending.lock();

            match pending.get(&key) {
                Some(receiver) => receiver.clone(),
                None => {
                    let (sender, receiver) = watch::channel(None);
                    pending.insert(key.clone(), receiver.clone());

                    // The fetch runs detached: waiters abandoning the query
                    // must not cancel it, the result still feeds the cache.
                    tokio::spawn(fetch(
                        self.inner.clone(),
                        self.cache.clone(),
                        self.pending.clone(),
                        sender,
                        key,
                        query.clone(),
                        ctx.clone(),
                    ));

                    receiver
                }
            }
        };

        let outcome = receiver
            .wait_for(Option::is_some)
            .await
            .map(|guard| guard.clone())
            .context("Fetch task died without publishing a result")?;

        match outcome {
            Some(Ok(resolved)) => Ok(Resolved {
                response: resolved.response.with_id(query.id()),
                source: resolved.source,
            }),
            Some(Err(shared)) => Err(anyhow!(shared)),
            None => Err(anyhow!("Fetch completed without a result")),
        }
    }
}

async fn fetch<R>(
    inner: Arc<R>,
    cache: Arc<Cache>,
    pending: Arc<Mutex<HashMap<CacheKey, watch::Receiver<Option<FetchResult>>>>>,
    sender: watch::Sender<Option<FetchResult>>,
    key: CacheKey,
    query: Query,
    ctx: QueryCtx,
) where
    R: Resolve,
{
    let outcome = match inner.resolve(&query, &ctx).await {
        Ok(resolved) => {
            cache.put(key.clone(), &resolved.response, Instant::now());

            Ok(resolved)
        }
        // Errors are shared with all waiters but never negatively cached.
        Err(e) => Err(SharedError(Arc::new(e))),
    };

    // Unregister before waking waiters so a late arrival starts a fresh
    // fetch (or hits the cache) instead of joining a finished one.
    pending.lock().remove(&key);

    let _ = sender.send(Some(outcome));
}

//! A bounded ring of recent query events for observability.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use ringbuffer::{AllocRingBuffer, RingBuffer as _};
use serde::Serialize;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct QueryEvent {
    /// Monotonic sequence number, so admin clients can page without duplicates.
    pub seq: u64,
    pub time: SystemTime,
    pub client: SocketAddr,
    pub qname: String,
    pub qtype: String,
    pub rcode: Option<String>,
    pub answers: u16,
    /// Where the answer came from: `cache`, `hosts` or an upstream label.
    pub source: Option<String>,
    pub duration: Duration,
    pub status: Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Servfail,
    Timeout,
    Refused,
}

pub struct History {
    inner: Mutex<Inner>,
}

struct Inner {
    ring: AllocRingBuffer<QueryEvent>,
    next_seq: u64,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: AllocRingBuffer::new(capacity.max(1)),
                next_seq: 0,
            }),
        }
    }

    /// Appends an event, assigning its sequence number. O(1).
    pub fn push(&self, mut event: QueryEvent) -> u64 {
        let mut inner = self.inner.lock();

        event.seq = inner.next_seq;
        inner.next_seq += 1;

        let seq = event.seq;
        inner.ring.enqueue(event);

        seq
    }

    /// All retained events, newest first.
    pub fn snapshot(&self) -> Vec<QueryEvent> {
        let inner = self.inner.lock();

        let mut events = inner.ring.iter().cloned().collect::<Vec<_>>();
        events.reverse();

        events
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_newest_first() {
        let history = History::new(8);

        for name in ["a.test", "b.test", "c.test"] {
            history.push(event(name));
        }

        let snapshot = history.snapshot();

        assert_eq!(snapshot[0].qname, "c.test");
        assert_eq!(snapshot[2].qname, "a.test");
    }

    #[test]
    fn ring_drops_oldest_when_full() {
        let history = History::new(2);

        for name in ["a.test", "b.test", "c.test"] {
            history.push(event(name));
        }

        let snapshot = history.snapshot();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].qname, "c.test");
        assert_eq!(snapshot[1].qname, "b.test");
    }

    #[test]
    fn sequence_numbers_survive_wrap_around() {
        let history = History::new(2);

        for _ in 0..5 {
            history.push(event("a.test"));
        }

        let snapshot = history.snapshot();

        assert_eq!(snapshot[0].seq, 4);
        assert_eq!(snapshot[1].seq, 3);
    }

    fn event(qname: &str) -> QueryEvent {
        QueryEvent {
            seq: 0,
            time: SystemTime::now(),
            client: "127.0.0.1:50000".parse().unwrap(),
            qname: qname.to_owned(),
            qtype: "A".to_owned(),
            rcode: Some("NOERROR".to_owned()),
            answers: 1,
            source: Some("cache".to_owned()),
            duration: Duration::from_millis(3),
            status: Status::Ok,
        }
    }
}

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Write-max book-keeping of mark lifetimes.
///
/// A mark may only ever extend the recorded expiry; shorter re-marks are
/// dropped so that a burst of low-TTL answers cannot shrink an existing
/// steering window.
#[derive(Debug)]
pub struct Ledger<K> {
    expiries: HashMap<K, Instant>,
}

impl<K> Default for Ledger<K> {
    fn default() -> Self {
        Self {
            expiries: HashMap::default(),
        }
    }
}

impl<K> Ledger<K>
where
    K: Eq + Hash + Clone,
{
    /// Records a mark of `ttl` starting at `now`.
    ///
    /// Returns the new expiry if the mark extends the recorded lifetime and
    /// the host state should be refreshed, `None` if the existing entry
    /// already outlives it.
    pub fn refresh(&mut self, key: K, ttl: Duration, now: Instant) -> Option<Instant> {
        let new_expiry = now + ttl;

        match self.expiries.get(&key) {
            Some(existing) if *existing >= new_expiry => None,
            Some(_) | None => {
                self.expiries.insert(key, new_expiry);

                Some(new_expiry)
            }
        }
    }

    pub fn forget(&mut self, key: &K) {
        self.expiries.remove(key);
    }

    pub fn drain(&mut self) -> Vec<K> {
        self.expiries.drain().map(|(key, _)| key).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.expiries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));

    #[test]
    fn first_mark_always_refreshes() {
        let mut ledger = Ledger::default();

        assert!(
            ledger
                .refresh(IP, Duration::from_secs(60), Instant::now())
                .is_some()
        );
    }

    #[test]
    fn shorter_remark_is_ignored() {
        let mut ledger = Ledger::default();
        let now = Instant::now();

        ledger.refresh(IP, Duration::from_secs(600), now);

        assert_eq!(ledger.refresh(IP, Duration::from_secs(60), now), None);
    }

    #[test]
    fn longer_remark_extends() {
        let mut ledger = Ledger::default();
        let now = Instant::now();

        ledger.refresh(IP, Duration::from_secs(60), now);

        assert_eq!(
            ledger.refresh(IP, Duration::from_secs(600), now),
            Some(now + Duration::from_secs(600))
        );
    }

    #[test]
    fn identical_remark_is_a_noop() {
        let mut ledger = Ledger::default();
        let now = Instant::now();

        ledger.refresh(IP, Duration::from_secs(60), now);

        assert_eq!(ledger.refresh(IP, Duration::from_secs(60), now), None);
    }

    #[test]
    fn remark_after_time_passed_refreshes() {
        let mut ledger = Ledger::default();
        let now = Instant::now();

        ledger.refresh(IP, Duration::from_secs(60), now);

        let later = now + Duration::from_secs(30);

        assert_eq!(
            ledger.refresh(IP, Duration::from_secs(60), later),
            Some(later + Duration::from_secs(60))
        );
    }

    #[test]
    fn drain_empties_the_ledger() {
        let mut ledger = Ledger::default();

        ledger.refresh(IP, Duration::from_secs(60), Instant::now());

        assert_eq!(ledger.drain(), vec![IP]);
        assert!(ledger.is_empty());
    }
}

//! Correlation id map
//!
//! The wire protocol only carries small unsigned integers, while bus callers
//! pick arbitrary string ids. This map binds the two for as long as a
//! command can still be acknowledged or deduplicated, then forgets it.

use crate::error::CommandError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Entries are swept in batches at most this often
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Binding {
    id: u32,
    bound_at: Instant,
}

#[derive(Debug)]
struct Inner {
    next_id: u32,
    by_cid: HashMap<String, Binding>,
    by_id: HashMap<u32, String>,
    last_sweep: Option<Instant>,
}

/// Bidirectional correlation id <-> controller id map
#[derive(Debug)]
pub struct CorrelationMap {
    retention: Duration,
    inner: Mutex<Inner>,
}

impl CorrelationMap {
    /// Create a map whose entries live for `retention` after binding
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            inner: Mutex::new(Inner {
                next_id: 1,
                by_cid: HashMap::new(),
                by_id: HashMap::new(),
                last_sweep: None,
            }),
        }
    }

    /// How long an entry is kept after binding
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Return the controller id bound to `cid`, binding a fresh one if needed.
    /// Rebinding an existing cid restarts its retention window.
    ///
    /// Ids are allocated monotonically, never 0, and never reused while
    /// still mapped.
    pub fn bind(&self, cid: &str, now: Instant) -> Result<u32, CommandError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::maybe_sweep(&mut inner, self.retention, now);

        // A reused cid starts a new command; its binding must outlive it
        if let Some(binding) = inner.by_cid.get_mut(cid) {
            binding.bound_at = now;
            return Ok(binding.id);
        }

        let live = inner.by_id.len();
        if live >= u32::MAX as usize {
            return Err(CommandError::IdSpaceExhausted { live });
        }

        let mut id = inner.next_id;
        while id == 0 || inner.by_id.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);

        inner.by_id.insert(id, cid.to_string());
        inner.by_cid.insert(cid.to_string(), Binding { id, bound_at: now });
        Ok(id)
    }

    /// Controller id bound to `cid`
    pub fn controller_id(&self, cid: &str) -> Option<u32> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_cid.get(cid).map(|b| b.id)
    }

    /// Correlation id bound to a controller id
    pub fn correlation_id(&self, id: u32) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_id.get(&id).cloned()
    }

    /// Remove every entry older than the retention window. Returns the
    /// number of entries removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge(&mut inner, self.retention, now)
    }

    /// Number of live bindings
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).by_id.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn maybe_sweep(inner: &mut Inner, retention: Duration, now: Instant) {
        let due = match inner.last_sweep {
            Some(last) => now.saturating_duration_since(last) >= SWEEP_INTERVAL,
            None => true,
        };
        if due {
            inner.last_sweep = Some(now);
            Self::purge(inner, retention, now);
        }
    }

    fn purge(inner: &mut Inner, retention: Duration, now: Instant) -> usize {
        let expired: Vec<(String, u32)> = inner
            .by_cid
            .iter()
            .filter(|(_, b)| now.saturating_duration_since(b.bound_at) >= retention)
            .map(|(cid, b)| (cid.clone(), b.id))
            .collect();

        for (cid, id) in &expired {
            inner.by_cid.remove(cid);
            inner.by_id.remove(id);
        }
        if !expired.is_empty() {
            tracing::debug!(evicted = expired.len(), "correlation map swept");
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_is_stable() {
        let map = CorrelationMap::new(Duration::from_secs(60));
        let now = Instant::now();
        let a = map.bind("a", now).unwrap();
        let b = map.bind("b", now).unwrap();
        assert_ne!(a, b);
        assert_eq!(map.bind("a", now).unwrap(), a);
        assert_eq!(map.controller_id("b"), Some(b));
        assert_eq!(map.correlation_id(a).as_deref(), Some("a"));
    }

    #[test]
    fn test_ids_monotonic_and_nonzero() {
        let map = CorrelationMap::new(Duration::from_secs(60));
        let now = Instant::now();
        let ids: Vec<u32> = (0..5)
            .map(|i| map.bind(&format!("c{}", i), now).unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_purge_expired() {
        let map = CorrelationMap::new(Duration::from_secs(10));
        let start = Instant::now();
        let old = map.bind("old", start).unwrap();
        map.bind("new", start + Duration::from_secs(8)).unwrap();

        assert_eq!(map.purge_expired(start + Duration::from_secs(11)), 1);
        assert_eq!(map.correlation_id(old), None);
        assert_eq!(map.controller_id("new"), Some(2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_expired_ids_are_not_reused_immediately() {
        let map = CorrelationMap::new(Duration::from_secs(1));
        let start = Instant::now();
        map.bind("a", start).unwrap();
        map.purge_expired(start + Duration::from_secs(2));
        // Allocation keeps moving forward after eviction
        assert_eq!(map.bind("b", start + Duration::from_secs(2)).unwrap(), 2);
    }

    #[test]
    fn test_sweep_on_bind() {
        let map = CorrelationMap::new(Duration::from_secs(5));
        let start = Instant::now();
        map.bind("a", start).unwrap();
        map.bind("b", start + SWEEP_INTERVAL + Duration::from_secs(1)).unwrap();
        assert_eq!(map.controller_id("a"), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_rebind_restarts_retention() {
        let map = CorrelationMap::new(Duration::from_secs(60));
        let start = Instant::now();
        let at = |secs| start + Duration::from_secs(secs);

        let x = map.bind("x", at(0)).unwrap();
        map.bind("y", at(32)).unwrap();
        assert_eq!(map.bind("x", at(61)).unwrap(), x);
        // Sweep runs here; "x" was sent again one second ago
        map.bind("z", at(62)).unwrap();

        assert_eq!(map.controller_id("x"), Some(x));
        assert_eq!(map.correlation_id(x).as_deref(), Some("x"));
        assert_eq!(map.purge_expired(at(120)), 1);
        assert_eq!(map.purge_expired(at(121)), 1);
        assert_eq!(map.controller_id("x"), None);
    }

    #[test]
    fn test_wraparound_skips_zero_and_live_ids() {
        let map = CorrelationMap::new(Duration::from_secs(60));
        let now = Instant::now();
        map.bind("one", now).unwrap();
        {
            let mut inner = map.inner.lock().unwrap();
            inner.next_id = u32::MAX;
        }
        assert_eq!(map.bind("max", now).unwrap(), u32::MAX);
        // 0 is skipped, 1 is still bound to "one"
        assert_eq!(map.bind("wrapped", now).unwrap(), 2);
    }
}

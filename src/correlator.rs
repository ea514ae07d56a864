//! Ack correlator
//!
//! Parks one waiter per outstanding correlation id and hands it the
//! acknowledgment delivered by the transport reader. Waiting is bounded by
//! a timeout and never blocks the reader; resolution is a non-blocking send
//! on a oneshot channel.

use crate::protocol::BusAck;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

type WaiterTable = HashMap<String, (u64, oneshot::Sender<BusAck>)>;

/// Result of waiting for an acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// The controller answered
    Acked(BusAck),
    /// No answer within the timeout
    TimedOut,
    /// The correlator was shut down while waiting
    Abandoned,
}

impl AckOutcome {
    /// The ack, if one arrived
    pub fn into_ack(self) -> Option<BusAck> {
        match self {
            AckOutcome::Acked(ack) => Some(ack),
            AckOutcome::TimedOut | AckOutcome::Abandoned => None,
        }
    }
}

/// Table of pending acknowledgment waiters
#[derive(Debug, Default)]
pub struct AckCorrelator {
    waiters: Arc<Mutex<WaiterTable>>,
    next_token: AtomicU64,
}

/// A registered waiter. Dropping it deregisters the correlation id.
#[derive(Debug)]
pub struct AckWaiter {
    correlation_id: String,
    token: u64,
    rx: oneshot::Receiver<BusAck>,
    table: Arc<Mutex<WaiterTable>>,
}

impl AckCorrelator {
    /// Create an empty correlator
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `correlation_id`.
    ///
    /// Register before writing the command so a fast ack cannot slip past.
    /// Registering an id that already has a waiter replaces it; the earlier
    /// waiter then reports [`AckOutcome::Abandoned`].
    pub fn register(&self, correlation_id: &str) -> AckWaiter {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let mut table = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        if table
            .insert(correlation_id.to_string(), (token, tx))
            .is_some()
        {
            tracing::warn!(cid = %correlation_id, "replacing an existing ack waiter");
        }

        AckWaiter {
            correlation_id: correlation_id.to_string(),
            token,
            rx,
            table: Arc::clone(&self.waiters),
        }
    }

    /// Register and wait in one step. Returns `None` on timeout or shutdown.
    pub async fn await_ack(&self, correlation_id: &str, timeout: Duration) -> Option<BusAck> {
        self.register(correlation_id).wait(timeout).await.into_ack()
    }

    /// Deliver an ack to its waiter. Returns whether anyone was waiting.
    pub fn resolve(&self, correlation_id: &str, ack: BusAck) -> bool {
        let entry = self
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(correlation_id);

        match entry {
            Some((_, tx)) => tx.send(ack).is_ok(),
            None => false,
        }
    }

    /// Drop every pending waiter. Each reports [`AckOutcome::Abandoned`].
    pub fn abandon_all(&self) -> usize {
        let mut table = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        let count = table.len();
        table.clear();
        count
    }

    /// Whether a waiter is registered for `correlation_id`
    pub fn is_waiting(&self, correlation_id: &str) -> bool {
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(correlation_id)
    }

    /// Number of pending waiters
    pub fn pending(&self) -> usize {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl AckWaiter {
    /// Correlation id this waiter is parked on
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the ack or the timeout, whichever comes first
    pub async fn wait(mut self, timeout: Duration) -> AckOutcome {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(ack)) => AckOutcome::Acked(ack),
            Ok(Err(_)) => AckOutcome::Abandoned,
            Err(_) => AckOutcome::TimedOut,
        }
    }
}

impl Drop for AckWaiter {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        // A later registration for the same id owns the slot now
        if matches!(table.get(&self.correlation_id), Some((token, _)) if *token == self.token) {
            table.remove(&self.correlation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers_ack() {
        let correlator = AckCorrelator::new();
        let waiter = correlator.register("c1");

        assert!(correlator.resolve("c1", BusAck::new("c1", true, "done")));
        let outcome = waiter.wait(Duration::from_secs(1)).await;

        assert_eq!(outcome, AckOutcome::Acked(BusAck::new("c1", true, "done")));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_unsolicited_ack_is_discarded() {
        let correlator = AckCorrelator::new();
        assert!(!correlator.resolve("nobody", BusAck::new("nobody", true, "")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_deregisters() {
        let correlator = AckCorrelator::new();
        let ack = correlator.await_ack("c2", Duration::from_secs(3)).await;

        assert!(ack.is_none());
        assert!(!correlator.is_waiting("c2"));
        assert!(!correlator.resolve("c2", BusAck::new("c2", true, "late")));
    }

    #[tokio::test]
    async fn test_abandon_all() {
        let correlator = AckCorrelator::new();
        let waiter = correlator.register("c3");

        assert_eq!(correlator.abandon_all(), 1);
        assert_eq!(waiter.wait(Duration::from_secs(1)).await, AckOutcome::Abandoned);
    }

    #[tokio::test]
    async fn test_dropped_waiter_leaves_newer_registration() {
        let correlator = AckCorrelator::new();
        let first = correlator.register("c4");
        let second = correlator.register("c4");

        drop(first);
        assert!(correlator.is_waiting("c4"));

        assert!(correlator.resolve("c4", BusAck::new("c4", true, "")));
        assert!(matches!(
            second.wait(Duration::from_secs(1)).await,
            AckOutcome::Acked(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_resolution() {
        let correlator = Arc::new(AckCorrelator::new());
        let waiter = correlator.register("c5");

        let resolver = Arc::clone(&correlator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            resolver.resolve("c5", BusAck::new("c5", false, "rejected: AUTO mode"));
        });

        let ack = waiter.wait(Duration::from_secs(2)).await.into_ack().unwrap();
        assert!(!ack.ok);
        assert_eq!(ack.reason, "rejected: AUTO mode");
    }
}

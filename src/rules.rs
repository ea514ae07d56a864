//! Rules engine (admission control)
//!
//! Every command passes a single admission predicate before it reaches the
//! transport:
//!
//! 1. global lock
//! 2. duplicate correlation id within the dedupe window
//! 3. per-actor cooldown
//! 4. global cooldown
//!
//! The checks and the bookkeeping that follows an admit run under one
//! mutex, together with the active configuration, so a hot reload can never
//! be observed half-applied.

use crate::error::RulesError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rejection: admission is locked
pub const REASON_LOCKED: &str = "locked";
/// Rejection: correlation id seen within the dedupe window
pub const REASON_DUPLICATE_CID: &str = "duplicate_cid";
/// Rejection: actor is cooling down
pub const REASON_COOLDOWN_USER: &str = "cooldown_user";
/// Rejection: any actor sent a command too recently
pub const REASON_COOLDOWN_GLOBAL: &str = "cooldown_global";

/// Upper bound for the per-actor cooldown
pub const MAX_COOLDOWN_PER_ACTOR: Duration = Duration::from_secs(300);
/// Upper bound for the global cooldown
pub const MAX_COOLDOWN_GLOBAL: Duration = Duration::from_secs(60);
/// Upper bound for the dedupe window
pub const MAX_DEDUPE_TTL: Duration = Duration::from_secs(600);

/// Expired ids and idle actors are swept at most this often
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Actors idle for this many per-actor cooldowns are forgotten
const IDLE_ACTOR_FACTOR: u32 = 10;

/// Admission control configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RulesConfig {
    /// Reject every command
    pub lock: bool,
    /// Minimum gap between two commands from the same actor
    pub cooldown_per_actor: Duration,
    /// Minimum gap between any two commands
    pub cooldown_global: Duration,
    /// How long a correlation id stays reserved
    pub dedupe_ttl: Duration,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            lock: false,
            cooldown_per_actor: Duration::from_secs(3),
            cooldown_global: Duration::from_secs(1),
            dedupe_ttl: Duration::from_secs(60),
        }
    }
}

impl RulesConfig {
    /// Permissive configuration for tests and bench rigs
    pub fn permissive() -> Self {
        Self {
            lock: false,
            cooldown_per_actor: Duration::ZERO,
            cooldown_global: Duration::ZERO,
            dedupe_ttl: Duration::from_secs(60),
        }
    }

    /// Set the lock flag
    pub fn with_lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    /// Set the per-actor cooldown
    pub fn with_cooldown_per_actor(mut self, cooldown: Duration) -> Self {
        self.cooldown_per_actor = cooldown;
        self
    }

    /// Set the global cooldown
    pub fn with_cooldown_global(mut self, cooldown: Duration) -> Self {
        self.cooldown_global = cooldown;
        self
    }

    /// Set the dedupe window
    pub fn with_dedupe_ttl(mut self, ttl: Duration) -> Self {
        self.dedupe_ttl = ttl;
        self
    }

    /// Check every duration against its upper bound
    pub fn validate(&self) -> Result<(), RulesError> {
        check_range("cooldownPerActor", self.cooldown_per_actor, MAX_COOLDOWN_PER_ACTOR)?;
        check_range("cooldownGlobal", self.cooldown_global, MAX_COOLDOWN_GLOBAL)?;
        check_range("dedupeTtl", self.dedupe_ttl, MAX_DEDUPE_TTL)?;
        Ok(())
    }

    /// Apply a partial update, leaving absent fields unchanged
    pub fn merged(&self, update: &RulesUpdate) -> Self {
        Self {
            lock: update.lock.unwrap_or(self.lock),
            cooldown_per_actor: update
                .cooldown_per_actor
                .map(Duration::from_secs)
                .unwrap_or(self.cooldown_per_actor),
            cooldown_global: update
                .cooldown_global
                .map(Duration::from_secs)
                .unwrap_or(self.cooldown_global),
            dedupe_ttl: update
                .dedupe_ttl
                .map(Duration::from_secs)
                .unwrap_or(self.dedupe_ttl),
        }
    }

    /// Serializable view, durations in whole seconds
    pub fn view(&self) -> RulesView {
        RulesView {
            lock: self.lock,
            cooldown_per_actor: self.cooldown_per_actor.as_secs(),
            cooldown_global: self.cooldown_global.as_secs(),
            dedupe_ttl: self.dedupe_ttl.as_secs(),
        }
    }
}

fn check_range(field: &'static str, value: Duration, max: Duration) -> Result<(), RulesError> {
    if value > max {
        return Err(RulesError::OutOfRange {
            field,
            max_secs: max.as_secs(),
            actual_secs: value.as_secs(),
        });
    }
    Ok(())
}

/// Rules configuration as exposed on the admin interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesView {
    pub lock: bool,
    pub cooldown_per_actor: u64,
    pub cooldown_global: u64,
    pub dedupe_ttl: u64,
}

impl From<RulesView> for RulesConfig {
    fn from(view: RulesView) -> Self {
        Self {
            lock: view.lock,
            cooldown_per_actor: Duration::from_secs(view.cooldown_per_actor),
            cooldown_global: Duration::from_secs(view.cooldown_global),
            dedupe_ttl: Duration::from_secs(view.dedupe_ttl),
        }
    }
}

/// Partial rules update (seconds)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesUpdate {
    pub lock: Option<bool>,
    pub cooldown_per_actor: Option<u64>,
    pub cooldown_global: Option<u64>,
    pub dedupe_ttl: Option<u64>,
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Forward the command
    Admitted,
    /// Refuse with the given reason
    Rejected(&'static str),
}

impl Admission {
    /// Whether the command was admitted
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }

    /// Rejection reason, if any
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Admission::Admitted => None,
            Admission::Rejected(reason) => Some(reason),
        }
    }
}

/// Snapshot of the engine's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesStats {
    pub lock: bool,
    pub tracked_actors: usize,
    pub tracked_cids: usize,
}

#[derive(Debug)]
struct RulesState {
    config: RulesConfig,
    actor_last: HashMap<String, Instant>,
    global_last: Option<Instant>,
    seen_cids: HashMap<String, Instant>,
    last_cleanup: Option<Instant>,
}

/// Thread-safe admission gate
#[derive(Debug)]
pub struct RulesEngine {
    state: Mutex<RulesState>,
}

impl Default for RulesEngine {
    fn default() -> Self {
        Self::new(RulesConfig::default())
    }
}

impl RulesEngine {
    /// Create an engine with the given configuration
    pub fn new(config: RulesConfig) -> Self {
        Self {
            state: Mutex::new(RulesState {
                config,
                actor_last: HashMap::new(),
                global_last: None,
                seen_cids: HashMap::new(),
                last_cleanup: None,
            }),
        }
    }

    /// Active configuration
    pub fn config(&self) -> RulesConfig {
        self.lock_state().config
    }

    /// Replace the configuration. Invalid configurations are refused and
    /// leave the active one in place.
    pub fn update_config(&self, config: RulesConfig) -> Result<(), RulesError> {
        config.validate()?;
        self.lock_state().config = config;
        log_update(&config);
        Ok(())
    }

    /// Merge a partial update into the active configuration under one lock.
    /// Returns the new configuration; an invalid result changes nothing.
    pub fn apply(&self, update: &RulesUpdate) -> Result<RulesConfig, RulesError> {
        let config = {
            let mut state = self.lock_state();
            let config = state.config.merged(update);
            config.validate()?;
            state.config = config;
            config
        };
        log_update(&config);
        Ok(config)
    }

    /// Check a command and, if admitted, record it
    pub fn check_and_mark(&self, correlation_id: &str, actor: &str) -> Admission {
        self.check_and_mark_at(correlation_id, actor, Instant::now())
    }

    /// [`check_and_mark`](Self::check_and_mark) at an explicit instant
    pub fn check_and_mark_at(&self, correlation_id: &str, actor: &str, now: Instant) -> Admission {
        let mut state = self.lock_state();
        state.maybe_cleanup(now);

        let config = state.config;
        if config.lock {
            return Admission::Rejected(REASON_LOCKED);
        }

        if let Some(expiry) = state.seen_cids.get(correlation_id) {
            if now < *expiry {
                return Admission::Rejected(REASON_DUPLICATE_CID);
            }
        }

        if let Some(last) = state.actor_last.get(actor) {
            if now.saturating_duration_since(*last) < config.cooldown_per_actor {
                return Admission::Rejected(REASON_COOLDOWN_USER);
            }
        }

        if let Some(last) = state.global_last {
            if now.saturating_duration_since(last) < config.cooldown_global {
                return Admission::Rejected(REASON_COOLDOWN_GLOBAL);
            }
        }

        state
            .seen_cids
            .insert(correlation_id.to_string(), now + config.dedupe_ttl);
        state.actor_last.insert(actor.to_string(), now);
        state.global_last = Some(now);
        Admission::Admitted
    }

    /// Forget every tracked actor and correlation id
    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.actor_last.clear();
        state.seen_cids.clear();
        state.global_last = None;
    }

    /// Bookkeeping snapshot
    pub fn stats(&self) -> RulesStats {
        let state = self.lock_state();
        RulesStats {
            lock: state.config.lock,
            tracked_actors: state.actor_last.len(),
            tracked_cids: state.seen_cids.len(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RulesState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn log_update(config: &RulesConfig) {
    tracing::info!(
        lock = config.lock,
        cooldown_per_actor = config.cooldown_per_actor.as_secs(),
        cooldown_global = config.cooldown_global.as_secs(),
        dedupe_ttl = config.dedupe_ttl.as_secs(),
        "rules updated"
    );
}

impl RulesState {
    fn maybe_cleanup(&mut self, now: Instant) {
        match self.last_cleanup {
            Some(last) if now.saturating_duration_since(last) < CLEANUP_INTERVAL => return,
            _ => self.last_cleanup = Some(now),
        }

        let cids_before = self.seen_cids.len();
        self.seen_cids.retain(|_, expiry| now < *expiry);

        let idle = self.config.cooldown_per_actor * IDLE_ACTOR_FACTOR;
        let actors_before = self.actor_last.len();
        self.actor_last
            .retain(|_, last| now.saturating_duration_since(*last) <= idle);

        let removed_cids = cids_before - self.seen_cids.len();
        let removed_actors = actors_before - self.actor_last.len();
        if removed_cids + removed_actors > 0 {
            tracing::debug!(removed_cids, removed_actors, "rules cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_defaults() {
        let config = RulesConfig::default();
        assert!(!config.lock);
        assert_eq!(config.cooldown_per_actor, secs(3));
        assert_eq!(config.cooldown_global, secs(1));
        assert_eq!(config.dedupe_ttl, secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lock_rejects_everything() {
        let engine = RulesEngine::new(RulesConfig::permissive().with_lock(true));
        let now = Instant::now();
        for i in 0..5 {
            let cid = format!("c{}", i);
            assert_eq!(
                engine.check_and_mark_at(&cid, "alice", now),
                Admission::Rejected(REASON_LOCKED)
            );
        }
        assert_eq!(engine.stats().tracked_cids, 0);
    }

    #[test]
    fn test_duplicate_cid_within_ttl() {
        let engine = RulesEngine::new(RulesConfig::permissive().with_dedupe_ttl(secs(60)));
        let t0 = Instant::now();

        assert!(engine.check_and_mark_at("dup", "alice", t0).is_admitted());
        assert_eq!(
            engine.check_and_mark_at("dup", "bob", t0 + secs(59)),
            Admission::Rejected(REASON_DUPLICATE_CID)
        );
        assert!(engine.check_and_mark_at("dup", "bob", t0 + secs(60)).is_admitted());
    }

    #[test]
    fn test_per_actor_cooldown() {
        let engine = RulesEngine::new(
            RulesConfig::permissive().with_cooldown_per_actor(secs(3)),
        );
        let t0 = Instant::now();

        assert!(engine.check_and_mark_at("a1", "alice", t0).is_admitted());
        assert_eq!(
            engine.check_and_mark_at("a2", "alice", t0 + secs(2)),
            Admission::Rejected(REASON_COOLDOWN_USER)
        );
        // A different actor is judged on the global cooldown only
        assert!(engine.check_and_mark_at("b1", "bob", t0 + secs(2)).is_admitted());
        assert!(engine.check_and_mark_at("a3", "alice", t0 + secs(5)).is_admitted());
    }

    #[test]
    fn test_global_cooldown() {
        let engine = RulesEngine::new(
            RulesConfig::permissive().with_cooldown_global(secs(1)),
        );
        let t0 = Instant::now();

        assert!(engine.check_and_mark_at("a1", "alice", t0).is_admitted());
        assert_eq!(
            engine.check_and_mark_at("b1", "bob", t0 + Duration::from_millis(500)),
            Admission::Rejected(REASON_COOLDOWN_GLOBAL)
        );
        assert!(engine.check_and_mark_at("b2", "bob", t0 + secs(1)).is_admitted());
    }

    #[test]
    fn test_check_order() {
        let engine = RulesEngine::new(RulesConfig::default());
        let t0 = Instant::now();
        assert!(engine.check_and_mark_at("x", "alice", t0).is_admitted());
        // Duplicate wins over both cooldowns
        assert_eq!(
            engine.check_and_mark_at("x", "alice", t0).reason(),
            Some(REASON_DUPLICATE_CID)
        );
        // Per-actor wins over global
        assert_eq!(
            engine.check_and_mark_at("y", "alice", t0).reason(),
            Some(REASON_COOLDOWN_USER)
        );
    }

    #[test]
    fn test_rejection_does_not_mark() {
        let engine = RulesEngine::new(RulesConfig::default());
        let t0 = Instant::now();
        assert!(engine.check_and_mark_at("a1", "alice", t0).is_admitted());
        assert!(!engine.check_and_mark_at("a2", "alice", t0 + secs(1)).is_admitted());
        // The rejected cid was not reserved
        assert!(engine.check_and_mark_at("a2", "alice", t0 + secs(4)).is_admitted());
    }

    #[test]
    fn test_cleanup_removes_expired_and_idle() {
        let engine = RulesEngine::new(
            RulesConfig::permissive()
                .with_cooldown_per_actor(secs(1))
                .with_dedupe_ttl(secs(5)),
        );
        let t0 = Instant::now();
        engine.check_and_mark_at("a1", "alice", t0);
        engine.check_and_mark_at("b1", "bob", t0 + secs(2));
        assert_eq!(engine.stats().tracked_cids, 2);

        engine.check_and_mark_at("c1", "carol", t0 + CLEANUP_INTERVAL);
        let stats = engine.stats();
        assert_eq!(stats.tracked_cids, 1);
        assert_eq!(stats.tracked_actors, 1);
    }

    #[test]
    fn test_update_config_validates() {
        let engine = RulesEngine::default();
        let bad = RulesConfig::default().with_cooldown_global(secs(61));

        let err = engine.update_config(bad).unwrap_err();
        assert!(matches!(err, RulesError::OutOfRange { field: "cooldownGlobal", .. }));
        assert_eq!(engine.config(), RulesConfig::default());

        let good = RulesConfig::default().with_lock(true);
        engine.update_config(good).unwrap();
        assert!(engine.config().lock);
    }

    #[test]
    fn test_merge_partial_update() {
        let update: RulesUpdate = serde_json::from_str(r#"{"cooldownPerActor": 10}"#).unwrap();
        let merged = RulesConfig::default().merged(&update);
        assert_eq!(merged.cooldown_per_actor, secs(10));
        assert_eq!(merged.cooldown_global, secs(1));

        let view = serde_json::to_value(merged.view()).unwrap();
        assert_eq!(view["cooldownPerActor"], 10);
        assert_eq!(view["dedupeTtl"], 60);
    }

    #[test]
    fn test_apply_merges_under_one_lock() {
        use std::sync::Arc;
        use std::thread;

        let engine = Arc::new(RulesEngine::default());
        let updates = [
            RulesUpdate {
                lock: Some(true),
                ..Default::default()
            },
            RulesUpdate {
                cooldown_per_actor: Some(10),
                ..Default::default()
            },
            RulesUpdate {
                dedupe_ttl: Some(120),
                ..Default::default()
            },
        ];

        let handles: Vec<_> = updates
            .into_iter()
            .map(|update| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || engine.apply(&update).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let config = engine.config();
        assert!(config.lock);
        assert_eq!(config.cooldown_per_actor, secs(10));
        assert_eq!(config.dedupe_ttl, secs(120));

        let bad = RulesUpdate {
            lock: Some(false),
            dedupe_ttl: Some(601),
            ..Default::default()
        };
        assert!(engine.apply(&bad).is_err());
        assert_eq!(engine.config(), config);
    }

    #[test]
    fn test_concurrent_admission_is_atomic() {
        use std::sync::Arc;
        use std::thread;

        let engine = Arc::new(RulesEngine::new(
            RulesConfig::permissive().with_cooldown_global(secs(60)),
        ));
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    engine
                        .check_and_mark_at(&format!("c{}", i), &format!("actor{}", i), now)
                        .is_admitted()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }
}

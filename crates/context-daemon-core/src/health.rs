//! Per-source health tracking and circuit breaking.
//!
//! Each source owns one [`SourceHealth`] record behind its own mutex, so
//! reporting on one source never contends with another. The map of records
//! is a sharded [`DashMap`]; the shard lock is only held long enough to
//! clone the record's `Arc`.
//!
//! # State machine
//!
//! ```text
//!   Closed --(N consecutive failures)--> Open
//!   Open   --(cooldown elapsed, first caller)--> HalfOpen (one trial)
//!   HalfOpen --success--> Closed (cooldown reset)
//!   HalfOpen --failure--> Open   (cooldown doubled, capped)
//! ```
//!
//! Latency is tracked as an exponential moving average for diagnostics
//! only; it never opens the breaker.
//!
//! Admission hands out an [`Attempt`]. Every attempt reports exactly one
//! outcome: [`Attempt::succeed`], [`Attempt::fail`], or, if dropped without
//! either, an implicit failure.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ContextError;
use crate::models::SourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    /// Weight of the newest sample in the latency EMA, in `(0, 1]`.
    pub latency_alpha: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(240),
            latency_alpha: 0.2,
        }
    }
}

/// Health record for one source.
#[derive(Debug, Clone)]
pub struct SourceHealth {
    pub source_id: SourceId,
    pub consecutive_failures: u32,
    pub state: BreakerState,
    pub opened_at: Option<Instant>,
    pub last_latency: Option<Duration>,
    pub latency_ema_ms: Option<f64>,
    pub cooldown: Duration,
    pub trial_in_flight: bool,
    pub successes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

impl SourceHealth {
    fn new(source_id: SourceId, config: &BreakerConfig) -> Self {
        Self {
            source_id,
            consecutive_failures: 0,
            state: BreakerState::Closed,
            opened_at: None,
            last_latency: None,
            latency_ema_ms: None,
            cooldown: config.cooldown,
            trial_in_flight: false,
            successes: 0,
            failures: 0,
            last_error: None,
        }
    }

    fn observe_latency(&mut self, latency: Duration, alpha: f64) {
        let sample = latency.as_secs_f64() * 1000.0;
        self.last_latency = Some(latency);
        self.latency_ema_ms = Some(match self.latency_ema_ms {
            Some(prev) => alpha * sample + (1.0 - alpha) * prev,
            None => sample,
        });
    }

    fn on_success(&mut self, latency: Duration, config: &BreakerConfig) {
        self.observe_latency(latency, config.latency_alpha);
        self.successes += 1;
        self.consecutive_failures = 0;
        self.trial_in_flight = false;
        if self.state != BreakerState::Closed {
            info!(source = %self.source_id, from = ?self.state, "breaker closed");
        }
        self.state = BreakerState::Closed;
        self.opened_at = None;
        self.cooldown = config.cooldown;
    }

    fn on_failure(&mut self, latency: Duration, error: &str, now: Instant, config: &BreakerConfig) {
        self.observe_latency(latency, config.latency_alpha);
        self.failures += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
        match self.state {
            BreakerState::Closed => {
                if self.consecutive_failures >= config.failure_threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                    self.cooldown = config.cooldown;
                    warn!(
                        source = %self.source_id,
                        failures = self.consecutive_failures,
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                self.trial_in_flight = false;
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
                self.cooldown = (self.cooldown * 2).min(config.max_cooldown);
                warn!(
                    source = %self.source_id,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "trial request failed; breaker re-opened"
                );
            }
            // A straggler admitted before the breaker opened.
            BreakerState::Open => {}
        }
    }
}

/// Serializable view of a [`SourceHealth`] for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub source_id: SourceId,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub latency_ema_ms: Option<f64>,
    pub last_latency_ms: Option<u64>,
    pub cooldown_ms: u64,
    /// Time left before an open breaker admits a trial request.
    pub retry_in_ms: Option<u64>,
    pub successes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

/// Outcome of asking whether a source may be called.
#[derive(Debug)]
pub enum Admission {
    Allowed(Attempt),
    /// The single trial request of a half-open breaker.
    Trial(Attempt),
    Rejected { retry_in: Duration },
}

impl Admission {
    pub fn into_attempt(self) -> Option<Attempt> {
        match self {
            Admission::Allowed(a) | Admission::Trial(a) => Some(a),
            Admission::Rejected { .. } => None,
        }
    }
}

/// One admitted call to a source. Reports exactly one outcome.
#[derive(Debug)]
pub struct Attempt {
    health: Arc<Mutex<SourceHealth>>,
    config: BreakerConfig,
    started: Instant,
    reported: bool,
}

impl Attempt {
    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn succeed(self) {
        self.succeed_at(Instant::now());
    }

    pub fn succeed_at(mut self, now: Instant) {
        let latency = now.saturating_duration_since(self.started);
        lock(&self.health).on_success(latency, &self.config);
        self.reported = true;
    }

    pub fn fail(self, error: &ContextError) {
        self.fail_at(error, Instant::now());
    }

    pub fn fail_at(mut self, error: &ContextError, now: Instant) {
        let latency = now.saturating_duration_since(self.started);
        let mut health = lock(&self.health);
        debug!(source = %health.source_id, error = %error, "source attempt failed");
        health.on_failure(latency, &error.to_string(), now, &self.config);
        drop(health);
        self.reported = true;
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if !self.reported {
            let now = Instant::now();
            let latency = now.saturating_duration_since(self.started);
            lock(&self.health).on_failure(latency, "attempt abandoned", now, &self.config);
        }
    }
}

fn lock(health: &Mutex<SourceHealth>) -> MutexGuard<'_, SourceHealth> {
    health.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide registry of per-source health.
pub struct HealthTracker {
    sources: DashMap<SourceId, Arc<Mutex<SourceHealth>>>,
    config: BreakerConfig,
}

impl HealthTracker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            sources: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Ensure a record exists for `id` (normally done once at startup).
    pub fn register(&self, id: &SourceId) {
        self.record(id);
    }

    fn record(&self, id: &SourceId) -> Arc<Mutex<SourceHealth>> {
        if let Some(existing) = self.sources.get(id) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .sources
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SourceHealth::new(id.clone(), &self.config))));
        Arc::clone(entry.value())
    }

    pub fn admit(&self, id: &SourceId) -> Admission {
        self.admit_at(id, Instant::now())
    }

    pub fn admit_at(&self, id: &SourceId, now: Instant) -> Admission {
        let record = self.record(id);
        let mut health = lock(&record);
        let trial = match health.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let opened_at = health.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed < health.cooldown {
                    return Admission::Rejected {
                        retry_in: health.cooldown - elapsed,
                    };
                }
                health.state = BreakerState::HalfOpen;
                health.trial_in_flight = true;
                info!(source = %health.source_id, "breaker half-open; admitting trial request");
                true
            }
            BreakerState::HalfOpen => {
                if health.trial_in_flight {
                    return Admission::Rejected {
                        retry_in: Duration::ZERO,
                    };
                }
                health.trial_in_flight = true;
                true
            }
        };
        drop(health);

        let attempt = Attempt {
            health: record,
            config: self.config,
            started: now,
            reported: false,
        };
        if trial {
            Admission::Trial(attempt)
        } else {
            Admission::Allowed(attempt)
        }
    }

    pub fn state(&self, id: &SourceId) -> BreakerState {
        match self.sources.get(id) {
            Some(record) => lock(record.value()).state,
            None => BreakerState::Closed,
        }
    }

    pub fn health(&self, id: &SourceId) -> Option<SourceHealth> {
        let record = self.sources.get(id).map(|r| Arc::clone(r.value()))?;
        let health = lock(&record).clone();
        Some(health)
    }

    /// Diagnostics for every known source, sorted by id.
    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        let now = Instant::now();
        let records: Vec<Arc<Mutex<SourceHealth>>> =
            self.sources.iter().map(|r| Arc::clone(r.value())).collect();
        let mut out: Vec<HealthSnapshot> = records
            .iter()
            .map(|record| {
                let h = lock(record);
                let retry_in_ms = match (h.state, h.opened_at) {
                    (BreakerState::Open, Some(at)) => Some(
                        h.cooldown
                            .saturating_sub(now.saturating_duration_since(at))
                            .as_millis() as u64,
                    ),
                    _ => None,
                };
                HealthSnapshot {
                    source_id: h.source_id.clone(),
                    state: h.state,
                    consecutive_failures: h.consecutive_failures,
                    latency_ema_ms: h.latency_ema_ms,
                    last_latency_ms: h.last_latency.map(|d| d.as_millis() as u64),
                    cooldown_ms: h.cooldown.as_millis() as u64,
                    retry_in_ms,
                    successes: h.successes,
                    failures: h.failures,
                    last_error: h.last_error.clone(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        out
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> SourceId {
        SourceId::new("mcp:docs")
    }

    fn err() -> ContextError {
        ContextError::unavailable(&id(), "connection refused")
    }

    fn fail_n(tracker: &HealthTracker, n: u32, now: Instant) {
        for _ in 0..n {
            tracker.admit_at(&id(), now).into_attempt().unwrap().fail_at(&err(), now);
        }
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let tracker = HealthTracker::default();
        let now = Instant::now();
        fail_n(&tracker, 2, now);
        assert_eq!(tracker.state(&id()), BreakerState::Closed);
        fail_n(&tracker, 1, now);
        assert_eq!(tracker.state(&id()), BreakerState::Open);
        assert!(matches!(
            tracker.admit_at(&id(), now + Duration::from_secs(1)),
            Admission::Rejected { .. }
        ));
    }

    #[test]
    fn success_resets_failure_count() {
        let tracker = HealthTracker::default();
        let now = Instant::now();
        fail_n(&tracker, 2, now);
        tracker.admit_at(&id(), now).into_attempt().unwrap().succeed_at(now);
        fail_n(&tracker, 2, now);
        assert_eq!(tracker.state(&id()), BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_trial() {
        let tracker = HealthTracker::default();
        let t0 = Instant::now();
        fail_n(&tracker, 3, t0);
        let after = t0 + Duration::from_secs(30);
        let trial = tracker.admit_at(&id(), after);
        assert!(matches!(trial, Admission::Trial(_)));
        assert_eq!(tracker.state(&id()), BreakerState::HalfOpen);
        assert!(matches!(tracker.admit_at(&id(), after), Admission::Rejected { .. }));
        trial.into_attempt().unwrap().succeed_at(after);
        assert_eq!(tracker.state(&id()), BreakerState::Closed);
        assert!(matches!(tracker.admit_at(&id(), after), Admission::Allowed(_)));
    }

    #[test]
    fn failed_trial_doubles_cooldown_up_to_cap() {
        let config = BreakerConfig {
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(100),
            ..BreakerConfig::default()
        };
        let tracker = HealthTracker::new(config);
        let mut now = Instant::now();
        fail_n(&tracker, 3, now);

        for expected in [60u64, 100, 100] {
            let cooldown = tracker.health(&id()).unwrap().cooldown;
            now += cooldown;
            let attempt = tracker.admit_at(&id(), now).into_attempt().unwrap();
            attempt.fail_at(&err(), now);
            assert_eq!(tracker.state(&id()), BreakerState::Open);
            assert_eq!(tracker.health(&id()).unwrap().cooldown, Duration::from_secs(expected));
        }
    }

    #[test]
    fn dropped_attempt_counts_as_failure() {
        let tracker = HealthTracker::default();
        for _ in 0..3 {
            let attempt = tracker.admit(&id()).into_attempt().unwrap();
            drop(attempt);
        }
        assert_eq!(tracker.state(&id()), BreakerState::Open);
        assert_eq!(tracker.health(&id()).unwrap().failures, 3);
    }

    #[test]
    fn latency_ema_does_not_open_breaker() {
        let tracker = HealthTracker::default();
        let t0 = Instant::now();
        for i in 0..10 {
            let start = t0 + Duration::from_secs(i);
            let attempt = tracker.admit_at(&id(), start).into_attempt().unwrap();
            attempt.succeed_at(start + Duration::from_millis(900));
        }
        let h = tracker.health(&id()).unwrap();
        assert_eq!(h.state, BreakerState::Closed);
        let ema = h.latency_ema_ms.unwrap();
        assert!((ema - 900.0).abs() < 1e-6, "ema={ema}");
    }

    #[test]
    fn ema_weights_new_samples() {
        let tracker = HealthTracker::default();
        let t0 = Instant::now();
        tracker
            .admit_at(&id(), t0)
            .into_attempt()
            .unwrap()
            .succeed_at(t0 + Duration::from_millis(100));
        tracker
            .admit_at(&id(), t0)
            .into_attempt()
            .unwrap()
            .succeed_at(t0 + Duration::from_millis(200));
        let ema = tracker.health(&id()).unwrap().latency_ema_ms.unwrap();
        assert!((ema - 120.0).abs() < 1e-6, "ema={ema}");
    }

    #[test]
    fn snapshot_is_sorted() {
        let tracker = HealthTracker::default();
        tracker.register(&SourceId::new("semantic"));
        tracker.register(&SourceId::new("buffer"));
        let ids: Vec<String> = tracker
            .snapshot()
            .into_iter()
            .map(|s| s.source_id.to_string())
            .collect();
        assert_eq!(ids, vec!["buffer", "semantic"]);
    }
}

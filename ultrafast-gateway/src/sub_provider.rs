//! # Sub-Provider State (C2)
//!
//! The fast path: rolling per-minute windows, concurrency reservation,
//! health score derivation, and the circuit breaker state machine
//! (SPEC_FULL.md §4.2). Every mutation is serialized per sub-provider id by
//! wrapping one [`SubProviderState`] in an `Arc<RwLock<_>>` inside
//! [`SubProviderRegistry`] — the same per-key-lock shape the teacher uses
//! for its async `CircuitBreaker` (`circuit_breaker.rs`), generalized so
//! the open->half-open edge is driven only by the health monitor's tick
//! (§4.5), never by the call path.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use ultrafast_models_sdk::error::ErrorType;

use crate::domain::CircuitState;

const WINDOW_SPAN_MS: u64 = 60_000;
const FAILURE_THRESHOLD: u32 = 3;
const OPEN_TIMEOUT: Duration = Duration::from_secs(120);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn minute_stamp(now_ms: u64) -> u64 {
    (now_ms / WINDOW_SPAN_MS) * WINDOW_SPAN_MS
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    minute_stamp: u64,
    count: u64,
}

/// A rolling 60s window of `(minuteStamp, count)` buckets.
#[derive(Debug, Default)]
struct RollingWindow {
    buckets: VecDeque<Bucket>,
}

impl RollingWindow {
    fn cleanup(&mut self, now: u64) {
        while let Some(front) = self.buckets.front() {
            if front.minute_stamp <= now.saturating_sub(WINDOW_SPAN_MS) {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn sum(&self, now: u64) -> u64 {
        self.buckets
            .iter()
            .filter(|b| b.minute_stamp > now.saturating_sub(WINDOW_SPAN_MS))
            .map(|b| b.count)
            .sum()
    }

    fn add(&mut self, now: u64, amount: u64) {
        let stamp = minute_stamp(now);
        if let Some(back) = self.buckets.back_mut() {
            if back.minute_stamp == stamp {
                back.count += amount;
                return;
            }
        }
        self.buckets.push_back(Bucket {
            minute_stamp: stamp,
            count: amount,
        });
    }
}

/// The mutable fast-path state block for one sub-provider (SPEC_FULL.md §3).
pub struct SubProviderState {
    request_window: RollingWindow,
    token_window: RollingWindow,
    current_concurrent_requests: u64,

    pub max_requests_per_minute: u64,
    pub max_requests_per_hour: u64,
    pub max_tokens_per_minute: u64,
    pub max_concurrent_requests: u64,

    circuit_state: CircuitState,
    last_trigger_at: Option<SystemTime>,

    success_count: u64,
    error_count: u64,
    consecutive_errors: u32,
    avg_latency_ms: f64,
    total_token_usage: u64,
    last_error_type: Option<ErrorType>,
    last_used_at: Option<SystemTime>,
}

impl SubProviderState {
    pub fn new(
        max_requests_per_minute: u64,
        max_requests_per_hour: u64,
        max_tokens_per_minute: u64,
        max_concurrent_requests: u64,
    ) -> Self {
        Self {
            request_window: RollingWindow::default(),
            token_window: RollingWindow::default(),
            current_concurrent_requests: 0,
            max_requests_per_minute,
            max_requests_per_hour,
            max_tokens_per_minute,
            max_concurrent_requests,
            circuit_state: CircuitState::Closed,
            last_trigger_at: None,
            success_count: 0,
            error_count: 0,
            consecutive_errors: 0,
            avg_latency_ms: 0.0,
            total_token_usage: 0,
            last_error_type: None,
            last_used_at: None,
        }
    }

    pub fn current_requests_per_minute(&mut self) -> u64 {
        let now = now_ms();
        self.request_window.cleanup(now);
        self.request_window.sum(now)
    }

    pub fn current_tokens_per_minute(&mut self) -> u64 {
        let now = now_ms();
        self.token_window.cleanup(now);
        self.token_window.sum(now)
    }

    pub fn current_concurrent_requests(&self) -> u64 {
        self.current_concurrent_requests
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_state
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn total_requests(&self) -> u64 {
        self.success_count + self.error_count
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.avg_latency_ms
    }

    pub fn total_token_usage(&self) -> u64 {
        self.total_token_usage
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// `canHandleRequest` (§4.2): true iff admitting one more request of
    /// `estimated_tokens` would keep every counter within its limit.
    pub fn can_handle_request(&mut self, estimated_tokens: u64) -> bool {
        let rpm = self.current_requests_per_minute();
        let tpm = self.current_tokens_per_minute();
        (rpm + 1) <= self.max_requests_per_minute
            && (tpm + estimated_tokens) <= self.max_tokens_per_minute
            && (self.current_concurrent_requests + 1) <= self.max_concurrent_requests
    }

    /// `reserveCapacity` (§4.2): atomically checks `canHandleRequest` and,
    /// on success, records the reservation in both windows and the
    /// concurrency counter.
    pub fn reserve_capacity(&mut self, estimated_tokens: u64) -> bool {
        if !self.can_handle_request(estimated_tokens) {
            return false;
        }
        let now = now_ms();
        self.request_window.add(now, 1);
        if estimated_tokens > 0 {
            self.token_window.add(now, estimated_tokens);
        }
        self.current_concurrent_requests += 1;
        true
    }

    /// `releaseCapacity` (§4.2): saturating decrement.
    pub fn release_capacity(&mut self) {
        self.current_concurrent_requests = self.current_concurrent_requests.saturating_sub(1);
    }

    /// `recordSuccess` (§4.2).
    pub fn record_success(&mut self, latency_ms: f64, tokens_used: u64) {
        self.success_count += 1;
        self.consecutive_errors = 0;
        self.total_token_usage += tokens_used;
        self.update_avg_latency(latency_ms);
        self.last_used_at = Some(SystemTime::now());
        self.update_circuit_breaker_on_success();
    }

    /// `recordError` (§4.2).
    pub fn record_error(&mut self, error_type: ErrorType, latency_ms: Option<f64>) {
        self.error_count += 1;
        self.consecutive_errors += 1;
        self.last_error_type = Some(error_type);
        if let Some(latency) = latency_ms {
            self.update_avg_latency(latency);
        }
        self.update_circuit_breaker_on_error();
    }

    fn update_avg_latency(&mut self, latency_ms: f64) {
        let n = (self.success_count + self.error_count).max(1) as f64;
        self.avg_latency_ms = (self.avg_latency_ms * (n - 1.0) + latency_ms) / n;
    }

    /// Derived health score (§4.2). `0.8` is the neutral prior for a
    /// sub-provider with no observed outcomes yet.
    pub fn health_score(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            return 0.8;
        }
        let error_penalty = (0.05 * self.consecutive_errors as f64).min(0.3);
        let latency_penalty = ((self.avg_latency_ms - 60_000.0) / 120_000.0).max(0.0);
        (self.success_rate() - error_penalty - latency_penalty).clamp(0.3, 1.0)
    }

    pub fn is_healthy(&self) -> bool {
        self.health_score() > 0.05 && matches!(self.circuit_state, CircuitState::Closed | CircuitState::HalfOpen)
    }

    fn update_circuit_breaker_on_success(&mut self) {
        if self.circuit_state == CircuitState::HalfOpen && self.consecutive_errors == 0 {
            self.circuit_state = CircuitState::Closed;
        }
    }

    fn update_circuit_breaker_on_error(&mut self) {
        match self.circuit_state {
            CircuitState::Closed => {
                if self.consecutive_errors >= FAILURE_THRESHOLD {
                    self.circuit_state = CircuitState::Open;
                    self.last_trigger_at = Some(SystemTime::now());
                }
            }
            CircuitState::HalfOpen => {
                if self.consecutive_errors >= 2 {
                    self.circuit_state = CircuitState::Open;
                    self.last_trigger_at = Some(SystemTime::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Called only by the health monitor's tick (§4.5): open -> half-open
    /// once `OPEN_TIMEOUT` has elapsed since the trip.
    pub fn maybe_half_open(&mut self) {
        if self.circuit_state == CircuitState::Open {
            if let Some(trigger) = self.last_trigger_at {
                if trigger.elapsed().unwrap_or_default() > OPEN_TIMEOUT {
                    self.circuit_state = CircuitState::HalfOpen;
                }
            }
        }
    }

    pub fn open_circuit_breaker(&mut self) {
        self.circuit_state = CircuitState::Open;
        self.last_trigger_at = Some(SystemTime::now());
    }

    pub fn close_circuit_breaker(&mut self) {
        self.circuit_state = CircuitState::Closed;
        self.consecutive_errors = 0;
    }

    pub fn half_open_circuit_breaker(&mut self) {
        self.circuit_state = CircuitState::HalfOpen;
    }
}

/// Registry of per-sub-provider state, each independently lockable so
/// concurrent mutations on different ids never contend (SPEC_FULL.md §5).
#[derive(Default)]
pub struct SubProviderRegistry {
    states: DashMap<String, Arc<RwLock<SubProviderState>>>,
}

impl SubProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, state: SubProviderState) {
        self.states.insert(id.into(), Arc::new(RwLock::new(state)));
    }

    pub fn get(&self, id: &str) -> Option<Arc<RwLock<SubProviderState>>> {
        self.states.get(id).map(|entry| entry.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        self.states.iter().map(|e| e.key().clone()).collect()
    }

    pub fn remove(&self, id: &str) {
        self.states.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_release_returns_to_baseline_p1() {
        let mut state = SubProviderState::new(100, 1000, 100_000, 5);
        assert!(state.reserve_capacity(10));
        assert_eq!(state.current_concurrent_requests(), 1);
        state.release_capacity();
        assert_eq!(state.current_concurrent_requests(), 0);
    }

    #[tokio::test]
    async fn reserve_capacity_never_exceeds_limits_p2() {
        let mut state = SubProviderState::new(2, 1000, 100_000, 2);
        assert!(state.reserve_capacity(1));
        assert!(state.reserve_capacity(1));
        assert!(!state.reserve_capacity(1));
        assert_eq!(state.current_concurrent_requests(), 2);
    }

    #[test]
    fn circuit_opens_after_three_consecutive_errors_p5() {
        let mut state = SubProviderState::new(100, 1000, 100_000, 5);
        for _ in 0..2 {
            state.record_error(ErrorType::ServerError, None);
            assert_eq!(state.circuit_state(), CircuitState::Closed);
        }
        state.record_error(ErrorType::ServerError, None);
        assert_eq!(state.circuit_state(), CircuitState::Open);
    }

    #[test]
    fn half_open_closes_on_clean_success_p5() {
        let mut state = SubProviderState::new(100, 1000, 100_000, 5);
        state.half_open_circuit_breaker();
        state.record_success(10.0, 0);
        assert_eq!(state.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_reopens_after_two_consecutive_errors_p5() {
        let mut state = SubProviderState::new(100, 1000, 100_000, 5);
        state.half_open_circuit_breaker();
        state.record_error(ErrorType::Timeout, None);
        assert_eq!(state.circuit_state(), CircuitState::HalfOpen);
        state.record_error(ErrorType::Timeout, None);
        assert_eq!(state.circuit_state(), CircuitState::Open);
    }

    #[test]
    fn open_does_not_half_open_before_timeout() {
        let mut state = SubProviderState::new(100, 1000, 100_000, 5);
        state.open_circuit_breaker();
        state.maybe_half_open();
        assert_eq!(state.circuit_state(), CircuitState::Open);
    }

    #[test]
    fn health_score_defaults_to_neutral_prior_for_new_subprovider() {
        let state = SubProviderState::new(100, 1000, 100_000, 5);
        assert_eq!(state.health_score(), 0.8);
    }

    #[test]
    fn success_does_not_decrease_health_score_p7() {
        let mut state = SubProviderState::new(100, 1000, 100_000, 5);
        state.record_success(10.0, 5);
        let before = state.health_score();
        state.record_success(5.0, 5);
        assert!(state.health_score() >= before);
    }

    #[test]
    fn error_does_not_increase_health_score_p7() {
        let mut state = SubProviderState::new(100, 1000, 100_000, 5);
        state.record_success(10.0, 5);
        let before = state.health_score();
        state.record_error(ErrorType::ServerError, None);
        assert!(state.health_score() <= before);
    }

    #[test]
    fn record_success_accumulates_total_token_usage() {
        let mut state = SubProviderState::new(100, 1000, 100_000, 5);
        state.record_success(10.0, 120);
        state.record_success(10.0, 80);
        assert_eq!(state.total_token_usage(), 200);
    }

    #[test]
    fn window_entries_never_outlive_sixty_seconds_p4() {
        let mut window = RollingWindow::default();
        let old_stamp = minute_stamp(now_ms()) - 3 * WINDOW_SPAN_MS;
        window.buckets.push_back(Bucket {
            minute_stamp: old_stamp,
            count: 5,
        });
        window.cleanup(now_ms());
        assert!(window.buckets.is_empty());
    }
}

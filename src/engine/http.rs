// Lucy Engine — HTTP Retry & Circuit Breakers
//
// Shared retry utilities used by the model router, the broker/gateway
// clients, and the Slack bridge.
//
// Features:
//   • Exponential backoff with ±25% jitter (base 1s, max 30s, 3 retries)
//   • Retry on 429 (rate limit), 500, 502, 503, 504, 529
//   • Respects `Retry-After` header
//   • Bridge reconnect helper with escalating backoff + cap
//   • Per-service circuit breakers: CLOSED / OPEN / HALF_OPEN with a
//     single concurrent probe while half-open

use crate::atoms::constants::{BREAKER_COOLDOWN, BREAKER_FAILURE_THRESHOLD, BRIDGE_MAX_RECONNECT_DELAY};
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

// ── Constants ──────────────────────────────────────────────────────────────

/// Default maximum number of retry attempts per request.
pub const MAX_RETRIES: u32 = 3;

/// Initial retry delay in milliseconds (doubles each attempt).
const INITIAL_RETRY_DELAY_MS: u64 = 1_000;

/// Maximum retry delay cap in milliseconds (30 seconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

// ── Retryable status detection ─────────────────────────────────────────────

/// Check if an HTTP status code represents a transient/retryable error.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

// ── Backoff delay ──────────────────────────────────────────────────────────

/// Sleep with exponential backoff + ±25% jitter.
/// Respects Retry-After if the server sent one.
/// Returns the actual delay duration for logging.
pub async fn retry_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let base_ms = INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt.min(10));
    let capped_ms = base_ms.min(MAX_RETRY_DELAY_MS);
    let delay_ms = if let Some(secs) = retry_after_secs {
        // Use server-specified delay, but cap at 60s and floor at our backoff
        (secs.min(60) * 1000).max(capped_ms)
    } else {
        capped_ms
    };
    let delay = Duration::from_millis(apply_jitter(delay_ms));
    tokio::time::sleep(delay).await;
    delay
}

/// Compute exponential backoff delay for Slack bridge reconnection.
/// Caps at 120s. `attempt` is 0-based.
pub async fn reconnect_delay(attempt: u32) -> Duration {
    let base_ms = INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt.min(12));
    let capped_ms = base_ms.min(BRIDGE_MAX_RECONNECT_DELAY.as_millis() as u64);
    let delay = Duration::from_millis(apply_jitter(capped_ms));
    tokio::time::sleep(delay).await;
    delay
}

/// Apply ±25% jitter to prevent thundering-herd effects.
fn apply_jitter(base_ms: u64) -> u64 {
    let jitter_range = (base_ms / 4) as i64;
    if jitter_range == 0 {
        return base_ms.max(100);
    }
    let offset = (clock_jitter() % (2 * jitter_range + 1)) - jitter_range;
    (base_ms as i64 + offset).max(100) as u64
}

/// Simple jitter source using system clock nanos (no extra crate needed).
fn clock_jitter() -> i64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as i64
}

// ── Retry-After header parsing ─────────────────────────────────────────────

/// Parse a Retry-After header value (integer seconds only).
/// HTTP-date format is not implemented — falls back to computed backoff.
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}

// ── Circuit Breaker ────────────────────────────────────────────────────────
//
// States:
//   CLOSED     — calls pass through normally.
//   OPEN       — calls fast-fail without hitting the service.
//   HALF_OPEN  — cooldown expired, one probe call allowed.
//
// Transitions:
//   CLOSED  → OPEN       when consecutive failures >= threshold.
//   OPEN    → HALF_OPEN  after cooldown elapses.
//   HALF_OPEN → CLOSED   on probe success.
//   HALF_OPEN → OPEN     on probe failure (timer resets).

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            name: name.into(),
            failure_threshold,
            cooldown,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when failures >= threshold and the cooldown has NOT elapsed.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        if state.consecutive_failures < self.failure_threshold {
            return false;
        }
        match state.last_failure {
            Some(at) => at.elapsed() < self.cooldown,
            None => false,
        }
    }

    /// Return true if the call may proceed: circuit CLOSED, or HALF_OPEN
    /// with no other probe in flight. In HALF_OPEN only one concurrent
    /// probe is admitted so a recovering service is not stampeded.
    pub fn should_allow_request(&self) -> bool {
        let mut state = self.state.lock();
        if state.consecutive_failures < self.failure_threshold {
            return true;
        }
        let cooled_down = state
            .last_failure
            .map(|at| at.elapsed() >= self.cooldown)
            .unwrap_or(true);
        if cooled_down && !state.probe_in_flight {
            state.probe_in_flight = true;
            info!("[breaker] {} half-open, probe admitted", self.name);
            return true;
        }
        false
    }

    /// Record a successful request — closes the circuit.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.probe_in_flight = false;
        if state.consecutive_failures > 0 {
            info!(
                "[breaker] {} closed after {} previous failures",
                self.name, state.consecutive_failures
            );
        }
        state.consecutive_failures = 0;
        state.last_failure = None;
    }

    /// Record a failed request. Reaching the threshold trips the circuit.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.probe_in_flight = false;
        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());
        if state.consecutive_failures == self.failure_threshold {
            warn!(
                "[breaker] {} opened after {} consecutive failures (cooldown {}s)",
                self.name,
                state.consecutive_failures,
                self.cooldown.as_secs()
            );
        }
    }
}

// ── Breaker Registry ───────────────────────────────────────────────────────

/// Process-wide registry of per-service circuit breakers.
/// Lookup creates a breaker with the default thresholds on first use.
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        BreakerRegistry {
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_service(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock();
        map.entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    service,
                    BREAKER_FAILURE_THRESHOLD,
                    BREAKER_COOLDOWN,
                ))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [429, 500, 502, 503, 504, 529] {
            assert!(is_retryable_status(status), "{status} should be retryable");
        }
        for status in [200, 400, 401, 403, 404, 422] {
            assert!(!is_retryable_status(status), "{status} should not be retryable");
        }
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("30"), Some(30));
        assert_eq!(parse_retry_after(" 5 "), Some(5));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015"), None);
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let b = CircuitBreaker::new("test", 3, Duration::from_secs(60));
        assert!(b.should_allow_request());
        b.record_failure();
        b.record_failure();
        assert!(b.should_allow_request());
        b.record_failure();
        assert!(b.is_open());
        assert!(!b.should_allow_request());
    }

    #[test]
    fn test_breaker_single_probe_after_cooldown() {
        let b = CircuitBreaker::new("test", 2, Duration::from_millis(10));
        b.record_failure();
        b.record_failure();
        assert!(!b.should_allow_request());

        std::thread::sleep(Duration::from_millis(15));
        // First caller gets the probe; a concurrent second caller does not.
        assert!(b.should_allow_request());
        assert!(!b.should_allow_request());

        b.record_success();
        assert!(b.should_allow_request());
        assert!(!b.is_open());
    }

    #[test]
    fn test_breaker_probe_failure_reopens() {
        let b = CircuitBreaker::new("test", 2, Duration::from_millis(10));
        b.record_failure();
        b.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert!(b.should_allow_request());
        b.record_failure();
        // Timer reset: closed again only after another cooldown.
        assert!(!b.should_allow_request());
        std::thread::sleep(Duration::from_millis(15));
        assert!(b.should_allow_request());
    }

    #[test]
    fn test_registry_reuses_instances() {
        let reg = BreakerRegistry::new();
        let a = reg.for_service("composio");
        let b = reg.for_service("composio");
        assert!(Arc::ptr_eq(&a, &b));
    }
}

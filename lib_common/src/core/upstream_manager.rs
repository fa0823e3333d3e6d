//! # Upstream Manager
//!
//! The lifecycle of the single upstream connection as an explicit state
//! machine. The connection task reports what happened (`begin_connect`,
//! `on_connected`, `on_closed`, `on_error`) and asks what to do next
//! (`schedule_reconnect`). The manager owns no sockets and no timers, which
//! keeps every transition testable with synthetic `Instant`s.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Closed|Errored -> ReconnectScheduled -> Connecting
//!                                                          \-> CircuitOpen -> ReconnectScheduled
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;

/// Backoff and circuit-breaker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub floor: Duration,
    pub ceiling: Duration,
    pub multiplier: f64,
    /// Relative jitter applied to each delay, 0.2 = +/-20%.
    pub jitter: f64,
    /// Sliding window over which reconnect attempts are counted.
    pub window: Duration,
    /// Attempts allowed inside `window` before the circuit opens.
    pub max_attempts_in_window: usize,
    pub cooldown: Duration,
    /// Upper bound of the random extra added to `cooldown`.
    pub cooldown_jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            window: Duration::from_secs(60),
            max_attempts_in_window: 10,
            cooldown: Duration::from_secs(30),
            cooldown_jitter: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based).
    ///
    /// `jitter_unit` is a value in `[-1.0, 1.0]` scaling the configured
    /// jitter. The result is always clamped to `[floor, ceiling]`.
    pub fn backoff_delay(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let floor_ms = self.floor.as_millis() as f64;
        let ceiling_ms = self.ceiling.as_millis() as f64;
        let base = floor_ms * self.multiplier.powi(attempt.min(63) as i32);
        let base = base.min(ceiling_ms);
        let jittered = base * (1.0 + self.jitter * jitter_unit.clamp(-1.0, 1.0));
        Duration::from_millis(jittered.clamp(floor_ms, ceiling_ms) as u64)
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
    Errored,
    ReconnectScheduled { attempt: u32, delay: Duration },
    CircuitOpen { until: Instant },
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
            ConnectionState::Errored => "errored",
            ConnectionState::ReconnectScheduled { .. } => "reconnect_scheduled",
            ConnectionState::CircuitOpen { .. } => "circuit_open",
        }
    }
}

/// What the connection task should do after a drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Sleep `delay`, then connect again.
    Retry { attempt: u32, delay: Duration },
    /// Too many attempts in the window; sleep `cooldown`, then call
    /// [`UpstreamManager::close_circuit`].
    CircuitOpen { cooldown: Duration },
}

/// Serializable summary for health endpoints.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamStatus {
    pub state: &'static str,
    pub connected: bool,
    pub circuit_open: bool,
    pub attempt: u32,
    pub attempts_in_window: usize,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct UpstreamManager {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt: u32,
    attempts: VecDeque<Instant>,
    last_error: Option<String>,
}

impl UpstreamManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempt: 0,
            attempts: VecDeque::new(),
            last_error: None,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self.state, ConnectionState::CircuitOpen { .. })
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// Successful handshake; resets the backoff counter.
    pub fn on_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempt = 0;
        self.last_error = None;
    }

    pub fn on_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }

    pub fn on_error(&mut self, reason: impl Into<String>) {
        self.state = ConnectionState::Errored;
        self.last_error = Some(reason.into());
    }

    /// Decides the next step after a drop, using a random jitter.
    pub fn schedule_reconnect(&mut self, now: Instant) -> ReconnectDecision {
        let mut rng = rand::rng();
        let jitter_unit = rng.random_range(-1.0..=1.0);
        let cooldown_extra = rng.random_range(0.0..=1.0);
        self.schedule_reconnect_with(now, jitter_unit, cooldown_extra)
    }

    /// Deterministic variant of [`schedule_reconnect`](Self::schedule_reconnect).
    ///
    /// `cooldown_extra` in `[0, 1]` scales `cooldown_jitter`.
    pub fn schedule_reconnect_with(&mut self, now: Instant, jitter_unit: f64, cooldown_extra: f64) -> ReconnectDecision {
        while let Some(oldest) = self.attempts.front() {
            if now.saturating_duration_since(*oldest) >= self.policy.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }

        if self.attempts.len() >= self.policy.max_attempts_in_window {
            let extra = self.policy.cooldown_jitter.mul_f64(cooldown_extra.clamp(0.0, 1.0));
            let cooldown = self.policy.cooldown + extra;
            self.state = ConnectionState::CircuitOpen { until: now + cooldown };
            return ReconnectDecision::CircuitOpen { cooldown };
        }

        self.attempts.push_back(now);
        let attempt = self.attempt;
        let delay = self.policy.backoff_delay(attempt, jitter_unit);
        self.attempt = self.attempt.saturating_add(1);
        self.state = ConnectionState::ReconnectScheduled { attempt, delay };
        ReconnectDecision::Retry { attempt, delay }
    }

    /// Ends a cooldown: clears the attempt window and restarts backoff.
    pub fn close_circuit(&mut self) {
        self.attempts.clear();
        self.attempt = 0;
        self.state = ConnectionState::ReconnectScheduled {
            attempt: 0,
            delay: Duration::ZERO,
        };
    }

    /// Attempts currently counted in the sliding window.
    pub fn attempts_in_window(&self) -> usize {
        self.attempts.len()
    }

    pub fn status(&self) -> UpstreamStatus {
        UpstreamStatus {
            state: self.state.label(),
            connected: self.is_connected(),
            circuit_open: self.is_circuit_open(),
            attempt: self.attempt,
            attempts_in_window: self.attempts.len(),
            last_error: self.last_error.clone(),
        }
    }
}

impl Default for UpstreamManager {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_bounds() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff_delay(0, 0.0), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(1, 0.0), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_delay(3, 0.0), Duration::from_millis(4_000));
        assert_eq!(policy.backoff_delay(20, 0.0), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_twenty_percent_and_bounds() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff_delay(2, 1.0), Duration::from_millis(2_400));
        assert_eq!(policy.backoff_delay(2, -1.0), Duration::from_millis(1_600));
        // Floor and ceiling win over jitter.
        assert_eq!(policy.backoff_delay(0, -1.0), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(30, 1.0), Duration::from_secs(30));
    }

    #[test]
    fn successful_connect_resets_attempts() {
        let mut manager = UpstreamManager::default();
        let now = Instant::now();

        manager.on_error("refused");
        manager.schedule_reconnect_with(now, 0.0, 0.0);
        let second = manager.schedule_reconnect_with(now, 0.0, 0.0);
        assert_eq!(second, ReconnectDecision::Retry { attempt: 1, delay: Duration::from_millis(1_000) });

        manager.begin_connect();
        manager.on_connected();
        assert!(manager.is_connected());

        manager.on_closed();
        let next = manager.schedule_reconnect_with(now, 0.0, 0.0);
        assert_eq!(next, ReconnectDecision::Retry { attempt: 0, delay: Duration::from_millis(500) });
    }

    #[test]
    fn circuit_opens_when_window_is_full() {
        let mut manager = UpstreamManager::default();
        let start = Instant::now();

        for i in 0..10 {
            let decision = manager.schedule_reconnect_with(start + Duration::from_secs(i), 0.0, 0.0);
            assert!(matches!(decision, ReconnectDecision::Retry { .. }));
            assert!(manager.attempts_in_window() <= 10);
        }

        let decision = manager.schedule_reconnect_with(start + Duration::from_secs(10), 0.0, 1.0);
        assert_eq!(decision, ReconnectDecision::CircuitOpen { cooldown: Duration::from_secs(35) });
        assert!(manager.is_circuit_open());
        assert_eq!(manager.attempts_in_window(), 10);

        manager.close_circuit();
        assert_eq!(manager.attempts_in_window(), 0);
        let resumed = manager.schedule_reconnect_with(start + Duration::from_secs(45), 0.0, 0.0);
        assert_eq!(resumed, ReconnectDecision::Retry { attempt: 0, delay: Duration::from_millis(500) });
    }

    #[test]
    fn old_attempts_slide_out_of_the_window() {
        let mut manager = UpstreamManager::default();
        let start = Instant::now();

        for i in 0..10 {
            manager.schedule_reconnect_with(start + Duration::from_secs(i), 0.0, 0.0);
        }
        // Attempt #0 (at t=0) is now 60s old and drops out.
        let decision = manager.schedule_reconnect_with(start + Duration::from_secs(60), 0.0, 0.0);
        assert!(matches!(decision, ReconnectDecision::Retry { .. }));
        assert_eq!(manager.attempts_in_window(), 10);
    }

    #[test]
    fn window_never_exceeds_cap_under_rapid_failures() {
        let mut manager = UpstreamManager::default();
        let start = Instant::now();
        for i in 0..200u64 {
            let now = start + Duration::from_millis(i * 250);
            if let ReconnectDecision::CircuitOpen { .. } = manager.schedule_reconnect_with(now, 0.5, 0.5) {
                manager.close_circuit();
            }
            assert!(manager.attempts_in_window() <= manager.policy().max_attempts_in_window);
        }
    }

    #[test]
    fn status_reports_last_error() {
        let mut manager = UpstreamManager::default();
        manager.on_error("tls handshake failed");
        let status = manager.status();
        assert_eq!(status.state, "errored");
        assert!(!status.connected);
        assert_eq!(status.last_error.as_deref(), Some("tls handshake failed"));
    }
}

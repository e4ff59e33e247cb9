/// Three-state circuit breaker guarding backplane calls
///
/// Closed -> Open after `failure_threshold` consecutive failures. Open -> HalfOpen
/// once `open_timeout` has elapsed, admitting one probe at a time. HalfOpen ->
/// Closed after `success_threshold` consecutive successes, or back to Open on
/// any probe failure. The breaker is independent of connection state.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings: BreakerSettings {
                failure_threshold: settings.failure_threshold.max(1),
                success_threshold: settings.success_threshold.max(1),
                open_timeout: settings.open_timeout,
            },
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            probe_started: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a remote call may be attempted now
    ///
    /// An expired Open circuit moves to HalfOpen here. In HalfOpen only one
    /// probe is admitted at a time; a probe whose outcome was never reported is
    /// considered lost after `open_timeout`.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = self
                    .opened_at
                    .map_or(true, |opened| now.duration_since(opened) >= self.settings.open_timeout);
                if !cooled_down {
                    return false;
                }
                tracing::info!("🔌 Circuit half-open, admitting probe");
                self.state = CircuitState::HalfOpen;
                self.consecutive_successes = 0;
                self.probe_started = Some(now);
                true
            }
            CircuitState::HalfOpen => match self.probe_started {
                Some(started) if now.duration_since(started) < self.settings.open_timeout => false,
                _ => {
                    self.probe_started = Some(now);
                    true
                }
            },
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state == CircuitState::HalfOpen {
            self.probe_started = None;
            self.consecutive_successes += 1;
            if self.consecutive_successes >= self.settings.success_threshold {
                tracing::info!("✅ Circuit closed after {} successful probes", self.consecutive_successes);
                self.state = CircuitState::Closed;
                self.consecutive_successes = 0;
                self.opened_at = None;
            }
        }
    }

    /// Record a failed call; returns true when this failure tripped the circuit
    pub fn on_failure(&mut self) -> bool {
        self.consecutive_successes = 0;
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.settings.failure_threshold {
                    tracing::warn!(
                        "⚡ Circuit opened after {} consecutive failures",
                        self.consecutive_failures
                    );
                    self.trip();
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                tracing::warn!("⚡ Probe failed, circuit re-opened");
                self.trip();
                true
            }
            CircuitState::Open => false,
        }
    }

    fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.probe_started = None;
        self.consecutive_failures = 0;
    }
}

//! Circuit breakers guarding acquisition.
//!
//! Two instances protect the scheduler: one watches store connectivity and
//! one watches the batch acquisition path. Each counts failures inside a
//! sliding window; crossing the threshold opens the breaker, a cooldown
//! later a single probe is let through, and its outcome either closes the
//! breaker or re-opens it.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use std::collections::VecDeque;

use tracing::{info, warn};

use crate::settings::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
    pub probe_timeout: Duration,
}

impl BreakerSettings {
    pub fn from_config(cfg: &BreakerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            failure_window: Duration::from_millis(cfg.failure_window_ms),
            cooldown: Duration::from_millis(cfg.cooldown_ms),
            probe_timeout: Duration::from_millis(cfg.probe_timeout_ms),
        }
    }

    /// Tighter settings for the store-connectivity breaker. A store that
    /// cannot answer takes every other path down with it, so it trips
    /// earlier and probes sooner than the acquisition breaker.
    pub fn derive_store(&self) -> Self {
        Self {
            failure_threshold: self.failure_threshold.saturating_sub(2).max(3),
            failure_window: self.failure_window.min(Duration::from_millis(5_000)),
            cooldown: self.cooldown.mul_f64(0.7),
            probe_timeout: self.probe_timeout.mul_f64(0.6),
        }
    }
}

struct Inner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
}

pub struct CircuitBreaker {
    name: &'static str,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, settings: BreakerSettings) -> Self {
        Self {
            name,
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_started: None,
            }),
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// In `Open`, returns false until the cooldown elapses, then flips to
    /// `HalfOpen` and admits exactly one probe. In `HalfOpen`, admits a new
    /// probe only after the previous one timed out without reporting back.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|at| now.duration_since(at));
                if elapsed.is_some_and(|e| e >= self.settings.cooldown) {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_started = Some(now);
                    info!(breaker = self.name, "breaker: cooldown elapsed, probing");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                let stale = inner
                    .probe_started
                    .is_none_or(|at| now.duration_since(at) >= self.settings.probe_timeout);
                if stale {
                    inner.probe_started = Some(now);
                }
                stale
            }
        }
    }

    /// Report a successful call. Closes the breaker (resetting the window)
    /// after a probe; in `Closed` it leaves the failure tally alone so the
    /// sliding window stays purely time-based.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::Closed {
            return;
        }
        info!(breaker = self.name, "breaker: closed after successful probe");
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.probe_started = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.probe_started = None;
                warn!(breaker = self.name, "breaker: probe failed, re-opened");
            }
            BreakerState::Open => {
                // Already open; nothing to count.
            }
            BreakerState::Closed => {
                inner.failures.push_back(now);
                let horizon = now - self.settings.failure_window;
                while inner.failures.front().is_some_and(|&at| at < horizon) {
                    inner.failures.pop_front();
                }
                if inner.failures.len() as u32 >= self.settings.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                    warn!(
                        breaker = self.name,
                        threshold = self.settings.failure_threshold,
                        "breaker: failure threshold crossed, opened"
                    );
                }
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Force the breaker back to `Closed`, dropping all failure history.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.probe_started = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

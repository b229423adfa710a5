//! Per-key failure-rate circuit breakers.
//!
//! State machine:
//! - `Closed -> Open` once `failure_threshold` failures land inside `time_window_secs`.
//! - `Open -> HalfOpen` on the first `allow` after `cooldown_secs` have elapsed;
//!   that call is the single trial request and returns `true`.
//! - `HalfOpen -> Closed` on success, `HalfOpen -> Open` on failure.
//! - `HalfOpen -> Open` with the cooldown already served when an unused trial
//!   is released.
//!
//! [`CircuitBreaker::would_allow`] answers the same question as `allow`
//! without claiming the trial, so a check can consult every governing
//! breaker before committing to any of them.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rg_types::signal::TradingSignal;

use crate::config::secs_delta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half-open"),
        }
    }
}

/// A governing breaker that currently refuses requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingBreaker {
    pub key: String,
    pub state: CircuitState,
}

impl BlockingBreaker {
    /// Human-readable reason, e.g. for a violation message.
    pub fn describe(&self) -> String {
        match self.state {
            CircuitState::HalfOpen => {
                format!("circuit breaker {} is half-open with a trial request in flight", self.key)
            }
            state => format!("circuit breaker {} is {state}", self.key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub time_window_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            time_window_secs: 60,
            cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub id: String,
    pub config: CircuitBreakerConfig,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Start of the current failure-counting window.
    pub window_start: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
    /// Lifetime number of `Closed/HalfOpen -> Open` transitions.
    pub trip_count: u64,
}

impl CircuitBreaker {
    pub fn new(id: &str, config: CircuitBreakerConfig, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            window_start: None,
            last_failure: None,
            last_state_change: now,
            trip_count: 0,
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.last_failure = Some(now);
        match self.state {
            CircuitState::Open => {}
            CircuitState::HalfOpen => self.trip(now),
            CircuitState::Closed => {
                let window = secs_delta(self.config.time_window_secs);
                match self.window_start {
                    Some(start) if now - start <= window => self.failure_count += 1,
                    _ => {
                        self.window_start = Some(now);
                        self.failure_count = 1;
                    }
                }
                if self.failure_count >= self.config.failure_threshold {
                    self.trip(now);
                }
            }
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        match self.state {
            CircuitState::Open => {}
            CircuitState::Closed => self.reset_window(),
            CircuitState::HalfOpen => {
                self.reset_window();
                self.transition(CircuitState::Closed, now);
                info!(breaker = %self.id, "circuit breaker closed after successful trial");
            }
        }
    }

    /// Whether `allow` would let a request through at `now`. Never changes
    /// state.
    pub fn would_allow(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed => true,
            // The trial request is already in flight.
            CircuitState::HalfOpen => false,
            CircuitState::Open => self.cooldown_elapsed(now),
        }
    }

    /// Whether a request may pass. May move `Open -> HalfOpen`.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        if !self.would_allow(now) {
            return false;
        }
        if self.state == CircuitState::Open {
            self.transition(CircuitState::HalfOpen, now);
            info!(breaker = %self.id, "circuit breaker half-open, allowing trial request");
        }
        true
    }

    /// Give back a trial claimed by `allow` whose request never ran. The
    /// breaker returns to Open and can hand out the trial again right away.
    pub fn release_trial(&mut self, now: DateTime<Utc>) {
        if self.state != CircuitState::HalfOpen {
            return;
        }
        let served = now
            .checked_sub_signed(self.cooldown())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.transition(CircuitState::Open, served);
        info!(breaker = %self.id, "unused trial released, circuit breaker open");
    }

    fn cooldown(&self) -> Duration {
        secs_delta(self.config.cooldown_secs)
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        now - self.last_state_change >= self.cooldown()
    }

    fn trip(&mut self, now: DateTime<Utc>) {
        self.transition(CircuitState::Open, now);
        self.trip_count += 1;
        self.reset_window();
        warn!(
            breaker = %self.id,
            trips = self.trip_count,
            "circuit breaker opened"
        );
    }

    fn reset_window(&mut self) {
        self.failure_count = 0;
        self.window_start = None;
    }

    fn transition(&mut self, state: CircuitState, now: DateTime<Utc>) {
        self.state = state;
        self.last_state_change = now;
    }
}

/// Concurrent table of breakers keyed by name.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, CircuitBreaker>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub const GLOBAL_KEY: &'static str = "global";

    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Breaker keys that govern a signal, broadest first.
    pub fn keys_for(signal: &TradingSignal) -> Vec<String> {
        vec![
            Self::GLOBAL_KEY.to_string(),
            format!("strategy:{}", signal.strategy_id),
            format!("symbol:{}", signal.symbol),
            format!("exchange:{}", signal.exchange),
        ]
    }

    /// Register a breaker with its own config, replacing any existing one.
    pub fn register(&self, key: &str, config: CircuitBreakerConfig) {
        self.breakers
            .insert(key.to_string(), CircuitBreaker::new(key, config, Utc::now()));
    }

    pub fn record_failure(&self, key: &str) {
        self.record_failure_at(key, Utc::now());
    }

    pub fn record_failure_at(&self, key: &str, now: DateTime<Utc>) {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(key, self.default_config.clone(), now))
            .record_failure(now);
    }

    pub fn record_success(&self, key: &str) {
        self.record_success_at(key, Utc::now());
    }

    pub fn record_success_at(&self, key: &str, now: DateTime<Utc>) {
        if let Some(mut breaker) = self.breakers.get_mut(key) {
            breaker.record_success(now);
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Utc::now())
    }

    /// Unknown keys are always allowed.
    pub fn allow_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        match self.breakers.get_mut(key) {
            Some(mut breaker) => breaker.allow(now),
            None => true,
        }
    }

    /// Read-only counterpart of [`allow_at`](Self::allow_at).
    pub fn would_allow_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.breakers
            .get(key)
            .map(|b| b.would_allow(now))
            .unwrap_or(true)
    }

    /// Governing breakers among `keys` that would refuse a request at `now`,
    /// in `keys` order.
    pub fn blocking_at(&self, keys: &[String], now: DateTime<Utc>) -> Vec<BlockingBreaker> {
        keys.iter()
            .filter_map(|key| {
                let breaker = self.breakers.get(key)?;
                (!breaker.would_allow(now)).then(|| BlockingBreaker {
                    key: key.clone(),
                    state: breaker.state,
                })
            })
            .collect()
    }

    /// Let one request through every breaker in `keys`, claiming the trial of
    /// each breaker whose cooldown has elapsed. Either every breaker allows
    /// the request or none is left half-open by this call: on refusal the
    /// trials claimed so far are released and the refusing breaker returned.
    pub fn claim_at(&self, keys: &[String], now: DateTime<Utc>) -> Result<(), BlockingBreaker> {
        let mut claimed: Vec<&String> = Vec::new();
        for key in keys {
            let refused = match self.breakers.get_mut(key) {
                None => None,
                Some(mut breaker) => {
                    let was_open = breaker.state == CircuitState::Open;
                    if breaker.allow(now) {
                        if was_open {
                            claimed.push(key);
                        }
                        None
                    } else {
                        Some(BlockingBreaker {
                            key: key.clone(),
                            state: breaker.state,
                        })
                    }
                }
            };
            if let Some(blocking) = refused {
                for key in claimed {
                    if let Some(mut breaker) = self.breakers.get_mut(key) {
                        breaker.release_trial(now);
                    }
                }
                return Err(blocking);
            }
        }
        Ok(())
    }

    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.breakers.get(key).map(|b| b.state)
    }

    pub fn get(&self, key: &str) -> Option<CircuitBreaker> {
        self.breakers.get(key).map(|b| b.clone())
    }

    /// Names of all breakers currently open, sorted.
    pub fn open_breakers(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .breakers
            .iter()
            .filter(|b| b.state == CircuitState::Open)
            .map(|b| b.key().clone())
            .collect();
        open.sort();
        open
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

//! Dial cooldown gate
//!
//! A two-state circuit breaker around upstream dials: after
//! `open_threshold` consecutive failures the target goes on cooldown for
//! `reconnect_timeout`, during which dial attempts fail fast instead of
//! burning a connect timeout per client. Any success resets the failure
//! count.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct CooldownConfig {
    /// Consecutive failures before the gate opens.
    pub open_threshold: u32,
    /// How long the gate stays open.
    pub reconnect_timeout: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            open_threshold: 5,
            reconnect_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    failures: u32,
    cooldown_until: Option<Instant>,
}

#[derive(Debug)]
pub struct CooldownGate {
    state: Mutex<GateState>,
    config: CooldownConfig,
}

impl CooldownGate {
    pub fn new(config: CooldownConfig) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            config,
        }
    }

    /// Whether a dial attempt may proceed right now.
    pub fn permits(&self) -> bool {
        let mut state = self.state.lock();

        match state.cooldown_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                // Cooldown elapsed; the next attempt probes the target.
                state.cooldown_until = None;
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.failures = 0;
        state.cooldown_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failures += 1;

        if state.failures >= self.config.open_threshold {
            state.cooldown_until = Some(Instant::now() + self.config.reconnect_timeout);
            state.failures = 0;
        }
    }

    /// Currently refusing dials.
    pub fn is_open(&self) -> bool {
        !self.permits()
    }
}

//! Request pacing for the single shared session.
//!
//! Every remote call waits here first. The governor keeps one global schedule:
//! a minimum jittered spacing between requests, a cooldown set by the remote's
//! own flood-wait directive, and an interval that doubles on repeated rate-limit
//! signals and falls back to base after a streak of successes.

use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use rollcall_common::{GovernorConfig, Result, RollcallError};

use crate::stop::StopSignal;

struct GovernorState {
    /// Earliest instant the next slot may be granted by spacing alone.
    next_slot: Instant,
    cooldown_until: Option<Instant>,
    interval: Duration,
    consecutive_limits: u32,
    success_streak: u32,
}

pub struct RateGovernor {
    config: GovernorConfig,
    state: Mutex<GovernorState>,
    stop: StopSignal,
}

impl RateGovernor {
    pub fn new(config: GovernorConfig, stop: StopSignal) -> Self {
        let interval = config.base_interval;
        Self {
            config,
            state: Mutex::new(GovernorState {
                next_slot: Instant::now(),
                cooldown_until: None,
                interval,
                consecutive_limits: 0,
                success_streak: 0,
            }),
            stop,
        }
    }

    /// Wait until a request may be issued.
    ///
    /// Callers queue on the state lock (FIFO) and the lock is held across the
    /// sleep, so at most one caller is ever between "waiting" and "granted".
    /// Returns `Cancelled` once a stop has been requested, even mid-sleep.
    pub async fn acquire_slot(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.stop.is_stopped() {
            return Err(RollcallError::Cancelled);
        }

        let mut ready_at = state.next_slot;
        if let Some(until) = state.cooldown_until {
            ready_at = ready_at.max(until);
        }

        if ready_at > Instant::now() {
            debug!(
                wait_ms = ready_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Pacing before next request"
            );
            tokio::select! {
                _ = tokio::time::sleep_until(ready_at) => {}
                _ = self.stop.stopped() => return Err(RollcallError::Cancelled),
            }
        }
        if self.stop.is_stopped() {
            return Err(RollcallError::Cancelled);
        }

        state.cooldown_until = None;
        let spacing = self.jittered(state.interval);
        state.next_slot = Instant::now() + spacing;
        Ok(())
    }

    /// Apply the remote's wait directive to every caller.
    pub async fn report_rate_limited(&self, wait: Duration) {
        let mut state = self.state.lock().await;
        state.success_streak = 0;
        state.consecutive_limits += 1;
        if state.consecutive_limits > 1 {
            let grown = state.interval.mul_f64(self.config.backoff_multiplier);
            state.interval = grown.min(self.config.max_interval);
        }

        let cooldown = wait.max(state.interval);
        let until = Instant::now() + cooldown;
        state.cooldown_until = Some(match state.cooldown_until {
            Some(existing) => existing.max(until),
            None => until,
        });

        warn!(
            wait_secs = wait.as_secs(),
            cooldown_secs = cooldown.as_secs_f64(),
            interval_ms = state.interval.as_millis() as u64,
            consecutive = state.consecutive_limits,
            "Rate limit signal, cooling down"
        );
    }

    pub async fn report_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_limits = 0;
        state.success_streak += 1;
        if state.interval > self.config.base_interval
            && state.success_streak >= self.config.success_streak_to_reset
        {
            info!(
                streak = state.success_streak,
                "Success streak reached, pacing back to base interval"
            );
            state.interval = self.config.base_interval;
            state.success_streak = 0;
        }
    }

    pub async fn current_interval(&self) -> Duration {
        self.state.lock().await.interval
    }

    /// Time left before the cooldown (not counting ordinary spacing) expires.
    pub async fn cooldown_remaining(&self) -> Duration {
        let state = self.state.lock().await;
        state
            .cooldown_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    fn jittered(&self, interval: Duration) -> Duration {
        let jitter = self.config.jitter;
        if jitter <= 0.0 {
            return interval;
        }
        let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
        interval.mul_f64(factor.max(0.0))
    }
}

//! Process-wide run statistics.
//!
//! The aggregate is an immutable `RunStats` behind an `ArcSwap`. Writers build
//! a modified copy and swap it in, so a reader's `snapshot()` is always one
//! whole version, never a half-applied update.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use tokio::time::Instant;
use tracing::info;

use rollcall_common::{AddOutcome, RunStats, RunStatus, ScrapeOutcome};

use crate::stop::StopSignal;

struct TickState {
    last_at: Instant,
    last_processed: u64,
}

pub struct StatsAggregator {
    current: ArcSwap<RunStats>,
    smoothing: f64,
    tick: Mutex<TickState>,
}

impl StatsAggregator {
    pub fn new(smoothing: f64) -> Self {
        Self {
            current: ArcSwap::new(Arc::new(RunStats::new(Utc::now()))),
            smoothing,
            tick: Mutex::new(TickState {
                last_at: Instant::now(),
                last_processed: 0,
            }),
        }
    }

    pub fn snapshot(&self) -> Arc<RunStats> {
        self.current.load_full()
    }

    pub fn record_scrape_result(&self, outcome: ScrapeOutcome) {
        self.update(|stats| {
            stats.total_processed += 1;
            match outcome {
                ScrapeOutcome::Scraped => stats.successful_scrapes += 1,
                ScrapeOutcome::Filtered => stats.failed_scrapes += 1,
            }
        });
    }

    pub fn record_add_result(&self, outcome: AddOutcome) {
        self.update(|stats| {
            let add = &mut stats.auto_add_stats;
            add.total_attempts += 1;
            match outcome {
                AddOutcome::Success => add.successful_adds += 1,
                AddOutcome::AlreadyMember => add.already_member += 1,
                AddOutcome::RateLimited => add.rate_limited += 1,
                AddOutcome::Forbidden | AddOutcome::Failed => add.failed += 1,
            }
        });
    }

    pub fn record_bandwidth(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.update(|stats| stats.bandwidth_used += bytes);
    }

    /// Group size as reported by the remote, capped by any configured maximum.
    pub fn set_known_total(&self, total: u64) {
        self.update(|stats| stats.known_total = Some(total));
    }

    /// Recompute `current_rate` and `estimated_time_remaining`.
    ///
    /// Called by the reporter on a fixed interval, not per event, so bursty
    /// completions are smoothed over whole ticks.
    pub fn tick(&self) {
        let now = Instant::now();
        let processed = self.current.load().total_processed;
        let instant_rate = {
            let mut tick = self.tick.lock().unwrap_or_else(|e| e.into_inner());
            let elapsed = now.saturating_duration_since(tick.last_at).as_secs_f64();
            if elapsed <= 0.0 {
                return;
            }
            let rate = processed.saturating_sub(tick.last_processed) as f64 / elapsed;
            tick.last_at = now;
            tick.last_processed = processed;
            rate
        };

        let alpha = self.smoothing;
        self.update(|stats| {
            stats.current_rate = alpha * instant_rate + (1.0 - alpha) * stats.current_rate;
            stats.estimated_time_remaining = estimate_remaining(stats);
        });
    }

    /// Move to a terminal status. The first terminal status wins.
    pub fn finish(&self, status: RunStatus) {
        self.update(|stats| {
            if !stats.status.is_terminal() {
                stats.status = status.clone();
            }
        });
        let stats = self.snapshot();
        info!(status = ?stats.status, "Run finished. {stats}");
    }

    /// Tick every `interval` until `stop` fires or the run reaches a terminal status.
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration, stop: StopSignal) -> tokio::task::JoinHandle<()> {
        let stats = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        stats.tick();
                        if stats.snapshot().status.is_terminal() {
                            break;
                        }
                    }
                    _ = stop.stopped() => break,
                }
            }
        })
    }

    fn update(&self, apply: impl Fn(&mut RunStats)) {
        self.current.rcu(|current| {
            let mut next = RunStats::clone(current);
            apply(&mut next);
            next
        });
    }
}

fn estimate_remaining(stats: &RunStats) -> Option<f64> {
    let total = stats.known_total?;
    if stats.current_rate <= 0.0 {
        return None;
    }
    let remaining = total.saturating_sub(stats.total_processed) as f64;
    Some(remaining / stats.current_rate)
}

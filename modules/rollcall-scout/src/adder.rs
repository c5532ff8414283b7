//! Auto-add stage.
//!
//! Records flow in FIFO order into a pending queue. Each add consumes a slot in
//! a rolling window (`max_adds_per_window` per `window`) that is separate from
//! the session's request pacing; when the window is full records stay queued
//! until the oldest slot ages out. Retryable outcomes go to the back of the
//! queue.
//!
//! Per uid: `Pending -> Attempting -> {Success, AlreadyMember, Forbidden,
//! Failed, RateLimited(retry) -> Pending}`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::try_stream;
use chrono::Utc;
use futures::{pin_mut, Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use rollcall_common::{AddAttempt, AddOutcome, AutoAddConfig, MemberRecord, Result, Uid};

use crate::progress::ProgressStore;
use crate::session::SessionClient;
use crate::stats::StatsAggregator;
use crate::stop::StopSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddState {
    Pending,
    Attempting,
    /// Waiting in the queue for retry number `retry_count`.
    RateLimited { retry_count: u32 },
    Success,
    AlreadyMember,
    Forbidden,
    Failed,
}

impl AddState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AddState::Success | AddState::AlreadyMember | AddState::Forbidden | AddState::Failed
        )
    }
}

/// What `attempt_next` did.
#[derive(Debug, Clone, PartialEq)]
pub enum NextAdd {
    Attempted(AddAttempt),
    /// The window is full; the head of the queue may go at `until`.
    Deferred { until: Instant },
    Idle,
}

struct QueuedAdd {
    record: MemberRecord,
    retry_count: u32,
}

/// Sliding log of grant times.
struct AddWindow {
    limit: usize,
    period: Duration,
    granted: VecDeque<Instant>,
}

impl AddWindow {
    fn new(limit: u32, period: Duration) -> Self {
        Self {
            limit: limit as usize,
            period,
            granted: VecDeque::new(),
        }
    }

    fn try_acquire(&mut self, now: Instant) -> std::result::Result<(), Instant> {
        while let Some(&oldest) = self.granted.front() {
            if now.saturating_duration_since(oldest) >= self.period {
                self.granted.pop_front();
            } else {
                break;
            }
        }
        if self.granted.len() < self.limit {
            self.granted.push_back(now);
            return Ok(());
        }
        match self.granted.front() {
            Some(&oldest) => Err(oldest + self.period),
            None => Err(now + self.period),
        }
    }

    /// Give back the most recent grant (the request was never sent).
    fn release_last(&mut self) {
        self.granted.pop_back();
    }
}

struct AdderState {
    pending: VecDeque<QueuedAdd>,
    states: HashMap<Uid, AddState>,
    window: AddWindow,
}

pub struct AutoAdder {
    session: Arc<SessionClient>,
    progress: Arc<ProgressStore>,
    stats: Arc<StatsAggregator>,
    config: AutoAddConfig,
    state: Mutex<AdderState>,
    stop: StopSignal,
}

impl AutoAdder {
    pub fn new(
        session: Arc<SessionClient>,
        progress: Arc<ProgressStore>,
        stats: Arc<StatsAggregator>,
        config: AutoAddConfig,
        stop: StopSignal,
    ) -> Self {
        let window = AddWindow::new(config.max_adds_per_window, config.window);
        Self {
            session,
            progress,
            stats,
            config,
            state: Mutex::new(AdderState {
                pending: VecDeque::new(),
                states: HashMap::new(),
                window,
            }),
            stop,
        }
    }

    pub fn target_group_id(&self) -> &str {
        &self.config.target_group_id
    }

    /// Queue a record. Returns `false` if the uid was already added (durably)
    /// or has been seen earlier in this run.
    pub fn enqueue(&self, record: MemberRecord) -> bool {
        if self.progress.is_added(record.uid) {
            debug!(uid = record.uid, "Already added in an earlier run, skipping");
            return false;
        }
        let mut state = self.lock();
        if state.states.contains_key(&record.uid) {
            return false;
        }
        state.states.insert(record.uid, AddState::Pending);
        state.pending.push_back(QueuedAdd {
            record,
            retry_count: 0,
        });
        true
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn state_of(&self, uid: Uid) -> Option<AddState> {
        self.lock().states.get(&uid).copied()
    }

    /// Attempt the head of the queue if the window allows it.
    ///
    /// A dead session or a stop request puts the record back at the head and
    /// is returned as the error.
    pub async fn attempt_next(&self) -> Result<NextAdd> {
        let queued = {
            let mut state = self.lock();
            let Some(queued) = state.pending.pop_front() else {
                return Ok(NextAdd::Idle);
            };
            if let Err(until) = state.window.try_acquire(Instant::now()) {
                state.pending.push_front(queued);
                return Ok(NextAdd::Deferred { until });
            }
            state.states.insert(queued.record.uid, AddState::Attempting);
            queued
        };
        let uid = queued.record.uid;

        let outcome = match self
            .session
            .add_member(&self.config.target_group_id, uid)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut state = self.lock();
                state.window.release_last();
                state.states.insert(uid, AddState::Pending);
                state.pending.push_front(queued);
                return Err(e);
            }
        };

        if outcome.is_member() {
            self.progress.mark_added(uid).await?;
        }
        self.stats.record_add_result(outcome);

        let attempt = AddAttempt {
            uid,
            target_group_id: self.config.target_group_id.clone(),
            outcome,
            attempted_at: Utc::now(),
            retry_count: queued.retry_count,
        };

        let next_state = {
            let mut state = self.lock();
            let next_state = match outcome {
                AddOutcome::Success => AddState::Success,
                AddOutcome::AlreadyMember => AddState::AlreadyMember,
                AddOutcome::Forbidden => AddState::Forbidden,
                retryable if retryable.is_retryable() && queued.retry_count < self.config.max_retries => {
                    let retry_count = queued.retry_count + 1;
                    state.pending.push_back(QueuedAdd {
                        record: queued.record,
                        retry_count,
                    });
                    if retryable == AddOutcome::RateLimited {
                        AddState::RateLimited { retry_count }
                    } else {
                        AddState::Pending
                    }
                }
                _ => AddState::Failed,
            };
            state.states.insert(uid, next_state);
            next_state
        };

        match next_state {
            AddState::Failed => warn!(
                uid,
                retry_count = attempt.retry_count,
                "Add failed, giving up on this member"
            ),
            AddState::RateLimited { .. } | AddState::Pending => {
                debug!(uid, outcome = %outcome, "Add requeued")
            }
            _ => info!(uid, outcome = %outcome, target_group = self.config.target_group_id.as_str(), "Add attempted"),
        }

        Ok(NextAdd::Attempted(attempt))
    }

    /// Consume `records` online and yield every attempt made.
    ///
    /// Input keeps being drained into the queue while the window is full.
    /// The stream ends when input is exhausted and the queue is empty, on a
    /// stop request while waiting for the window, or with an error.
    pub fn process<'a, S>(&'a self, records: S) -> impl Stream<Item = Result<AddAttempt>> + 'a
    where
        S: Stream<Item = MemberRecord> + 'a,
    {
        try_stream! {
            let records = records.fuse();
            pin_mut!(records);
            let mut input_done = false;

            loop {
                if !input_done && self.pending_len() == 0 {
                    match records.next().await {
                        Some(record) => {
                            self.enqueue(record);
                            continue;
                        }
                        None => input_done = true,
                    }
                }

                match self.attempt_next().await? {
                    NextAdd::Attempted(attempt) => {
                        yield attempt;
                    }
                    NextAdd::Idle => {
                        if input_done {
                            break;
                        }
                    }
                    NextAdd::Deferred { until } => {
                        info!(
                            pending = self.pending_len(),
                            wait_secs = until.saturating_duration_since(Instant::now()).as_secs(),
                            "Add ceiling reached, holding pending adds"
                        );
                        if input_done {
                            tokio::select! {
                                _ = tokio::time::sleep_until(until) => {}
                                _ = self.stop.stopped() => break,
                            }
                        } else {
                            tokio::select! {
                                next = records.next() => match next {
                                    Some(record) => {
                                        self.enqueue(record);
                                    }
                                    None => input_done = true,
                                },
                                _ = tokio::time::sleep_until(until) => {}
                                _ = self.stop.stopped() => break,
                            }
                        }
                    }
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AdderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

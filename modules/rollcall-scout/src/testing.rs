// Test doubles for the session seam.
//
// MockRemote plays the remote platform: pages are addressed by cursor "0",
// "1", ... (None means page 0), adds succeed unless a scripted failure is
// queued. It records every add call and the peak number of concurrent
// requests so tests can assert pacing and the single in-flight rule.

use std::collections::{HashSet, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use rollcall_common::{
    AutoAddConfig, GovernorConfig, LastSeen, RemoteMember, SessionConfig, Uid,
};

use crate::governor::RateGovernor;
use crate::session::{AddReply, MembersPage, RemoteApi, RemoteError, RemoteResult, SessionClient};
use crate::stop::StopSignal;

/// Build a page of members with the given uids. Members cycle through the
/// last-seen buckets so classification gets exercised.
pub fn page(uids: Range<Uid>) -> MembersPage {
    page_of(uids.collect())
}

pub fn page_of(uids: Vec<Uid>) -> MembersPage {
    let buckets = [
        LastSeen::Online,
        LastSeen::Recently,
        LastSeen::LastWeek,
        LastSeen::LastMonth,
        LastSeen::Unknown,
    ];
    let members = uids
        .into_iter()
        .map(|uid| {
            let mut member = RemoteMember::new(uid);
            member.username = Some(format!("user_{uid}"));
            member.last_seen = Some(buckets[(uid.unsigned_abs() % 5) as usize]);
            member
        })
        .collect();
    MembersPage {
        members,
        next_cursor: None,
        total: None,
        bytes: 0,
    }
}

/// Pacing with no jitter and a short base interval.
pub fn fast_governor() -> GovernorConfig {
    GovernorConfig {
        base_interval: Duration::from_millis(10),
        jitter: 0.0,
        backoff_multiplier: 2.0,
        max_interval: Duration::from_secs(60),
        success_streak_to_reset: 3,
    }
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        max_rate_limit_retries: 3,
        transient_attempts: 3,
        transient_backoff: Duration::from_millis(50),
        page_size: 100,
    }
}

pub fn auto_add_config(max_adds_per_window: u32) -> AutoAddConfig {
    AutoAddConfig {
        max_adds_per_window,
        ..AutoAddConfig::new("target")
    }
}

/// A session client over `remote` with test pacing.
pub fn session(remote: Arc<MockRemote>, stop: StopSignal) -> Arc<SessionClient> {
    let governor = Arc::new(RateGovernor::new(fast_governor(), stop));
    Arc::new(SessionClient::new(remote, governor, session_config()))
}

#[derive(Default)]
struct Script {
    page_failures: VecDeque<RemoteError>,
    add_failures: VecDeque<RemoteError>,
    /// Failure injected on the n-th add call (1-based), consumed once.
    add_failure_at: Vec<(usize, RemoteError)>,
    already_members: HashSet<Uid>,
    added: Vec<Uid>,
    add_call_times: Vec<Instant>,
}

pub struct MockRemote {
    pages: Vec<MembersPage>,
    latency: Duration,
    script: Mutex<Script>,
    add_calls: AtomicUsize,
    page_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            latency: Duration::ZERO,
            script: Mutex::new(Script::default()),
            add_calls: AtomicUsize::new(0),
            page_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Pages served in order; cursors are chained automatically.
    pub fn with_pages(mut self, pages: Vec<MembersPage>) -> Self {
        let count = pages.len();
        self.pages = pages
            .into_iter()
            .enumerate()
            .map(|(i, mut page)| {
                page.next_cursor = (i + 1 < count).then(|| (i + 1).to_string());
                page
            })
            .collect();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Failures returned, in order, before page requests start succeeding.
    pub fn fail_pages(self, failures: Vec<RemoteError>) -> Self {
        self.script.lock().unwrap().page_failures = failures.into();
        self
    }

    /// Failures returned, in order, before add requests start succeeding.
    pub fn fail_adds(self, failures: Vec<RemoteError>) -> Self {
        self.script.lock().unwrap().add_failures = failures.into();
        self
    }

    pub fn fail_add_call(self, call: usize, failure: RemoteError) -> Self {
        self.script.lock().unwrap().add_failure_at.push((call, failure));
        self
    }

    pub fn already_members(self, uids: impl IntoIterator<Item = Uid>) -> Self {
        self.script.lock().unwrap().already_members.extend(uids);
        self
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Uids the remote accepted with `Added`, in call order.
    pub fn added(&self) -> Vec<Uid> {
        self.script.lock().unwrap().added.clone()
    }

    pub fn add_call_times(&self) -> Vec<Instant> {
        self.script.lock().unwrap().add_call_times.clone()
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn members_page(
        &self,
        _group_id: &str,
        cursor: Option<&str>,
        _limit: u32,
    ) -> RemoteResult<MembersPage> {
        self.enter().await;
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let result = {
            let mut script = self.script.lock().unwrap();
            match script.page_failures.pop_front() {
                Some(failure) => Err(failure),
                None => {
                    let index = match cursor {
                        None => Some(0),
                        Some(c) => c.parse::<usize>().ok(),
                    };
                    match index.and_then(|i| self.pages.get(i)) {
                        Some(page) => Ok(page.clone()),
                        None if self.pages.is_empty() => Ok(MembersPage::default()),
                        None => Err(RemoteError::PermissionDenied(format!(
                            "unknown cursor {cursor:?}"
                        ))),
                    }
                }
            }
        };
        self.leave();
        result
    }

    async fn add_member(&self, _target_group_id: &str, uid: Uid) -> RemoteResult<AddReply> {
        self.enter().await;
        let call = self.add_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let result = {
            let mut script = self.script.lock().unwrap();
            script.add_call_times.push(Instant::now());
            let injected = script
                .add_failure_at
                .iter()
                .position(|(n, _)| *n == call)
                .map(|i| script.add_failure_at.remove(i).1);
            if let Some(failure) = injected {
                Err(failure)
            } else if let Some(failure) = script.add_failures.pop_front() {
                Err(failure)
            } else if script.already_members.contains(&uid) {
                Ok(AddReply::AlreadyMember)
            } else {
                script.added.push(uid);
                script.already_members.insert(uid);
                Ok(AddReply::Added)
            }
        };
        self.leave();
        result
    }

    fn name(&self) -> &str {
        "mock"
    }
}

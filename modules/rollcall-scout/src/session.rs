//! Authenticated session against the remote platform.
//!
//! `RemoteApi` is the transport seam: adapters classify every failure into
//! `RemoteError` exactly once. `SessionClient` layers pacing, retries and the
//! single in-flight discipline on top, and never lets a raw transport error
//! past it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rollcall_common::{AddOutcome, RemoteMember, Result, RollcallError, SessionConfig, Uid};

use crate::governor::RateGovernor;

// --- Remote seam ---

/// Closed classification of everything that can go wrong on a remote call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Rate limited, retry after {wait_seconds}s")]
    RateLimit { wait_seconds: u64 },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Session invalid: {0}")]
    SessionInvalid(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MembersPage {
    pub members: Vec<RemoteMember>,
    /// `None` marks the end of pagination.
    #[serde(default)]
    pub next_cursor: Option<String>,
    /// Group size, when the platform reports it.
    #[serde(default)]
    pub total: Option<u64>,
    /// Response size on the wire.
    #[serde(skip)]
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddReply {
    Added,
    AlreadyMember,
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn members_page(
        &self,
        group_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> RemoteResult<MembersPage>;

    async fn add_member(&self, target_group_id: &str, uid: Uid) -> RemoteResult<AddReply>;

    fn name(&self) -> &str;
}

// --- SessionClient ---

pub struct SessionClient {
    remote: Arc<dyn RemoteApi>,
    governor: Arc<RateGovernor>,
    config: SessionConfig,
    /// Held for the whole slot-plus-request span: one request in flight at a time.
    in_flight: Mutex<()>,
}

impl SessionClient {
    pub fn new(remote: Arc<dyn RemoteApi>, governor: Arc<RateGovernor>, config: SessionConfig) -> Self {
        Self {
            remote,
            governor,
            config,
            in_flight: Mutex::new(()),
        }
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    pub async fn fetch_members_page(
        &self,
        group_id: &str,
        cursor: Option<&str>,
    ) -> Result<MembersPage> {
        let limit = self.config.page_size;
        let page = self
            .call("members_page", || self.remote.members_page(group_id, cursor, limit))
            .await?;
        debug!(
            group = group_id,
            cursor = cursor.unwrap_or(""),
            members = page.members.len(),
            end = page.next_cursor.is_none(),
            "Fetched members page"
        );
        Ok(page)
    }

    /// Returns an outcome for everything except a dead session or a stop
    /// request, which the caller must treat as the end of the run.
    pub async fn add_member(&self, target_group_id: &str, uid: Uid) -> Result<AddOutcome> {
        match self
            .call("add_member", || self.remote.add_member(target_group_id, uid))
            .await
        {
            Ok(AddReply::Added) => Ok(AddOutcome::Success),
            Ok(AddReply::AlreadyMember) => Ok(AddOutcome::AlreadyMember),
            Err(RollcallError::RateLimited { .. }) => Ok(AddOutcome::RateLimited),
            Err(RollcallError::PermissionDenied(reason)) => {
                debug!(uid, reason = reason.as_str(), "Add forbidden");
                Ok(AddOutcome::Forbidden)
            }
            Err(RollcallError::Network(reason)) => {
                warn!(uid, reason = reason.as_str(), "Add failed after network retries");
                Ok(AddOutcome::Failed)
            }
            Err(e) => Err(e),
        }
    }

    async fn call<T, F, Fut>(&self, op: &'static str, request: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let mut rate_limits = 0u32;
        let mut transient_failures = 0u32;

        loop {
            let result = {
                let _token = self.in_flight.lock().await;
                self.governor.acquire_slot().await?;
                request().await
            };

            match result {
                Ok(value) => {
                    self.governor.report_success().await;
                    return Ok(value);
                }
                Err(RemoteError::RateLimit { wait_seconds }) => {
                    self.governor
                        .report_rate_limited(Duration::from_secs(wait_seconds))
                        .await;
                    rate_limits += 1;
                    if rate_limits > self.config.max_rate_limit_retries {
                        warn!(op, wait_seconds, rate_limits, "Rate limit retries exhausted");
                        return Err(RollcallError::RateLimited { wait_seconds });
                    }
                }
                Err(RemoteError::Transient(reason)) => {
                    transient_failures += 1;
                    if transient_failures >= self.config.transient_attempts {
                        warn!(op, attempts = transient_failures, reason = reason.as_str(), "Network retries exhausted");
                        return Err(RollcallError::Network(reason));
                    }
                    warn!(
                        op,
                        attempt = transient_failures,
                        reason = reason.as_str(),
                        remote = self.remote.name(),
                        "Transient network error, retrying"
                    );
                    tokio::time::sleep(self.config.transient_backoff).await;
                }
                Err(RemoteError::SessionInvalid(reason)) => {
                    return Err(RollcallError::SessionInvalid(reason));
                }
                Err(RemoteError::PermissionDenied(reason)) => {
                    return Err(RollcallError::PermissionDenied(reason));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stop::StopSignal;
    use crate::testing::{fast_governor, MockRemote};
    use rollcall_common::GovernorConfig;
    use tokio::time::Instant;

    fn client(remote: Arc<MockRemote>) -> SessionClient {
        client_with(remote, GovernorConfig {
            base_interval: Duration::from_millis(100),
            ..fast_governor()
        })
    }

    fn client_with(remote: Arc<MockRemote>, governor: GovernorConfig) -> SessionClient {
        let governor = Arc::new(RateGovernor::new(governor, StopSignal::new()));
        SessionClient::new(remote, governor, SessionConfig {
            max_rate_limit_retries: 2,
            transient_attempts: 3,
            transient_backoff: Duration::from_secs(1),
            page_size: 100,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_is_retried_after_cooldown() {
        let remote = Arc::new(MockRemote::new().fail_adds(vec![RemoteError::RateLimit { wait_seconds: 30 }]));
        let session = client(remote.clone());

        let start = Instant::now();
        let outcome = session.add_member("target", 1).await.unwrap();
        assert_eq!(outcome, AddOutcome::Success);
        assert_eq!(remote.add_calls(), 2);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_rate_limits_surface_as_rate_limited() {
        let limit = RemoteError::RateLimit { wait_seconds: 5 };
        let remote = Arc::new(MockRemote::new().fail_adds(vec![limit.clone(), limit.clone(), limit]));
        let session = client(remote.clone());

        let outcome = session.add_member("target", 1).await.unwrap();
        assert_eq!(outcome, AddOutcome::RateLimited);
        assert_eq!(remote.add_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_get_three_attempts() {
        let net = RemoteError::Transient("connection reset".into());
        let remote = Arc::new(MockRemote::new().fail_adds(vec![net.clone(), net.clone(), net]));
        let session = client(remote.clone());

        let outcome = session.add_member("target", 1).await.unwrap();
        assert_eq!(outcome, AddOutcome::Failed);
        assert_eq!(remote.add_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_then_success() {
        let remote = Arc::new(MockRemote::new().fail_adds(vec![RemoteError::Transient("timeout".into())]));
        let session = client(remote.clone());
        assert_eq!(session.add_member("target", 1).await.unwrap(), AddOutcome::Success);
        assert_eq!(remote.add_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn session_invalid_is_fatal_without_retry() {
        let remote = Arc::new(MockRemote::new().fail_adds(vec![RemoteError::SessionInvalid("revoked".into())]));
        let session = client(remote.clone());

        let err = session.add_member("target", 1).await.unwrap_err();
        assert!(matches!(err, RollcallError::SessionInvalid(_)));
        assert!(err.is_fatal());
        assert_eq!(remote.add_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_is_a_forbidden_outcome() {
        let remote = Arc::new(MockRemote::new().fail_adds(vec![RemoteError::PermissionDenied("privacy".into())]));
        let session = client(remote.clone());
        assert_eq!(session.add_member("target", 1).await.unwrap(), AddOutcome::Forbidden);
        assert_eq!(remote.add_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn page_permission_denied_is_an_error() {
        let remote = Arc::new(MockRemote::new().fail_pages(vec![RemoteError::PermissionDenied("admin only".into())]));
        let session = client(remote);
        let err = session.fetch_members_page("group", None).await.unwrap_err();
        assert!(matches!(err, RollcallError::PermissionDenied(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_one_request_in_flight() {
        let remote = Arc::new(
            MockRemote::new()
                .with_latency(Duration::from_millis(500))
                .with_pages((0..4).map(|p| crate::testing::page(p * 10..p * 10 + 10)).collect()),
        );
        let session = Arc::new(client_with(remote.clone(), GovernorConfig {
            base_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(1),
            ..fast_governor()
        }));

        let mut handles = Vec::new();
        for i in 0..4 {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                let cursor = (i > 0).then(|| i.to_string());
                session.add_member("target", i).await.unwrap();
                session.fetch_members_page("group", cursor.as_deref()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(remote.max_in_flight(), 1);
    }
}

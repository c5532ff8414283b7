//! HTTP adapter for a session gateway.
//!
//! The gateway holds the authenticated platform session and exposes two JSON
//! endpoints:
//! - `GET {base}/groups/{id}/members?cursor=&limit=` returning a `MembersPage`
//! - `POST {base}/groups/{id}/members` with `{"uid": ...}`
//!
//! Every failure is classified into a `RemoteError` here and nowhere else.

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use rollcall_common::{GatewayConfig, Uid};

use crate::session::{AddReply, MembersPage, RemoteApi, RemoteError, RemoteResult};

/// Wait applied when a 429 carries no usable hint.
pub const DEFAULT_RATE_LIMIT_WAIT_SECS: u64 = 30;

#[derive(Serialize)]
struct AddMemberRequest {
    uid: Uid,
}

pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteError::Transient(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.session_token.clone(),
        })
    }

    fn members_url(&self, group_id: &str) -> String {
        format!("{}/groups/{}/members", self.base_url, group_id)
    }
}

#[async_trait]
impl RemoteApi for HttpGateway {
    async fn members_page(
        &self,
        group_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> RemoteResult<MembersPage> {
        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        let resp = self
            .client
            .get(self.members_url(group_id))
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let retry_after = retry_after_header(&resp);
        let body = resp.bytes().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status, retry_after, &body));
        }

        let mut page: MembersPage = serde_json::from_slice(&body)
            .map_err(|e| RemoteError::Transient(format!("malformed members page: {e}")))?;
        page.bytes = body.len() as u64;
        debug!(group = group_id, bytes = page.bytes, "Members page received");
        Ok(page)
    }

    async fn add_member(&self, target_group_id: &str, uid: Uid) -> RemoteResult<AddReply> {
        let resp = self
            .client
            .post(self.members_url(target_group_id))
            .bearer_auth(&self.token)
            .json(&AddMemberRequest { uid })
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status == StatusCode::CONFLICT {
            return Ok(AddReply::AlreadyMember);
        }
        if status.is_success() {
            return Ok(AddReply::Added);
        }
        let retry_after = retry_after_header(&resp);
        let body = resp.bytes().await.unwrap_or_default();
        Err(classify_status(status, retry_after, &body))
    }

    fn name(&self) -> &str {
        "http-gateway"
    }
}

fn retry_after_header(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    RemoteError::Transient(err.to_string())
}

/// Map a non-success status to the closed error set.
///
/// A 429's wait comes from `Retry-After`, else a `retry_after` field in the
/// JSON body, else `DEFAULT_RATE_LIMIT_WAIT_SECS`.
pub fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &[u8]) -> RemoteError {
    let message = String::from_utf8_lossy(body).into_owned();
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let wait_seconds = retry_after
                .or_else(|| {
                    serde_json::from_slice::<serde_json::Value>(body)
                        .ok()
                        .and_then(|v| v.get("retry_after").and_then(|w| w.as_u64()))
                })
                .unwrap_or(DEFAULT_RATE_LIMIT_WAIT_SECS);
            RemoteError::RateLimit { wait_seconds }
        }
        StatusCode::UNAUTHORIZED => RemoteError::SessionInvalid(message),
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => RemoteError::PermissionDenied(message),
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            RemoteError::Transient(format!("status {}: {message}", s.as_u16()))
        }
        s => RemoteError::PermissionDenied(format!("status {}: {message}", s.as_u16())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rate_limit_prefers_header_then_body_then_default() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(12), br#"{"retry_after": 99}"#),
            RemoteError::RateLimit { wait_seconds: 12 }
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, br#"{"retry_after": 99}"#),
            RemoteError::RateLimit { wait_seconds: 99 }
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, b"slow down"),
            RemoteError::RateLimit { wait_seconds: DEFAULT_RATE_LIMIT_WAIT_SECS }
        );
    }

    #[test]
    fn auth_and_permission_statuses() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, b"expired"),
            RemoteError::SessionInvalid(m) if m == "expired"
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, b""),
            RemoteError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, b""),
            RemoteError::PermissionDenied(_)
        ));
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, b""),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT, None, b""),
            RemoteError::Transient(_)
        ));
    }

    #[test]
    fn members_url_trims_trailing_slash() {
        let gateway = HttpGateway::new(&GatewayConfig {
            base_url: "http://127.0.0.1:9/".into(),
            session_token: "token".into(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(gateway.members_url("g"), "http://127.0.0.1:9/groups/g/members");
    }
}

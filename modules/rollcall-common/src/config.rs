use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::error::{Result, RollcallError};
use crate::filters::FilterConfig;

/// Request pacing and backoff for the shared session.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Minimum spacing between consecutive requests.
    pub base_interval: Duration,
    /// Relative jitter applied to each spacing, e.g. 0.2 for ±20%.
    pub jitter: f64,
    pub backoff_multiplier: f64,
    /// Ceiling for the backed-off interval.
    pub max_interval: Duration,
    /// Consecutive successes needed to drop back to `base_interval`.
    pub success_streak_to_reset: u32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(1500),
            jitter: 0.2,
            backoff_multiplier: 2.0,
            max_interval: Duration::from_secs(120),
            success_streak_to_reset: 10,
        }
    }
}

/// Retry bounds applied by the session client.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Rate-limit waits absorbed per call before the call is surfaced as failed.
    pub max_rate_limit_retries: u32,
    /// Total attempts for transient network failures.
    pub transient_attempts: u32,
    pub transient_backoff: Duration,
    pub page_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 5,
            transient_attempts: 3,
            transient_backoff: Duration::from_secs(2),
            page_size: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoAddConfig {
    pub target_group_id: String,
    /// Adds allowed per rolling `window`.
    pub max_adds_per_window: u32,
    pub window: Duration,
    /// Requeues allowed for `RateLimited`/`Failed` outcomes before giving up.
    pub max_retries: u32,
}

impl AutoAddConfig {
    pub fn new(target_group_id: impl Into<String>) -> Self {
        Self {
            target_group_id: target_group_id.into(),
            max_adds_per_window: 40,
            window: Duration::from_secs(3600),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub every_pages: u32,
    pub interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            every_pages: 5,
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub host: String,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

/// Everything one enumeration (and optional auto-add) run needs.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub group_id: String,
    pub output_dir: PathBuf,
    pub resume: bool,
    pub max_uids: Option<u64>,
    pub governor: GovernorConfig,
    pub session: SessionConfig,
    pub auto_add: Option<AutoAddConfig>,
    pub checkpoint: CheckpointConfig,
    pub filter: FilterConfig,
    pub dashboard: Option<DashboardConfig>,
    /// EMA smoothing factor for `current_rate`.
    pub rate_smoothing: f64,
    pub report_interval: Duration,
}

impl RunConfig {
    pub fn new(group_id: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            group_id: group_id.into(),
            output_dir: output_dir.into(),
            resume: false,
            max_uids: None,
            governor: GovernorConfig::default(),
            session: SessionConfig::default(),
            auto_add: None,
            checkpoint: CheckpointConfig::default(),
            filter: FilterConfig::default(),
            dashboard: None,
            rate_smoothing: 0.3,
            report_interval: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(RollcallError::Config("group id must not be empty".into()));
        }
        let g = &self.governor;
        if !(0.0..1.0).contains(&g.jitter) {
            return Err(RollcallError::Config(format!(
                "jitter must be in [0, 1), got {}",
                g.jitter
            )));
        }
        if g.backoff_multiplier < 1.0 {
            return Err(RollcallError::Config(
                "backoff multiplier must be at least 1.0".into(),
            ));
        }
        if g.max_interval < g.base_interval {
            return Err(RollcallError::Config(
                "max interval must not be below the base interval".into(),
            ));
        }
        if self.session.transient_attempts == 0 {
            return Err(RollcallError::Config(
                "transient attempts must be at least 1".into(),
            ));
        }
        if !(self.rate_smoothing > 0.0 && self.rate_smoothing <= 1.0) {
            return Err(RollcallError::Config(
                "rate smoothing must be in (0, 1]".into(),
            ));
        }
        if let Some(add) = &self.auto_add {
            if add.target_group_id.trim().is_empty() {
                return Err(RollcallError::Config(
                    "auto-add requires a target group".into(),
                ));
            }
            if add.max_adds_per_window == 0 || add.window.is_zero() {
                return Err(RollcallError::Config(
                    "auto-add ceiling and window must be non-zero".into(),
                ));
            }
        }
        self.filter.validate()
    }

    /// Log the effective settings at startup.
    pub fn log_summary(&self) {
        info!(
            group = self.group_id.as_str(),
            output_dir = %self.output_dir.display(),
            resume = self.resume,
            max_uids = ?self.max_uids,
            base_interval_ms = self.governor.base_interval.as_millis() as u64,
            max_interval_secs = self.governor.max_interval.as_secs(),
            auto_add_target = self.auto_add.as_ref().map(|a| a.target_group_id.as_str()),
            adds_per_window = self.auto_add.as_ref().map(|a| a.max_adds_per_window),
            "Run configuration"
        );
    }
}

/// Where the session gateway lives and how to authenticate against it.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub session_token: String,
    pub timeout: Duration,
}

impl GatewayConfig {
    /// Load from `ROLLCALL_GATEWAY_URL`, `ROLLCALL_SESSION_TOKEN` and the optional
    /// `ROLLCALL_TIMEOUT_SECS` (default 30).
    pub fn from_env() -> Result<Self> {
        let timeout = match env::var("ROLLCALL_TIMEOUT_SECS") {
            Ok(v) => v.parse::<u64>().map_err(|_| {
                RollcallError::Config("ROLLCALL_TIMEOUT_SECS must be a number".into())
            })?,
            Err(_) => 30,
        };
        Ok(Self {
            base_url: required_env("ROLLCALL_GATEWAY_URL")?
                .trim_end_matches('/')
                .to_string(),
            session_token: required_env("ROLLCALL_SESSION_TOKEN")?,
            timeout: Duration::from_secs(timeout),
        })
    }

    pub fn log_redacted(&self) {
        info!(
            base_url = self.base_url.as_str(),
            session_token = redact(&self.session_token).as_str(),
            timeout_secs = self.timeout.as_secs(),
            "Gateway configuration"
        );
    }
}

fn required_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| RollcallError::Config(format!("{key} environment variable is required")))
}

fn redact(secret: &str) -> String {
    if secret.chars().count() <= 4 {
        return "****".to_string();
    }
    let prefix: String = secret.chars().take(4).collect();
    format!("{prefix}****")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_run_config_is_valid() {
        RunConfig::new("@group", "out").validate().unwrap();
    }

    #[test]
    fn auto_add_without_target_is_rejected() {
        let mut config = RunConfig::new("@group", "out");
        config.auto_add = Some(AutoAddConfig::new(" "));
        assert!(matches!(config.validate(), Err(RollcallError::Config(_))));
    }

    #[test]
    fn jitter_outside_unit_range_is_rejected() {
        let mut config = RunConfig::new("@group", "out");
        config.governor.jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn ceiling_below_base_is_rejected() {
        let mut config = RunConfig::new("@group", "out");
        config.governor.max_interval = Duration::from_millis(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn redact_keeps_prefix_only() {
        assert_eq!(redact("abcdef123"), "abcd****");
        assert_eq!(redact("ab"), "****");
    }
}

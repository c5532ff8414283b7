use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;

use rollcall_common::{
    ActivityLevel, AutoAddConfig, CheckpointConfig, DashboardConfig, FilterConfig, GovernorConfig,
    Result, RollcallError, RunConfig, SessionConfig,
};

#[derive(Parser, Debug)]
#[command(name = "rollcall", about = "Paced group member enumeration with optional auto-add")]
pub struct Cli {
    /// Group to enumerate
    pub group: String,

    /// Directory for checkpoint, add log and exports
    #[arg(long, default_value = "./rollcall-output")]
    pub output_dir: PathBuf,

    /// Continue from the checkpoint in the output directory
    #[arg(long)]
    pub resume: bool,

    /// Stop after this many members have been emitted
    #[arg(long)]
    pub max_uids: Option<u64>,

    #[arg(long, default_value_t = 200)]
    pub page_size: u32,

    // --- Pacing ---
    /// Base spacing between requests, in seconds
    #[arg(long, default_value_t = 1.5)]
    pub delay: f64,

    /// Ceiling for the backed-off spacing, in seconds
    #[arg(long, default_value_t = 120.0)]
    pub max_delay: f64,

    #[arg(long, default_value_t = 2.0)]
    pub backoff_multiplier: f64,

    /// Consecutive successes before spacing drops back to base
    #[arg(long, default_value_t = 10)]
    pub reset_after: u32,

    /// Relative jitter on each spacing (0.2 = ±20%)
    #[arg(long, default_value_t = 0.2)]
    pub jitter: f64,

    /// Rate-limit waits absorbed per request
    #[arg(long, default_value_t = 5)]
    pub retries: u32,

    // --- Auto-add ---
    #[arg(long)]
    pub auto_add: bool,

    #[arg(long)]
    pub target_group: Option<String>,

    #[arg(long, default_value_t = 40)]
    pub adds_per_window: u32,

    #[arg(long, default_value_t = 3600)]
    pub add_window_secs: u64,

    /// Requeues per member after a rate-limited or failed add
    #[arg(long, default_value_t = 3)]
    pub add_retries: u32,

    // --- Filters ---
    /// high | medium | low | unknown
    #[arg(long)]
    pub min_activity: Option<ActivityLevel>,

    #[arg(long)]
    pub max_activity: Option<ActivityLevel>,

    /// RFC 3339 timestamp
    #[arg(long)]
    pub joined_after: Option<DateTime<Utc>>,

    #[arg(long)]
    pub joined_before: Option<DateTime<Utc>>,

    /// Regex matched against usernames
    #[arg(long)]
    pub username_pattern: Option<String>,

    #[arg(long)]
    pub exclude_banned: bool,

    #[arg(long)]
    pub only_active: bool,

    // --- Dashboard ---
    #[arg(long)]
    pub dashboard: bool,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    // --- Checkpointing ---
    #[arg(long, default_value_t = 5)]
    pub checkpoint_pages: u32,

    #[arg(long, default_value_t = 30)]
    pub checkpoint_secs: u64,
}

impl Cli {
    pub fn into_run_config(self) -> Result<RunConfig> {
        let mut config = RunConfig::new(self.group, self.output_dir);
        config.resume = self.resume;
        config.max_uids = self.max_uids;
        config.governor = GovernorConfig {
            base_interval: seconds("delay", self.delay)?,
            jitter: self.jitter,
            backoff_multiplier: self.backoff_multiplier,
            max_interval: seconds("max-delay", self.max_delay)?,
            success_streak_to_reset: self.reset_after,
        };
        config.session = SessionConfig {
            max_rate_limit_retries: self.retries,
            page_size: self.page_size,
            ..SessionConfig::default()
        };
        if self.auto_add {
            config.auto_add = Some(AutoAddConfig {
                max_adds_per_window: self.adds_per_window,
                window: Duration::from_secs(self.add_window_secs),
                max_retries: self.add_retries,
                ..AutoAddConfig::new(self.target_group.unwrap_or_default())
            });
        }
        config.filter = FilterConfig {
            min_activity: self.min_activity,
            max_activity: self.max_activity,
            joined_after: self.joined_after,
            joined_before: self.joined_before,
            username_pattern: self.username_pattern,
            exclude_banned: self.exclude_banned,
            only_active: self.only_active,
        };
        if self.dashboard {
            config.dashboard = Some(DashboardConfig {
                host: self.host,
                port: self.port,
            });
        }
        config.checkpoint = CheckpointConfig {
            every_pages: self.checkpoint_pages.max(1),
            interval: Duration::from_secs(self.checkpoint_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

fn seconds(flag: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(RollcallError::Config(format!(
            "--{flag} must be a non-negative number of seconds"
        )));
    }
    Ok(Duration::from_secs_f64(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("rollcall").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_library_defaults() {
        let config = parse(&["@group"]).into_run_config().unwrap();
        assert_eq!(config.group_id, "@group");
        assert_eq!(config.governor.base_interval, Duration::from_millis(1500));
        assert_eq!(config.session.page_size, 200);
        assert!(config.auto_add.is_none());
        assert!(config.dashboard.is_none());
        assert!(config.filter.is_empty());
    }

    #[test]
    fn auto_add_flags_build_the_add_config() {
        let config = parse(&[
            "@group",
            "--auto-add",
            "--target-group",
            "@mine",
            "--adds-per-window",
            "10",
            "--min-activity",
            "medium",
        ])
        .into_run_config()
        .unwrap();
        let add = config.auto_add.unwrap();
        assert_eq!(add.target_group_id, "@mine");
        assert_eq!(add.max_adds_per_window, 10);
        assert_eq!(config.filter.min_activity, Some(ActivityLevel::Medium));
    }

    #[test]
    fn auto_add_without_target_is_rejected() {
        let err = parse(&["@group", "--auto-add"]).into_run_config().unwrap_err();
        assert!(matches!(err, RollcallError::Config(_)));
    }

    #[test]
    fn negative_delay_is_rejected() {
        assert!(parse(&["@group", "--delay=-1"]).into_run_config().is_err());
    }
}

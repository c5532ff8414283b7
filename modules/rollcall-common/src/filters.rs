use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::{Result, RollcallError};
use crate::types::{ActivityLevel, MemberRecord, MemberStatus};

/// Operator-supplied member selection criteria. Empty means "keep everyone".
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    pub min_activity: Option<ActivityLevel>,
    pub max_activity: Option<ActivityLevel>,
    pub joined_after: Option<DateTime<Utc>>,
    pub joined_before: Option<DateTime<Utc>>,
    pub username_pattern: Option<String>,
    pub exclude_banned: bool,
    pub only_active: bool,
}

impl FilterConfig {
    pub fn is_empty(&self) -> bool {
        self.min_activity.is_none()
            && self.max_activity.is_none()
            && self.joined_after.is_none()
            && self.joined_before.is_none()
            && self.username_pattern.is_none()
            && !self.exclude_banned
            && !self.only_active
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min_activity, self.max_activity) {
            if min > max {
                return Err(RollcallError::Config(format!(
                    "min activity {min} is above max activity {max}"
                )));
            }
        }
        if let (Some(after), Some(before)) = (self.joined_after, self.joined_before) {
            if after > before {
                return Err(RollcallError::Config(
                    "joined-after is later than joined-before".into(),
                ));
            }
        }
        if let Some(pattern) = &self.username_pattern {
            Regex::new(pattern)
                .map_err(|e| RollcallError::Config(format!("invalid username pattern: {e}")))?;
        }
        Ok(())
    }
}

/// Compiled form of `FilterConfig`.
#[derive(Debug, Clone)]
pub struct MemberFilter {
    config: FilterConfig,
    username: Option<Regex>,
}

impl MemberFilter {
    pub fn new(config: FilterConfig) -> Result<Self> {
        config.validate()?;
        let username = config
            .username_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| RollcallError::Config(format!("invalid username pattern: {e}")))?;
        Ok(Self { config, username })
    }

    pub fn matches(&self, record: &MemberRecord) -> bool {
        self.check_activity(record)
            && self.check_joined(record)
            && self.check_username(record)
            && self.check_status(record)
    }

    fn check_activity(&self, record: &MemberRecord) -> bool {
        if let Some(min) = self.config.min_activity {
            if record.activity_level < min {
                return false;
            }
        }
        if let Some(max) = self.config.max_activity {
            if record.activity_level > max {
                return false;
            }
        }
        true
    }

    // Members without a join date pass date filters; the platform often hides it.
    fn check_joined(&self, record: &MemberRecord) -> bool {
        let Some(joined) = record.joined_at else {
            return true;
        };
        if let Some(after) = self.config.joined_after {
            if joined < after {
                return false;
            }
        }
        if let Some(before) = self.config.joined_before {
            if joined > before {
                return false;
            }
        }
        true
    }

    fn check_username(&self, record: &MemberRecord) -> bool {
        match (&self.username, record.username.as_deref()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(re), Some(name)) => re.is_match(name),
        }
    }

    fn check_status(&self, record: &MemberRecord) -> bool {
        if self.config.exclude_banned && record.status == MemberStatus::Banned {
            return false;
        }
        if self.config.only_active && record.status != MemberStatus::Active {
            return false;
        }
        true
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform-assigned account identifier. The natural key across every store.
pub type Uid = i64;

// --- Member Types ---

/// Coarse "last seen" signal as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastSeen {
    Online,
    Recently,
    LastWeek,
    LastMonth,
    Unknown,
}

/// Activity bucket derived from `LastSeen`. Ordered `Unknown < Low < Medium < High`
/// so filters can express ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Unknown,
    Low,
    Medium,
    High,
}

impl ActivityLevel {
    pub fn from_last_seen(last_seen: Option<LastSeen>) -> Self {
        match last_seen {
            Some(LastSeen::Online) | Some(LastSeen::Recently) => ActivityLevel::High,
            Some(LastSeen::LastWeek) => ActivityLevel::Medium,
            Some(LastSeen::LastMonth) => ActivityLevel::Low,
            Some(LastSeen::Unknown) | None => ActivityLevel::Unknown,
        }
    }
}

impl std::fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityLevel::High => write!(f, "high"),
            ActivityLevel::Medium => write!(f, "medium"),
            ActivityLevel::Low => write!(f, "low"),
            ActivityLevel::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for ActivityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(ActivityLevel::High),
            "medium" => Ok(ActivityLevel::Medium),
            "low" => Ok(ActivityLevel::Low),
            "unknown" => Ok(ActivityLevel::Unknown),
            other => Err(format!("unknown activity level: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    #[default]
    Active,
    Inactive,
    Banned,
}

/// A member as the remote API reports it, before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMember {
    pub uid: Uid,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub last_seen: Option<LastSeen>,
    #[serde(default)]
    pub status: MemberStatus,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
}

impl RemoteMember {
    pub fn new(uid: Uid) -> Self {
        Self {
            uid,
            username: None,
            last_seen: None,
            status: MemberStatus::Active,
            joined_at: None,
        }
    }
}

/// A discovered member. Built once by the enumerator and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub uid: Uid,
    pub username: Option<String>,
    pub last_seen: LastSeen,
    pub activity_level: ActivityLevel,
    pub status: MemberStatus,
    pub joined_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
}

impl MemberRecord {
    pub fn classify(member: RemoteMember, discovered_at: DateTime<Utc>) -> Self {
        Self {
            uid: member.uid,
            username: member.username,
            last_seen: member.last_seen.unwrap_or(LastSeen::Unknown),
            activity_level: ActivityLevel::from_last_seen(member.last_seen),
            status: member.status,
            joined_at: member.joined_at,
            discovered_at,
        }
    }
}

// --- Auto-add Types ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOutcome {
    Success,
    AlreadyMember,
    RateLimited,
    Forbidden,
    Failed,
}

impl AddOutcome {
    /// Outcomes that mean the uid is now in the target group.
    pub fn is_member(&self) -> bool {
        matches!(self, AddOutcome::Success | AddOutcome::AlreadyMember)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AddOutcome::RateLimited | AddOutcome::Failed)
    }
}

impl std::fmt::Display for AddOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddOutcome::Success => write!(f, "success"),
            AddOutcome::AlreadyMember => write!(f, "already_member"),
            AddOutcome::RateLimited => write!(f, "rate_limited"),
            AddOutcome::Forbidden => write!(f, "forbidden"),
            AddOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// One add request and how it ended. Retries produce further attempts for the
/// same uid; the latest one is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddAttempt {
    pub uid: Uid,
    pub target_group_id: String,
    pub outcome: AddOutcome,
    pub attempted_at: DateTime<Utc>,
    pub retry_count: u32,
}

// --- Run Stats ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeOutcome {
    /// New member emitted downstream.
    Scraped,
    /// New member rejected by the configured filter.
    Filtered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Stopped,
    Failed { cause: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoAddStats {
    pub total_attempts: u64,
    pub successful_adds: u64,
    pub already_member: u64,
    pub rate_limited: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_processed: u64,
    pub successful_scrapes: u64,
    pub failed_scrapes: u64,
    /// Completions per second, exponentially smoothed.
    pub current_rate: f64,
    pub bandwidth_used: u64,
    /// Seconds. `None` while the rate is zero or the total is not known.
    pub estimated_time_remaining: Option<f64>,
    pub known_total: Option<u64>,
    pub auto_add_stats: AutoAddStats,
    pub start_time: DateTime<Utc>,
    pub status: RunStatus,
}

impl RunStats {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            total_processed: 0,
            successful_scrapes: 0,
            failed_scrapes: 0,
            current_rate: 0.0,
            bandwidth_used: 0,
            estimated_time_remaining: None,
            known_total: None,
            auto_add_stats: AutoAddStats::default(),
            start_time,
            status: RunStatus::Running,
        }
    }
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed={} scraped={} filtered={} adds={}/{} rate_limited={} failed_adds={}",
            self.total_processed,
            self.successful_scrapes,
            self.failed_scrapes,
            self.auto_add_stats.successful_adds,
            self.auto_add_stats.total_attempts,
            self.auto_add_stats.rate_limited,
            self.auto_add_stats.failed,
        )
    }
}

// --- Dashboard Types ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

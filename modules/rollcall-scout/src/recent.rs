use std::collections::VecDeque;
use std::sync::Mutex;

use rollcall_common::MemberRecord;

pub const RECENT_CAPACITY: usize = 100;

/// Bounded ring of the most recently discovered members, for the dashboard.
pub struct RecentMembers {
    capacity: usize,
    ring: Mutex<VecDeque<MemberRecord>>,
}

impl RecentMembers {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, record: MemberRecord) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Up to `limit` records, newest first.
    pub fn latest(&self, limit: usize) -> Vec<MemberRecord> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecentMembers {
    fn default() -> Self {
        Self::new(RECENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rollcall_common::RemoteMember;

    fn record(uid: i64) -> MemberRecord {
        MemberRecord::classify(RemoteMember::new(uid), Utc::now())
    }

    #[test]
    fn newest_first_and_bounded() {
        let recent = RecentMembers::new(3);
        for uid in 1..=5 {
            recent.push(record(uid));
        }
        assert_eq!(recent.len(), 3);
        let uids: Vec<_> = recent.latest(10).into_iter().map(|r| r.uid).collect();
        assert_eq!(uids, vec![5, 4, 3]);
        assert_eq!(recent.latest(1)[0].uid, 5);
    }
}

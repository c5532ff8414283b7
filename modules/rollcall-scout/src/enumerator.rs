use std::sync::Arc;

use async_stream::try_stream;
use chrono::Utc;
use futures::Stream;
use tracing::{debug, info};

use rollcall_common::{MemberFilter, MemberRecord, Result, ScrapeOutcome};

use crate::progress::ProgressStore;
use crate::session::SessionClient;
use crate::stats::StatsAggregator;

/// Pages through a group's membership and yields each member once per run.
pub struct MemberEnumerator {
    session: Arc<SessionClient>,
    progress: Arc<ProgressStore>,
    stats: Arc<StatsAggregator>,
    filter: Option<MemberFilter>,
    max_uids: Option<u64>,
}

impl MemberEnumerator {
    pub fn new(
        session: Arc<SessionClient>,
        progress: Arc<ProgressStore>,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        Self {
            session,
            progress,
            stats,
            filter: None,
            max_uids: None,
        }
    }

    pub fn with_filter(mut self, filter: MemberFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_max_uids(mut self, max_uids: Option<u64>) -> Self {
        self.max_uids = max_uids;
        self
    }

    /// Lazily enumerate `group_id`, starting at `resume_cursor` (or the first
    /// page).
    ///
    /// Uids already in the progress store are skipped. After a page has been
    /// fully consumed its successor cursor is committed, so a restart repeats
    /// at most the page that was in progress. Any error is the last item.
    pub fn enumerate<'a>(
        &'a self,
        group_id: &'a str,
        resume_cursor: Option<String>,
    ) -> impl Stream<Item = Result<MemberRecord>> + 'a {
        try_stream! {
            let mut cursor = resume_cursor;
            let mut emitted: u64 = 0;
            info!(group = group_id, cursor = cursor.as_deref().unwrap_or(""), "Enumeration starting");

            loop {
                let page = self
                    .session
                    .fetch_members_page(group_id, cursor.as_deref())
                    .await?;
                self.stats.record_bandwidth(page.bytes);
                if let Some(total) = page.total {
                    let total = self.max_uids.map_or(total, |max| max.min(total));
                    self.stats.set_known_total(total);
                }

                let mut fresh = 0usize;
                for member in page.members {
                    if self.max_uids.is_some_and(|max| emitted >= max) {
                        info!(group = group_id, emitted, "Reached max uid count");
                        return;
                    }
                    if !self.progress.mark_scraped(member.uid) {
                        continue;
                    }
                    fresh += 1;

                    let record = MemberRecord::classify(member, Utc::now());
                    if let Some(filter) = &self.filter {
                        if !filter.matches(&record) {
                            self.stats.record_scrape_result(ScrapeOutcome::Filtered);
                            continue;
                        }
                    }
                    self.stats.record_scrape_result(ScrapeOutcome::Scraped);
                    emitted += 1;
                    yield record;
                }

                debug!(group = group_id, fresh, emitted, "Page committed");
                match page.next_cursor {
                    Some(next) => {
                        self.progress.set_cursor(Some(next.clone()));
                        self.progress.page_committed().await?;
                        cursor = Some(next);
                    }
                    None => {
                        self.progress.page_committed().await?;
                        info!(group = group_id, emitted, "Enumeration reached the end of the member list");
                        return;
                    }
                }
            }
        }
    }
}

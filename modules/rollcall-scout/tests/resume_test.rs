//! Integration test: crash between checkpoints, then resume.
//!
//! Add-marks are durable the moment an add succeeds, so a resumed run never
//! re-adds anyone even when the last checkpoint predates those adds. The
//! cursor comes back from the last checkpoint, so at most the page in
//! progress is enumerated again.

use std::sync::Arc;
use std::time::Duration;

use futures::{pin_mut, StreamExt};
use rollcall_common::{CheckpointConfig, MemberRecord};
use rollcall_scout::adder::{AddState, AutoAdder, NextAdd};
use rollcall_scout::enumerator::MemberEnumerator;
use rollcall_scout::progress::{ProgressStore, CHECKPOINT_FILE};
use rollcall_scout::stats::StatsAggregator;
use rollcall_scout::stop::StopSignal;
use rollcall_scout::testing::{auto_add_config, page, session, MockRemote};

fn rare_checkpoints() -> CheckpointConfig {
    CheckpointConfig {
        every_pages: 1_000,
        interval: Duration::from_secs(86_400),
    }
}

async fn take_records(enumerator: &MemberEnumerator, cursor: Option<String>, n: usize) -> Vec<MemberRecord> {
    let stream = enumerator.enumerate("group", cursor);
    pin_mut!(stream);
    let mut records = Vec::new();
    while records.len() < n {
        match stream.next().await {
            Some(item) => records.push(item.expect("enumeration failed")),
            None => break,
        }
    }
    records
}

#[tokio::test(start_paused = true)]
async fn resume_after_fifty_adds_never_re_adds() {
    let dir = tempfile::tempdir().unwrap();
    let pages = || vec![page(0..50), page(50..100)];

    // First run: enumerate and add the first 50, then "crash" without a checkpoint.
    {
        let remote = Arc::new(MockRemote::new().with_pages(pages()));
        let stop = StopSignal::new();
        let progress = Arc::new(
            ProgressStore::open(dir.path(), rare_checkpoints(), false)
                .await
                .unwrap(),
        );
        let stats = Arc::new(StatsAggregator::new(0.3));
        let session = session(remote.clone(), stop.clone());
        let enumerator = MemberEnumerator::new(session.clone(), progress.clone(), stats.clone());
        let adder = AutoAdder::new(session, progress.clone(), stats, auto_add_config(100), stop);

        for record in take_records(&enumerator, None, 50).await {
            assert!(adder.enqueue(record));
        }
        while let NextAdd::Attempted(_) = adder.attempt_next().await.unwrap() {}

        assert_eq!(remote.add_calls(), 50);
        assert!(!dir.path().join(CHECKPOINT_FILE).exists());
    }

    // Second run: resume. The remote no longer remembers anyone, so any repeat
    // add would show up as a fresh `Added`.
    let remote = Arc::new(MockRemote::new().with_pages(pages()));
    let stop = StopSignal::new();
    let progress = Arc::new(
        ProgressStore::open(dir.path(), rare_checkpoints(), true)
            .await
            .unwrap(),
    );
    for uid in 0..50 {
        assert!(progress.is_added(uid), "uid {uid} lost its add-mark");
    }

    let stats = Arc::new(StatsAggregator::new(0.3));
    let session = session(remote.clone(), stop.clone());
    let enumerator = MemberEnumerator::new(session.clone(), progress.clone(), stats.clone());
    let adder = AutoAdder::new(session, progress.clone(), stats, auto_add_config(100), stop);

    let records = take_records(&enumerator, progress.cursor(), usize::MAX).await;
    let enqueued = records.into_iter().filter(|r| adder.enqueue(r.clone())).count();
    assert_eq!(enqueued, 50);
    while let NextAdd::Attempted(_) = adder.attempt_next().await.unwrap() {}

    assert_eq!(remote.added(), (50..100).collect::<Vec<_>>());
    assert_eq!(adder.state_of(10), None);
    assert_eq!(adder.state_of(75), Some(AddState::Success));
}

#[tokio::test(start_paused = true)]
async fn resume_repeats_at_most_the_page_in_progress() {
    let dir = tempfile::tempdir().unwrap();
    let pages = || vec![page(0..20), page(20..40), page(40..60)];
    let every_page = CheckpointConfig {
        every_pages: 1,
        interval: Duration::from_secs(86_400),
    };

    {
        let remote = Arc::new(MockRemote::new().with_pages(pages()));
        let progress = Arc::new(
            ProgressStore::open(dir.path(), every_page.clone(), false)
                .await
                .unwrap(),
        );
        let stats = Arc::new(StatsAggregator::new(0.3));
        let enumerator = MemberEnumerator::new(session(remote, StopSignal::new()), progress, stats);
        // all of page 0 and half of page 1
        let records = take_records(&enumerator, None, 30).await;
        assert_eq!(records.len(), 30);
    }

    let remote = Arc::new(MockRemote::new().with_pages(pages()));
    let progress = Arc::new(ProgressStore::open(dir.path(), every_page, true).await.unwrap());
    assert_eq!(progress.cursor().as_deref(), Some("1"));

    let stats = Arc::new(StatsAggregator::new(0.3));
    let enumerator = MemberEnumerator::new(session(remote.clone(), StopSignal::new()), progress.clone(), stats);
    let records = take_records(&enumerator, progress.cursor(), usize::MAX).await;
    let uids: Vec<_> = records.iter().map(|r| r.uid).collect();
    assert_eq!(uids, (20..60).collect::<Vec<_>>());
    assert_eq!(remote.page_calls(), 2);
}

//! Integration test: whole runs against the mock remote, on a paused clock.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rollcall_common::{AutoAddConfig, RunConfig, RunStatus};
use rollcall_scout::export::{ATTEMPTS_FILE, MEMBERS_FILE};
use rollcall_scout::progress::{ProgressStore, CHECKPOINT_FILE};
use rollcall_scout::run::Run;
use rollcall_scout::session::RemoteError;
use rollcall_scout::stop::StopSignal;
use rollcall_scout::testing::{fast_governor, page, session_config, MockRemote};

fn run_config(dir: &Path) -> RunConfig {
    let mut config = RunConfig::new("group", dir);
    config.governor = fast_governor();
    config.session = session_config();
    config
}

fn lines(path: &Path) -> usize {
    std::fs::read_to_string(path).unwrap().lines().count()
}

#[tokio::test(start_paused = true)]
async fn enumeration_only_run_completes() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MockRemote::new().with_pages(vec![page(0..100), page(95..195), page(195..295)]));

    let run = Run::prepare(run_config(dir.path()), remote.clone(), StopSignal::new())
        .await
        .unwrap();
    let stats = run.stats();
    let recent = run.recent();
    let status = run.execute().await;

    assert_eq!(status, RunStatus::Completed);
    let snap = stats.snapshot();
    assert_eq!(snap.total_processed, 295);
    assert_eq!(snap.status, RunStatus::Completed);
    assert_eq!(recent.latest(1)[0].uid, 294);
    assert_eq!(lines(&dir.path().join(MEMBERS_FILE)), 295);
    assert_eq!(remote.add_calls(), 0);

    let saved = ProgressStore::load(dir.path()).await.unwrap();
    assert_eq!(saved.scraped_uids.len(), 295);
}

#[tokio::test(start_paused = true)]
async fn add_ceiling_spreads_adds_across_windows() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MockRemote::new().with_pages(vec![page(0..15)]));
    let mut config = run_config(dir.path());
    config.auto_add = Some(AutoAddConfig {
        max_adds_per_window: 10,
        window: Duration::from_secs(3600),
        ..AutoAddConfig::new("target")
    });

    let run = Run::prepare(config, remote.clone(), StopSignal::new()).await.unwrap();
    let stats = run.stats();
    let status = run.execute().await;

    assert_eq!(status, RunStatus::Completed);
    let times = remote.add_call_times();
    assert_eq!(times.len(), 15);
    // the 11th add waits for the first to leave the window
    assert!(times[10].duration_since(times[0]) >= Duration::from_secs(3600));
    assert!(times[9].duration_since(times[0]) < Duration::from_secs(60));
    assert_eq!(stats.snapshot().auto_add_stats.successful_adds, 15);
    assert_eq!(lines(&dir.path().join(ATTEMPTS_FILE)), 15);
}

#[tokio::test(start_paused = true)]
async fn flood_wait_on_second_add_holds_the_third() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(
        MockRemote::new()
            .with_pages(vec![page(0..5)])
            .fail_add_call(2, RemoteError::RateLimit { wait_seconds: 30 }),
    );
    let mut config = run_config(dir.path());
    config.auto_add = Some(AutoAddConfig::new("target"));

    let run = Run::prepare(config, remote.clone(), StopSignal::new()).await.unwrap();
    let status = run.execute().await;

    assert_eq!(status, RunStatus::Completed);
    let times = remote.add_call_times();
    assert_eq!(times.len(), 6);
    assert!(times[2].duration_since(times[1]) >= Duration::from_secs(30));
    assert_eq!(remote.added(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn invalid_session_fails_the_run_and_still_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(
        MockRemote::new()
            .with_pages(vec![page(0..10), page(10..20)])
            .fail_pages(vec![RemoteError::SessionInvalid("logged out".into())]),
    );

    let run = Run::prepare(run_config(dir.path()), remote, StopSignal::new())
        .await
        .unwrap();
    let stats = run.stats();
    let status = run.execute().await;

    match status {
        RunStatus::Failed { cause } => assert!(cause.contains("logged out"), "cause: {cause}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(matches!(stats.snapshot().status, RunStatus::Failed { .. }));
    assert!(dir.path().join(CHECKPOINT_FILE).exists());
}

#[tokio::test(start_paused = true)]
async fn stop_request_ends_the_run_as_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MockRemote::new().with_pages(vec![page(0..10)]));
    let stop = StopSignal::new();

    let run = Run::prepare(run_config(dir.path()), remote.clone(), stop.clone())
        .await
        .unwrap();
    stop.trigger();
    let status = run.execute().await;

    assert_eq!(status, RunStatus::Stopped);
    assert_eq!(remote.page_calls(), 0);
    assert!(dir.path().join(CHECKPOINT_FILE).exists());
}

#[tokio::test(start_paused = true)]
async fn invalid_config_is_rejected_before_any_request() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MockRemote::new());
    let mut config = run_config(dir.path());
    config.group_id = "  ".into();

    let result = Run::prepare(config, remote.clone(), StopSignal::new()).await;
    assert!(result.is_err());
    assert_eq!(remote.page_calls(), 0);
}

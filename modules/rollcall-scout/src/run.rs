//! One enumeration run, optionally feeding the auto-adder.
//!
//! Enumeration and auto-add are two futures joined on the caller's task and
//! connected by an mpsc channel, so records reach the adder in discovery
//! order. Every exit path writes a final checkpoint before the terminal
//! status is published.

use std::sync::Arc;

use futures::{pin_mut, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use rollcall_common::{MemberFilter, MemberRecord, Result, RollcallError, RunConfig, RunStatus};

use crate::adder::AutoAdder;
use crate::enumerator::MemberEnumerator;
use crate::export::JsonlExporter;
use crate::governor::RateGovernor;
use crate::progress::ProgressStore;
use crate::recent::RecentMembers;
use crate::session::{RemoteApi, SessionClient};
use crate::stats::StatsAggregator;
use crate::stop::StopSignal;

const ADD_CHANNEL_CAPACITY: usize = 256;

pub struct Run {
    config: RunConfig,
    stop: StopSignal,
    session: Arc<SessionClient>,
    progress: Arc<ProgressStore>,
    stats: Arc<StatsAggregator>,
    recent: Arc<RecentMembers>,
}

impl Run {
    /// Validate the configuration and open the progress store.
    pub async fn prepare(config: RunConfig, remote: Arc<dyn RemoteApi>, stop: StopSignal) -> Result<Self> {
        config.validate()?;
        let progress = Arc::new(
            ProgressStore::open(&config.output_dir, config.checkpoint.clone(), config.resume).await?,
        );
        let governor = Arc::new(RateGovernor::new(config.governor.clone(), stop.clone()));
        let session = Arc::new(SessionClient::new(remote, governor, config.session.clone()));
        let stats = Arc::new(StatsAggregator::new(config.rate_smoothing));
        Ok(Self {
            config,
            stop,
            session,
            progress,
            stats,
            recent: Arc::new(RecentMembers::default()),
        })
    }

    pub fn stats(&self) -> Arc<StatsAggregator> {
        self.stats.clone()
    }

    pub fn recent(&self) -> Arc<RecentMembers> {
        self.recent.clone()
    }

    pub fn progress(&self) -> Arc<ProgressStore> {
        self.progress.clone()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Drive the run to a terminal status.
    pub async fn execute(self) -> RunStatus {
        self.config.log_summary();
        let reporter = self
            .stats
            .spawn_reporter(self.config.report_interval, self.stop.clone());

        let outcome = self.drive().await;
        let checkpointed = self.progress.checkpoint().await;

        let status = match (outcome, checkpointed) {
            (Err(RollcallError::Cancelled), Ok(())) => RunStatus::Stopped,
            (Ok(()), Ok(())) if self.stop.is_stopped() => RunStatus::Stopped,
            (Ok(()), Ok(())) => RunStatus::Completed,
            (_, Err(e)) | (Err(e), _) => {
                error!(error = %e, "Run failed");
                RunStatus::Failed { cause: e.to_string() }
            }
        };

        self.stats.tick();
        self.stats.finish(status.clone());
        reporter.abort();
        status
    }

    async fn drive(&self) -> Result<()> {
        let exporter = Mutex::new(JsonlExporter::open(&self.config.output_dir, self.config.resume).await?);

        let mut enumerator = MemberEnumerator::new(
            self.session.clone(),
            self.progress.clone(),
            self.stats.clone(),
        )
        .with_max_uids(self.config.max_uids);
        if !self.config.filter.is_empty() {
            enumerator = enumerator.with_filter(MemberFilter::new(self.config.filter.clone())?);
        }
        let resume_cursor = if self.config.resume {
            self.progress.cursor()
        } else {
            None
        };

        let result = match &self.config.auto_add {
            None => self.enumerate(&enumerator, resume_cursor, &exporter, None).await,
            Some(add_config) => {
                let adder = AutoAdder::new(
                    self.session.clone(),
                    self.progress.clone(),
                    self.stats.clone(),
                    add_config.clone(),
                    self.stop.clone(),
                );
                let (tx, rx) = mpsc::channel(ADD_CHANNEL_CAPACITY);
                let (enumerated, added) = tokio::join!(
                    self.enumerate(&enumerator, resume_cursor, &exporter, Some(tx)),
                    self.add(&adder, receiver_stream(rx), &exporter),
                );
                first_failure(enumerated, added)
            }
        };

        exporter.lock().await.flush().await?;
        result
    }

    async fn enumerate(
        &self,
        enumerator: &MemberEnumerator,
        resume_cursor: Option<String>,
        exporter: &Mutex<JsonlExporter>,
        tx: Option<mpsc::Sender<MemberRecord>>,
    ) -> Result<()> {
        let stream = enumerator.enumerate(&self.config.group_id, resume_cursor);
        pin_mut!(stream);
        while let Some(item) = stream.next().await {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    self.halt_on_fatal(&e);
                    return Err(e);
                }
            };
            self.recent.push(record.clone());
            if let Err(e) = exporter.lock().await.write_member(&record).await {
                self.halt_on_fatal(&e);
                return Err(e);
            }
            if let Some(tx) = &tx {
                if tx.send(record).await.is_err() {
                    warn!("Auto-adder ended early, stopping enumeration");
                    break;
                }
            }
        }
        info!(group = self.config.group_id.as_str(), "Enumeration finished");
        Ok(())
    }

    async fn add<S>(&self, adder: &AutoAdder, records: S, exporter: &Mutex<JsonlExporter>) -> Result<()>
    where
        S: Stream<Item = MemberRecord>,
    {
        let attempts = adder.process(records);
        pin_mut!(attempts);
        while let Some(item) = attempts.next().await {
            let written = match item {
                Ok(attempt) => match exporter.lock().await.write_attempt(&attempt).await {
                    Ok(()) => self.progress.checkpoint_if_stale().await.map(|_| ()),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                self.halt_on_fatal(&e);
                return Err(e);
            }
        }
        info!(
            target_group = adder.target_group_id(),
            pending = adder.pending_len(),
            "Auto-add finished"
        );
        Ok(())
    }

    /// A fatal error on one side stops the other side too.
    fn halt_on_fatal(&self, err: &RollcallError) {
        if err.is_fatal() {
            self.stop.trigger();
        }
    }
}

fn receiver_stream<T>(rx: mpsc::Receiver<T>) -> impl Stream<Item = T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

/// The more informative of two results: a real error beats `Cancelled`,
/// which beats success.
fn first_failure(a: Result<()>, b: Result<()>) -> Result<()> {
    match (a, b) {
        (Err(RollcallError::Cancelled), Err(e)) | (Err(e), _) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

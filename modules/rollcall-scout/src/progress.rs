//! Durable, resumable progress.
//!
//! Two files under the output directory:
//! - `checkpoint.json`: full snapshot (cursor + scraped/added sets), rewritten
//!   periodically via temp file + fsync + rename.
//! - `added.log`: one uid per line, appended and fsynced the moment an add
//!   succeeds, so a crash between checkpoints can never lose an add-mark.
//!
//! `load` unions both, so the log only ever has to be appended to.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use rollcall_common::{CheckpointConfig, Result, RollcallError, Uid};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const ADDED_LOG_FILE: &str = "added.log";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCheckpoint {
    pub cursor: Option<String>,
    pub scraped_uids: BTreeSet<Uid>,
    pub added_uids: BTreeSet<Uid>,
}

struct CheckpointClock {
    last_at: Instant,
    pages_since: u32,
}

pub struct ProgressStore {
    dir: PathBuf,
    policy: CheckpointConfig,
    state: Mutex<ProgressCheckpoint>,
    added_log: tokio::sync::Mutex<File>,
    /// Serializes checkpoint writers; they share one temp file.
    checkpoint_lock: tokio::sync::Mutex<()>,
    clock: Mutex<CheckpointClock>,
}

impl ProgressStore {
    /// Open the store in `dir`. With `resume` the previous checkpoint and add
    /// log are loaded; without it both are reset.
    pub async fn open(dir: impl AsRef<Path>, policy: CheckpointConfig, resume: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(storage_err)?;

        let state = if resume {
            let loaded = Self::load(&dir).await?;
            info!(
                cursor = loaded.cursor.as_deref().unwrap_or(""),
                scraped = loaded.scraped_uids.len(),
                added = loaded.added_uids.len(),
                "Resuming from checkpoint"
            );
            loaded
        } else {
            for file in [CHECKPOINT_FILE, ADDED_LOG_FILE] {
                match fs::remove_file(dir.join(file)).await {
                    Ok(()) => warn!(file, "Discarded previous progress (resume not requested)"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(storage_err(e)),
                }
            }
            ProgressCheckpoint::default()
        };

        let added_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(ADDED_LOG_FILE))
            .await
            .map_err(storage_err)?;

        Ok(Self {
            dir,
            policy,
            state: Mutex::new(state),
            added_log: tokio::sync::Mutex::new(added_log),
            checkpoint_lock: tokio::sync::Mutex::new(()),
            clock: Mutex::new(CheckpointClock {
                last_at: Instant::now(),
                pages_since: 0,
            }),
        })
    }

    /// Read whatever progress exists in `dir`. Missing files mean empty progress.
    pub async fn load(dir: impl AsRef<Path>) -> Result<ProgressCheckpoint> {
        let dir = dir.as_ref();
        let mut checkpoint = match fs::read(dir.join(CHECKPOINT_FILE)).await {
            Ok(bytes) => serde_json::from_slice::<ProgressCheckpoint>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProgressCheckpoint::default(),
            Err(e) => return Err(e.into()),
        };

        match fs::read_to_string(dir.join(ADDED_LOG_FILE)).await {
            Ok(text) => {
                for line in text.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match line.parse::<Uid>() {
                        Ok(uid) => {
                            checkpoint.added_uids.insert(uid);
                        }
                        // A torn final line from a crash mid-append.
                        Err(_) => warn!(line, "Skipping unreadable add-log line"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(checkpoint)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_scraped(&self, uid: Uid) -> bool {
        self.lock().scraped_uids.contains(&uid)
    }

    /// Record a uid as scraped. Returns `false` if it was already known.
    pub fn mark_scraped(&self, uid: Uid) -> bool {
        self.lock().scraped_uids.insert(uid)
    }

    pub fn is_added(&self, uid: Uid) -> bool {
        self.lock().added_uids.contains(&uid)
    }

    /// Durably record a successful add before returning.
    pub async fn mark_added(&self, uid: Uid) -> Result<()> {
        if self.is_added(uid) {
            return Ok(());
        }
        {
            let mut log = self.added_log.lock().await;
            log.write_all(format!("{uid}\n").as_bytes())
                .await
                .map_err(storage_err)?;
            log.sync_data().await.map_err(storage_err)?;
        }
        self.lock().added_uids.insert(uid);
        debug!(uid, "Add-mark persisted");
        Ok(())
    }

    pub fn cursor(&self) -> Option<String> {
        self.lock().cursor.clone()
    }

    pub fn set_cursor(&self, cursor: Option<String>) {
        self.lock().cursor = cursor;
    }

    pub fn snapshot(&self) -> ProgressCheckpoint {
        self.lock().clone()
    }

    /// Write the full snapshot atomically.
    pub async fn checkpoint(&self) -> Result<()> {
        let _writer = self.checkpoint_lock.lock().await;
        let snapshot = self.snapshot();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = self.dir.join(format!("{CHECKPOINT_FILE}.tmp"));

        let mut file = File::create(&tmp).await.map_err(storage_err)?;
        file.write_all(&bytes).await.map_err(storage_err)?;
        file.sync_all().await.map_err(storage_err)?;
        drop(file);
        fs::rename(&tmp, self.dir.join(CHECKPOINT_FILE))
            .await
            .map_err(storage_err)?;

        let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        clock.last_at = Instant::now();
        clock.pages_since = 0;
        debug!(
            scraped = snapshot.scraped_uids.len(),
            added = snapshot.added_uids.len(),
            "Checkpoint written"
        );
        Ok(())
    }

    /// Count a committed page and checkpoint if the page or time budget is spent.
    pub async fn page_committed(&self) -> Result<bool> {
        let due = {
            let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
            clock.pages_since += 1;
            clock.pages_since >= self.policy.every_pages
                || clock.last_at.elapsed() >= self.policy.interval
        };
        if due {
            self.checkpoint().await?;
        }
        Ok(due)
    }

    /// Checkpoint if the time budget alone is spent (for the periodic ticker).
    pub async fn checkpoint_if_stale(&self) -> Result<bool> {
        let stale = {
            let clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
            clock.last_at.elapsed() >= self.policy.interval
        };
        if stale {
            self.checkpoint().await?;
        }
        Ok(stale)
    }

    // The sets are only touched between awaits, so a poisoned lock still
    // holds consistent data.
    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressCheckpoint> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn storage_err(e: std::io::Error) -> RollcallError {
    RollcallError::Storage(e.to_string())
}

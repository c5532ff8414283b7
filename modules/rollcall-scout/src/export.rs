use std::path::Path;

use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use rollcall_common::{AddAttempt, MemberRecord, Result, RollcallError};

pub const MEMBERS_FILE: &str = "members.jsonl";
pub const ATTEMPTS_FILE: &str = "attempts.jsonl";

/// Appends discovered members and add attempts as JSON lines.
///
/// A fresh run truncates both files; a resumed run appends to them.
pub struct JsonlExporter {
    members: File,
    attempts: File,
}

impl JsonlExporter {
    pub async fn open(dir: impl AsRef<Path>, resume: bool) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            members: open_jsonl(&dir.join(MEMBERS_FILE), resume).await?,
            attempts: open_jsonl(&dir.join(ATTEMPTS_FILE), resume).await?,
        })
    }

    pub async fn write_member(&mut self, record: &MemberRecord) -> Result<()> {
        write_line(&mut self.members, record).await
    }

    pub async fn write_attempt(&mut self, attempt: &AddAttempt) -> Result<()> {
        write_line(&mut self.attempts, attempt).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.members.flush().await.map_err(storage_err)?;
        self.attempts.flush().await.map_err(storage_err)?;
        Ok(())
    }
}

async fn open_jsonl(path: &Path, resume: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.create(true);
    if resume {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options.open(path).await.map_err(storage_err)
}

async fn write_line<T: Serialize>(file: &mut File, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    file.write_all(&line).await.map_err(storage_err)
}

fn storage_err(e: std::io::Error) -> RollcallError {
    RollcallError::Storage(e.to_string())
}

// Local chat store — append-only messages.jsonl with expiry
//
// One JSON object per line, `{sender, message, timestamp}`. The expiry
// window comes from MESSAGE_EXPIRY_TIME: -1 keeps everything, 0 drops
// messages before they are ever written, anything else is a horizon in
// seconds applied on read.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("chat store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chat store serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub sender: String,
    pub message: String,
    pub timestamp: u64,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct Inner {
    /// Messages appended since the last `drain_unread`.
    unread: Vec<StoredMessage>,
}

pub struct MessageStore {
    path: PathBuf,
    expiry: i64,
    inner: Mutex<Inner>,
}

impl MessageStore {
    pub fn open(dir: &std::path::Path, expiry: i64) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join("messages.jsonl"),
            expiry,
            inner: Mutex::new(Inner { unread: Vec::new() }),
        })
    }

    fn live(&self, message: &StoredMessage, at: u64) -> bool {
        match self.expiry {
            -1 => true,
            0 => false,
            window => message.timestamp + window as u64 > at,
        }
    }

    /// Record a received message. With expiry 0 nothing is kept at all.
    pub fn append(&self, sender: &str, message: &str) -> Result<(), StorageError> {
        if self.expiry == 0 {
            return Ok(());
        }
        let record = StoredMessage {
            sender: sender.to_string(),
            message: message.to_string(),
            timestamp: now(),
        };
        let line = serde_json::to_string(&record)?;

        let mut inner = self.inner.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        inner.unread.push(record);
        Ok(())
    }

    /// Messages received since the last call, oldest first, expired ones
    /// dropped.
    pub fn drain_unread(&self) -> Vec<StoredMessage> {
        let at = now();
        let mut inner = self.inner.lock();
        let drained = std::mem::take(&mut inner.unread);
        drained.into_iter().filter(|m| self.live(m, at)).collect()
    }

    /// Everything still inside the expiry window, oldest first.
    pub fn all(&self) -> Result<Vec<StoredMessage>, StorageError> {
        let at = now();
        let _guard = self.inner.lock();
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let mut messages = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let record: StoredMessage = serde_json::from_str(line)?;
            if self.live(&record, at) {
                messages.push(record);
            }
        }
        Ok(messages)
    }

    /// Rewrite the log dropping expired entries.
    pub fn prune(&self) -> Result<(), StorageError> {
        if self.expiry < 0 {
            return Ok(());
        }
        let live = self.all()?;
        let _guard = self.inner.lock();
        let mut out = String::new();
        for record in &live {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        fs::write(&self.path, out)?;
        Ok(())
    }
}

//! src/queue.rs
//!
//! Store-and-forward queuing. A hub that cannot currently reach a peer parks
//! messages addressed to it here instead of dropping them, and flushes the
//! backlog once a connection to that peer opens.
//!
//! There is no durable key-value store anywhere in the retrieved example
//! pack, so this mirrors the host codebase's own persistence idiom instead:
//! plain files under a data directory, one BSON record appended per queued
//! message. A key's queue lives at `data_dir/queue/<hex peer id>`.

use crate::domain::{Message, PeerId};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Store-and-forward backlog keyed by recipient `PeerId`.
///
/// Implementations must preserve FIFO order per key and must not lose
/// messages that were successfully `enqueue`d, even across a crash between
/// `enqueue` and `drain`.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn enqueue(&self, recipient: PeerId, message: Message) -> Result<()>;

    /// Removes and returns every message queued for `recipient`, oldest
    /// first. An empty queue (or no queue at all) returns an empty `Vec`.
    async fn drain(&self, recipient: PeerId) -> Result<Vec<Message>>;

    /// Number of messages currently queued for `recipient`, without
    /// consuming them. Used by the periodic flush sweep to decide whether a
    /// peer is worth dialing.
    async fn len(&self, recipient: PeerId) -> Result<usize>;

    /// Every recipient with at least one queued message.
    async fn pending_recipients(&self) -> Result<Vec<PeerId>>;
}

/// On-disk `MessageQueue`: one append-only file per recipient under
/// `<root>/<hex peer id>`, each record length-prefixed-free since BSON
/// documents self-delimit via their leading `i32` length field.
pub struct FileMessageQueue {
    root: PathBuf,
    /// Serializes append/drain access per key so a drain never races a
    /// concurrent enqueue into a half-truncated file.
    locks: Mutex<HashMap<PeerId, Arc<Mutex<()>>>>,
}

impl FileMessageQueue {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, recipient: PeerId) -> PathBuf {
        self.root.join(recipient.to_hex())
    }

    async fn lock_for(&self, recipient: PeerId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(recipient)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_all(path: &Path) -> Result<Vec<Message>> {
        let mut buf = Vec::new();
        match File::open(path).await {
            Ok(mut f) => {
                f.read_to_end(&mut buf).await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let mut messages = Vec::new();
        let mut cursor = std::io::Cursor::new(buf.as_slice());
        while (cursor.position() as usize) < buf.len() {
            let message: Message = bson::from_reader(&mut cursor)?;
            messages.push(message);
        }
        Ok(messages)
    }
}

#[async_trait]
impl MessageQueue for FileMessageQueue {
    async fn enqueue(&self, recipient: PeerId, message: Message) -> Result<()> {
        let lock = self.lock_for(recipient).await;
        let _guard = lock.lock().await;

        let path = self.path_for(recipient);
        let bytes = bson::to_vec(&message)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }

    async fn drain(&self, recipient: PeerId) -> Result<Vec<Message>> {
        let lock = self.lock_for(recipient).await;
        let _guard = lock.lock().await;

        let path = self.path_for(recipient);
        let messages = Self::read_all(&path).await?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(messages)
    }

    async fn len(&self, recipient: PeerId) -> Result<usize> {
        let path = self.path_for(recipient);
        Ok(Self::read_all(&path).await?.len())
    }

    async fn pending_recipients(&self) -> Result<Vec<PeerId>> {
        let mut recipients = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = PeerId::from_hex(name) {
                    recipients.push(id);
                }
            }
        }
        Ok(recipients)
    }
}

/// In-memory test double; same FIFO/empty-queue semantics as
/// `FileMessageQueue`, without touching the filesystem.
#[derive(Default)]
pub struct InMemoryMessageQueue {
    queues: Mutex<HashMap<PeerId, Vec<Message>>>,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn enqueue(&self, recipient: PeerId, message: Message) -> Result<()> {
        self.queues.lock().await.entry(recipient).or_default().push(message);
        Ok(())
    }

    async fn drain(&self, recipient: PeerId) -> Result<Vec<Message>> {
        Ok(self.queues.lock().await.remove(&recipient).unwrap_or_default())
    }

    async fn len(&self, recipient: PeerId) -> Result<usize> {
        Ok(self
            .queues
            .lock()
            .await
            .get(&recipient)
            .map(Vec::len)
            .unwrap_or(0))
    }

    async fn pending_recipients(&self) -> Result<Vec<PeerId>> {
        Ok(self
            .queues
            .lock()
            .await
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| *k)
            .collect())
    }
}

//! Conversation threads keyed by (sender, recipient).

mod persistence;

pub use persistence::{FileThreadPersistence, ThreadPersistence};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::error::SwarmError;
use crate::types::Message;

/// Sender used for turns started from outside the swarm.
pub const USER_SENDER: &str = "user";

/// Ordered (sender, recipient) pair identifying a thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey {
    pub sender: String,
    pub recipient: String,
}

impl ThreadKey {
    pub fn new(sender: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
        }
    }

    /// Stable hex digest, safe to use as a file name.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sender.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.recipient.as_bytes());
        hasher
            .finalize()
            .iter()
            .take(16)
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }

    /// Parse the `sender->recipient` display form.
    pub fn parse(raw: &str) -> Option<Self> {
        let (sender, recipient) = raw.split_once("->")?;
        let (sender, recipient) = (sender.trim(), recipient.trim());
        (!sender.is_empty() && !recipient.is_empty()).then(|| Self::new(sender, recipient))
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.sender, self.recipient)
    }
}

/// One conversation. Appends are serialized; a turn holds `begin_turn` for
/// its whole duration so turns on the same pair never interleave.
#[derive(Debug)]
pub struct Thread {
    key: ThreadKey,
    created_at: DateTime<Utc>,
    messages: RwLock<Vec<Message>>,
    turn: Mutex<()>,
}

impl Thread {
    fn new(key: ThreadKey, messages: Vec<Message>) -> Self {
        Self {
            key,
            created_at: Utc::now(),
            messages: RwLock::new(messages),
            turn: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &ThreadKey {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Copy of the history at this instant.
    pub async fn history(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    /// Append at the tail; returns the message's position.
    pub(crate) async fn append(&self, message: Message) -> usize {
        let mut messages = self.messages.write().await;
        messages.push(message);
        messages.len() - 1
    }

    /// Exclusive right to run a turn on this thread.
    pub async fn begin_turn(&self) -> MutexGuard<'_, ()> {
        self.turn.lock().await
    }

    /// `begin_turn` without waiting; `None` while another turn holds it.
    pub fn try_begin_turn(&self) -> Option<MutexGuard<'_, ()>> {
        self.turn.try_lock().ok()
    }

    pub async fn record(&self) -> ThreadRecord {
        ThreadRecord {
            key: self.key.clone(),
            messages: self.history().await,
        }
    }
}

/// Serializable copy of one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub key: ThreadKey,
    pub messages: Vec<Message>,
}

/// Serializable copy of a whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub threads: Vec<ThreadRecord>,
}

impl ThreadSnapshot {
    pub fn get(&self, key: &ThreadKey) -> Option<&ThreadRecord> {
        self.threads.iter().find(|record| &record.key == key)
    }
}

/// Registry of threads. Different keys never contend beyond the brief map
/// lookup; see [`Thread`] for per-thread ordering.
#[derive(Debug, Default)]
pub struct ThreadStore {
    threads: RwLock<HashMap<ThreadKey, Arc<Thread>>>,
}

impl ThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the thread for the pair, creating it on first use.
    pub async fn get_or_create(
        &self,
        sender: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Arc<Thread> {
        let key = ThreadKey::new(sender, recipient);
        if let Some(thread) = self.threads.read().await.get(&key) {
            return Arc::clone(thread);
        }

        let mut threads = self.threads.write().await;
        let thread = threads.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(thread = %key, "created thread");
            Arc::new(Thread::new(key, Vec::new()))
        });
        Arc::clone(thread)
    }

    pub async fn get(&self, key: &ThreadKey) -> Option<Arc<Thread>> {
        self.threads.read().await.get(key).cloned()
    }

    async fn require(&self, key: &ThreadKey) -> Result<Arc<Thread>, SwarmError> {
        self.get(key)
            .await
            .ok_or_else(|| SwarmError::UnknownThread(key.to_string()))
    }

    /// Append at the tail of an existing thread.
    pub async fn append(&self, key: &ThreadKey, message: Message) -> Result<usize, SwarmError> {
        Ok(self.require(key).await?.append(message).await)
    }

    /// Copy of a thread's history.
    pub async fn history(&self, key: &ThreadKey) -> Result<Vec<Message>, SwarmError> {
        Ok(self.require(key).await?.history().await)
    }

    /// All keys, sorted.
    pub async fn keys(&self) -> Vec<ThreadKey> {
        let mut keys: Vec<_> = self.threads.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.threads.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.threads.read().await.is_empty()
    }

    /// Copy every thread, sorted by key.
    pub async fn snapshot(&self) -> ThreadSnapshot {
        let threads: Vec<_> = {
            let map = self.threads.read().await;
            map.values().cloned().collect()
        };
        let mut records = Vec::with_capacity(threads.len());
        for thread in threads {
            records.push(thread.record().await);
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        ThreadSnapshot { threads: records }
    }

    /// Load threads from a snapshot. Keys that already hold messages are
    /// left untouched; returns how many threads were restored.
    pub async fn restore(&self, snapshot: ThreadSnapshot) -> usize {
        let mut threads = self.threads.write().await;
        let mut restored = 0;
        for record in snapshot.threads {
            match threads.get(&record.key) {
                Some(existing) => {
                    let mut messages = existing.messages.write().await;
                    if !messages.is_empty() {
                        tracing::warn!(thread = %record.key, "thread already has history; not restoring");
                        continue;
                    }
                    *messages = record.messages;
                }
                None => {
                    let key = record.key.clone();
                    threads.insert(key, Arc::new(Thread::new(record.key, record.messages)));
                }
            }
            restored += 1;
        }
        restored
    }
}

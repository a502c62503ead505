use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ThreadKey, ThreadRecord, ThreadSnapshot};
use crate::error::SwarmError;
use crate::types::Message;

const FILE_VERSION: u32 = 1;

/// Storage abstraction for persisted threads.
pub trait ThreadPersistence: Send + Sync {
    fn load(&self) -> Result<ThreadSnapshot, SwarmError>;
    fn save_thread(&self, record: &ThreadRecord) -> Result<(), SwarmError>;
    fn clear(&self, key: &ThreadKey) -> Result<(), SwarmError>;

    fn save(&self, snapshot: &ThreadSnapshot) -> Result<(), SwarmError> {
        snapshot
            .threads
            .iter()
            .try_for_each(|record| self.save_thread(record))
    }
}

/// Directory of JSON files, one per thread, named by the key digest.
#[derive(Debug, Clone)]
pub struct FileThreadPersistence {
    dir: PathBuf,
}

impl FileThreadPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.swarmkit/threads`.
    pub fn new_default() -> Self {
        Self::new(crate::config::default_swarmkit_dir().join("threads"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn thread_path(&self, key: &ThreadKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.digest()))
    }
}

impl ThreadPersistence for FileThreadPersistence {
    fn load(&self) -> Result<ThreadSnapshot, SwarmError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ThreadSnapshot::default())
            }
            Err(err) => return Err(err.into()),
        };

        let mut threads = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            match serde_json::from_str::<ThreadFile>(&raw) {
                Ok(file) => threads.push(ThreadRecord {
                    key: file.key,
                    messages: file.messages,
                }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable thread file");
                }
            }
        }
        threads.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(ThreadSnapshot { threads })
    }

    fn save_thread(&self, record: &ThreadRecord) -> Result<(), SwarmError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.thread_path(&record.key);
        let file = ThreadFile {
            version: FILE_VERSION,
            key: record.key.clone(),
            saved_at: Utc::now(),
            messages: record.messages.clone(),
        };
        let serialized = serde_json::to_string_pretty(&file)?;

        // Write then rename so a crash never leaves a half-written file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn clear(&self, key: &ThreadKey) -> Result<(), SwarmError> {
        match fs::remove_file(self.thread_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThreadFile {
    version: u32,
    key: ThreadKey,
    saved_at: DateTime<Utc>,
    messages: Vec<Message>,
}

//! Durable store backed by JSON documents in a state directory.
//!
//! Layout:
//!
//! ```text
//! <state>/triggers.json    resource id -> TriggerRecord
//! <state>/parameters.json  path -> ParameterEntry
//! <state>/secrets.json     name -> SecretEntry (mode 0600 on unix)
//! <state>/.keel.lock       advisory run lock
//! ```
//!
//! Every write replaces the whole document through a temp file and a
//! rename, so a crash never leaves a half-written record behind.

use async_trait::async_trait;
use fs2::FileExt;
use keel_core::store::{
    ParameterEntry, ParameterStore, RunGuard, RunLock, SecretEntry, SecretStore, TriggerRecord,
    TriggerStore,
};
use keel_core::{Error, Result, RunId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{StoreError, StoreResult};

const TRIGGERS_FILE: &str = "triggers.json";
const PARAMETERS_FILE: &str = "parameters.json";
const SECRETS_FILE: &str = "secrets.json";
const LOCK_FILE: &str = ".keel.lock";

/// One JSON document held in memory and flushed on every change.
struct Document<T> {
    path: PathBuf,
    private: bool,
    entries: RwLock<BTreeMap<String, T>>,
}

impl<T> Document<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    async fn load(path: PathBuf, private: bool) -> StoreResult<Self> {
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path,
            private,
            entries: RwLock::new(entries),
        })
    }

    async fn get(&self, key: &str) -> Option<T> {
        self.entries.read().await.get(key).cloned()
    }

    async fn list(&self, prefix: &str) -> Vec<String> {
        self.entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Apply `change` and persist. The in-memory copy is only updated once
    /// the document is on disk.
    async fn update(&self, change: impl FnOnce(&mut BTreeMap<String, T>)) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        change(&mut next);
        let bytes = serde_json::to_vec_pretty(&next)?;
        write_atomic(&self.path, &bytes, self.private).await?;
        *entries = next;
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8], private: bool) -> StoreResult<()> {
    let tmp = path.with_extension("json.tmp");
    let io_err = |source| StoreError::Io {
        path: tmp.clone(),
        source,
    };

    // A leftover temp file would keep its old permissions.
    let _ = tokio::fs::remove_file(&tmp).await;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        if private {
            options.mode(0o600);
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(&tmp).await.map_err(io_err)?;
    file.write_all(bytes).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), "Store document written");
    Ok(())
}

/// File-backed implementation of every store trait.
pub struct FileStore {
    dir: PathBuf,
    triggers: Document<TriggerRecord>,
    parameters: Document<ParameterEntry>,
    secrets: Document<SecretEntry>,
}

impl FileStore {
    /// Open (creating if needed) the state directory.
    pub async fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;

        Ok(Self {
            triggers: Document::load(dir.join(TRIGGERS_FILE), false).await?,
            parameters: Document::load(dir.join(PARAMETERS_FILE), false).await?,
            secrets: Document::load(dir.join(SECRETS_FILE), true).await?,
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }
}

#[async_trait]
impl TriggerStore for FileStore {
    async fn get(&self, resource_id: &str) -> Result<Option<TriggerRecord>> {
        Ok(self.triggers.get(resource_id).await)
    }

    async fn put(&self, record: TriggerRecord) -> Result<()> {
        self.triggers
            .update(|m| {
                m.insert(record.resource_id.clone(), record);
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, resource_id: &str) -> Result<()> {
        self.triggers
            .update(|m| {
                m.remove(resource_id);
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ParameterStore for FileStore {
    async fn get(&self, path: &str) -> Result<ParameterEntry> {
        self.parameters
            .get(path)
            .await
            .ok_or_else(|| Error::NotFound(format!("parameter {path}")))
    }

    async fn put(&self, entry: ParameterEntry) -> Result<()> {
        self.parameters
            .update(|m| {
                m.insert(entry.name.clone(), entry);
            })
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.parameters.list(prefix).await)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.parameters
            .update(|m| {
                m.remove(path);
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for FileStore {
    async fn get(&self, name: &str) -> Result<SecretEntry> {
        self.secrets
            .get(name)
            .await
            .ok_or_else(|| Error::NotFound(format!("secret {name}")))
    }

    async fn put(&self, entry: SecretEntry) -> Result<()> {
        self.secrets
            .update(|m| {
                m.insert(entry.name.clone(), entry);
            })
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.secrets.list(prefix).await)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.secrets
            .update(|m| {
                m.remove(name);
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RunLock for FileStore {
    async fn acquire(&self, run_id: RunId) -> Result<RunGuard> {
        let path = self.lock_path();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;

        if file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(self.dir.clone()).into());
        }
        debug!(run_id = %run_id, path = %path.display(), "Run lock acquired");
        // The OS releases the advisory lock when the file handle is dropped.
        Ok(RunGuard::new(run_id, file))
    }
}

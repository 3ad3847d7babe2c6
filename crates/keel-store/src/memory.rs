//! In-memory store backend.

use async_trait::async_trait;
use keel_core::store::{
    ParameterEntry, ParameterStore, RunGuard, RunLock, SecretEntry, SecretStore, TriggerRecord,
    TriggerStore,
};
use keel_core::{Error, Result, RunId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Keeps everything in process memory. Used by tests and dry runs.
#[derive(Default)]
pub struct InMemoryStore {
    triggers: RwLock<BTreeMap<String, TriggerRecord>>,
    parameters: RwLock<BTreeMap<String, ParameterEntry>>,
    secrets: RwLock<BTreeMap<String, SecretEntry>>,
    run_lock: Arc<Mutex<()>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn list_prefixed<T>(map: &BTreeMap<String, T>, prefix: &str) -> Vec<String> {
    map.keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect()
}

#[async_trait]
impl TriggerStore for InMemoryStore {
    async fn get(&self, resource_id: &str) -> Result<Option<TriggerRecord>> {
        Ok(self.triggers.read().await.get(resource_id).cloned())
    }

    async fn put(&self, record: TriggerRecord) -> Result<()> {
        self.triggers
            .write()
            .await
            .insert(record.resource_id.clone(), record);
        Ok(())
    }

    async fn delete(&self, resource_id: &str) -> Result<()> {
        self.triggers.write().await.remove(resource_id);
        Ok(())
    }
}

#[async_trait]
impl ParameterStore for InMemoryStore {
    async fn get(&self, path: &str) -> Result<ParameterEntry> {
        self.parameters
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("parameter {path}")))
    }

    async fn put(&self, entry: ParameterEntry) -> Result<()> {
        self.parameters
            .write()
            .await
            .insert(entry.name.clone(), entry);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(list_prefixed(&*self.parameters.read().await, prefix))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.parameters.write().await.remove(path);
        Ok(())
    }
}

#[async_trait]
impl SecretStore for InMemoryStore {
    async fn get(&self, name: &str) -> Result<SecretEntry> {
        self.secrets
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret {name}")))
    }

    async fn put(&self, entry: SecretEntry) -> Result<()> {
        self.secrets.write().await.insert(entry.name.clone(), entry);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(list_prefixed(&*self.secrets.read().await, prefix))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.secrets.write().await.remove(name);
        Ok(())
    }
}

#[async_trait]
impl RunLock for InMemoryStore {
    async fn acquire(&self, run_id: RunId) -> Result<RunGuard> {
        let guard = self
            .run_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::Conflict("store is held by another run".to_string()))?;
        Ok(RunGuard::new(run_id, guard))
    }
}

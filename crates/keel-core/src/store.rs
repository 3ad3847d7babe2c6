//! Store abstractions for trigger records and propagated outputs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::value::{Outputs, REDACTED, Scalar, Value};
use crate::{Error, Result, RunId};

/// The key and output of the last successful build action for a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub resource_id: String,
    pub last_key: String,
    pub last_output: Outputs,
    pub applied_at: DateTime<Utc>,
}

impl TriggerRecord {
    pub fn new(resource_id: impl Into<String>, key: impl Into<String>, output: Outputs) -> Self {
        Self {
            resource_id: resource_id.into(),
            last_key: key.into(),
            last_output: output,
            applied_at: Utc::now(),
        }
    }
}

/// A non-sensitive output published under `/<domain>/<key>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterEntry {
    pub name: String,
    pub value: Scalar,
    pub producer_node_id: String,
}

impl ParameterEntry {
    /// Build a parameter entry. Sensitive values are rejected so they can
    /// never reach the plain store.
    pub fn from_value(name: impl Into<String>, value: &Value, producer: impl Into<String>) -> Result<Self> {
        let name = name.into();
        match value {
            Value::Literal(s) => Ok(Self {
                name,
                value: s.clone(),
                producer_node_id: producer.into(),
            }),
            Value::Secret(_) => Err(Error::PublishFailed {
                path: name,
                cause: "sensitive value cannot be published as a parameter".to_string(),
            }),
            Value::Reference(r) => Err(Error::InternalInvariantViolation(format!(
                "unresolved reference {r} published to '{name}'"
            ))),
        }
    }
}

/// A sensitive output published under a secret name.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretEntry {
    pub name: String,
    pub value: Scalar,
    pub producer_node_id: String,
}

impl SecretEntry {
    pub fn from_value(name: impl Into<String>, value: &Value, producer: impl Into<String>) -> Result<Self> {
        let name = name.into();
        match value.scalar() {
            Some(s) => Ok(Self {
                name,
                value: s.clone(),
                producer_node_id: producer.into(),
            }),
            None => Err(Error::InternalInvariantViolation(format!(
                "unresolved reference published to secret '{name}'"
            ))),
        }
    }
}

impl fmt::Debug for SecretEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretEntry")
            .field("name", &self.name)
            .field("value", &REDACTED)
            .field("producer_node_id", &self.producer_node_id)
            .finish()
    }
}

/// One item of a publish batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Parameter(ParameterEntry),
    Secret(SecretEntry),
}

impl Entry {
    pub fn path(&self) -> &str {
        match self {
            Entry::Parameter(p) => &p.name,
            Entry::Secret(s) => &s.name,
        }
    }
}

/// Persistent trigger records, keyed by resource id.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    async fn get(&self, resource_id: &str) -> Result<Option<TriggerRecord>>;

    /// Replace the record for `record.resource_id`. Must be all-or-nothing.
    async fn put(&self, record: TriggerRecord) -> Result<()>;

    async fn delete(&self, resource_id: &str) -> Result<()>;
}

/// Plain configuration store.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<ParameterEntry>;

    /// Create or overwrite a parameter.
    async fn put(&self, entry: ParameterEntry) -> Result<()>;

    /// List parameter paths with a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, path: &str) -> Result<()>;
}

/// Secret-typed store.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<SecretEntry>;

    /// Create or overwrite a secret.
    async fn put(&self, entry: SecretEntry) -> Result<()>;

    /// List secret names with a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, name: &str) -> Result<()>;
}

/// Held for the duration of a run. Dropping it releases the lock.
pub struct RunGuard {
    run_id: RunId,
    _held: Box<dyn Send + Sync>,
}

impl RunGuard {
    pub fn new(run_id: RunId, held: impl Send + Sync + 'static) -> Self {
        Self {
            run_id,
            _held: Box::new(held),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }
}

impl fmt::Debug for RunGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunGuard").field("run_id", &self.run_id).finish()
    }
}

/// Run-level write lock over a set of stores.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// Acquire the lock for `run_id`, failing with `Conflict` if another run holds it.
    async fn acquire(&self, run_id: RunId) -> Result<RunGuard>;
}

/// The store handles an orchestrator is constructed with.
#[derive(Clone)]
pub struct Stores {
    pub triggers: Arc<dyn TriggerStore>,
    pub parameters: Arc<dyn ParameterStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub lock: Arc<dyn RunLock>,
}

impl Stores {
    /// Use one backend for every store.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: TriggerStore + ParameterStore + SecretStore + RunLock + 'static,
    {
        Self {
            triggers: backend.clone(),
            parameters: backend.clone(),
            secrets: backend.clone(),
            lock: backend,
        }
    }
}

//! Applier trait and the types passed across it.
//!
//! An applier performs the external side effect for one node: a provisioning
//! call for plain nodes, a fingerprint-guarded build for build nodes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::resource::ResourceNode;
use crate::value::{Outputs, Value};
use crate::{Result, RunId};

/// A node whose references have all been replaced by producer outputs.
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub node: ResourceNode,
    pub inputs: BTreeMap<String, Value>,
}

impl ResolvedNode {
    pub fn id(&self) -> &str {
        &self.node.id
    }

    /// A resolved input rendered as a string, if present and not a reference.
    pub fn input_string(&self, name: &str) -> Option<String> {
        self.inputs
            .get(name)
            .and_then(Value::scalar)
            .map(ToString::to_string)
    }
}

/// Per-call context handed to an applier.
#[derive(Debug, Clone)]
pub struct ApplyContext {
    pub run_id: RunId,
    /// Cancelled when the run is cancelled. Appliers observe it at
    /// external-call boundaries.
    pub cancel: CancellationToken,
}

impl ApplyContext {
    pub fn new(run_id: RunId, cancel: CancellationToken) -> Self {
        Self { run_id, cancel }
    }
}

/// Which trigger key a build node used, for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerAudit {
    /// Fingerprint of the source tree at apply time.
    pub fingerprint: String,
    /// Key compared against the stored record (fingerprint or forced sentinel).
    pub key: String,
    /// Whether the build action actually ran.
    pub executed: bool,
}

/// Result of applying a node.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub outputs: Outputs,
    pub trigger: Option<TriggerAudit>,
}

impl ApplyOutcome {
    pub fn new(outputs: Outputs) -> Self {
        Self {
            outputs,
            trigger: None,
        }
    }
}

/// Trait for node appliers.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Name of this applier.
    fn name(&self) -> &'static str;

    /// Apply a resolved node and return its outputs.
    async fn apply(&self, node: &ResolvedNode, ctx: &ApplyContext) -> Result<ApplyOutcome>;
}

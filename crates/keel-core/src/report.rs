//! Run report types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::RunId;
use crate::applier::TriggerAudit;
use crate::resource::NodeKind;

/// Why a node was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// One or more dependencies failed or were skipped.
    BlockedBy { nodes: Vec<String> },
    /// The run was cancelled before the node was dispatched.
    Cancelled,
}

/// Terminal status of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeStatus {
    Applied,
    Failed { error: String },
    Skipped { skip: SkipReason },
}

impl NodeStatus {
    pub fn is_applied(&self) -> bool {
        matches!(self, NodeStatus::Applied)
    }
}

/// A publish path that could not be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishFailure {
    pub path: String,
    pub cause: String,
}

/// Report entry for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: String,
    pub kind: NodeKind,
    #[serde(flatten)]
    pub status: NodeStatus,
    /// Outputs with secrets redacted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerAudit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_publishes: Vec<PublishFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeReport {
    pub fn new(id: impl Into<String>, kind: NodeKind, status: NodeStatus) -> Self {
        Self {
            id: id.into(),
            kind,
            status,
            outputs: BTreeMap::new(),
            trigger: None,
            failed_publishes: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    AllApplied,
    PartiallyApplied,
    Failed,
}

/// Structured report emitted at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub cancelled: bool,
    /// Every node of the graph, in execution order.
    pub nodes: Vec<NodeReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Derive the overall status from node entries.
    ///
    /// All applied with no publish failures is `AllApplied`; nothing applied
    /// while something failed or was skipped is `Failed`; anything else is
    /// `PartiallyApplied`.
    pub fn status_of(nodes: &[NodeReport]) -> RunStatus {
        let applied = nodes.iter().filter(|n| n.status.is_applied()).count();
        let publish_failures = nodes.iter().any(|n| !n.failed_publishes.is_empty());

        if applied == nodes.len() && !publish_failures {
            RunStatus::AllApplied
        } else if applied == 0 {
            RunStatus::Failed
        } else {
            RunStatus::PartiallyApplied
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

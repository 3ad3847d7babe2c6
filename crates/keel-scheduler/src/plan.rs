//! Dry-run planning.

use keel_core::store::TriggerStore;
use keel_core::{NodeKind, Result};
use keel_executor::fingerprint::{ExcludeSet, fingerprint_async};
use keel_executor::trigger::TriggerRunner;
use serde::Serialize;
use std::sync::Arc;

use crate::graph::Graph;

/// What applying a node would do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanAction {
    /// Plain node: the provisioning call always runs.
    Apply,
    /// Build node whose tree changed, has no record, or is forced.
    Rebuild { fingerprint: String, forced: bool },
    /// Build node whose fingerprint matches the stored key.
    UpToDate { fingerprint: String },
    /// The fingerprint could not be computed.
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedNode {
    pub id: String,
    pub kind: NodeKind,
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub action: PlanAction,
}

/// Nodes in execution order with the action each would take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub nodes: Vec<PlannedNode>,
}

impl Plan {
    pub fn rebuilds(&self) -> impl Iterator<Item = &PlannedNode> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.action, PlanAction::Rebuild { .. }))
    }
}

/// Compute what a run of `graph` would do, without applying anything.
///
/// Trigger-store failures are returned as errors; per-node fingerprint
/// failures are reported in the plan.
pub async fn plan(graph: &Graph, triggers: Arc<dyn TriggerStore>) -> Result<Plan> {
    let runner = TriggerRunner::new(triggers);
    let mut nodes = Vec::with_capacity(graph.len());

    for node in graph.nodes() {
        let action = match (node.kind, &node.build) {
            (NodeKind::BuildTriggered, Some(spec)) => {
                let fingerprint = match ExcludeSet::new(&spec.exclude) {
                    Ok(excludes) => fingerprint_async(spec.context.clone(), excludes).await,
                    Err(e) => Err(e),
                };
                match fingerprint {
                    Ok(fp) => {
                        let fingerprint = fp.into_string();
                        if spec.forced || runner.would_run(&node.id, &fingerprint).await? {
                            PlanAction::Rebuild {
                                fingerprint,
                                forced: spec.forced,
                            }
                        } else {
                            PlanAction::UpToDate { fingerprint }
                        }
                    }
                    Err(e) => PlanAction::Error {
                        message: e.to_string(),
                    },
                }
            }
            _ => PlanAction::Apply,
        };

        nodes.push(PlannedNode {
            id: node.id.clone(),
            kind: node.kind,
            depends_on: graph
                .dependencies(&node.id)
                .map(|d| d.iter().cloned().collect())
                .unwrap_or_default(),
            action,
        });
    }

    Ok(Plan { nodes })
}

//! Run orchestrator - applies graph nodes in dependency order.

use chrono::{DateTime, Utc};
use keel_core::applier::{Applier, ApplyContext, ApplyOutcome, ResolvedNode};
use keel_core::report::{NodeReport, NodeStatus, RunReport, RunStatus, SkipReason};
use keel_core::store::Stores;
use keel_core::value::redact_outputs;
use keel_core::{Error, Outputs, ResourceNode, Result, RunId, Value};
use keel_store::publish_node;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::graph::Graph;

/// Event emitted while a run proceeds.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunStarted { run_id: RunId, nodes: usize },
    NodeStarted { id: String },
    NodeApplied { id: String, executed: Option<bool> },
    NodeFailed { id: String, error: String },
    NodeSkipped { id: String, reason: SkipReason },
    RunCompleted { status: RunStatus },
}

/// What a worker task hands back to the coordinator.
enum TaskOutcome {
    /// Cancelled while waiting for a concurrency slot.
    NotStarted,
    Finished {
        started_at: DateTime<Utc>,
        result: Result<ApplyOutcome>,
    },
}

/// Replace every reference input of `node` with the producer's output.
///
/// A producer with no recorded outputs means the scheduler dispatched a node
/// too early, which is an internal error. A producer that applied but lacks
/// the named output fails the consumer.
pub fn resolve_inputs(node: &ResourceNode, outputs: &HashMap<String, Outputs>) -> Result<BTreeMap<String, Value>> {
    node.inputs
        .iter()
        .map(|(name, value)| {
            let Value::Reference(r) = value else {
                return Ok((name.clone(), value.clone()));
            };
            let produced = outputs.get(&r.node).ok_or_else(|| {
                Error::InternalInvariantViolation(format!(
                    "'{}' was dispatched before its producer '{}' recorded outputs",
                    node.id, r.node
                ))
            })?;
            let resolved = produced.get(&r.output).ok_or_else(|| {
                Error::node_apply_failed(
                    &node.id,
                    Error::InvalidInput(format!("input '{name}': '{}' produced no output '{}'", r.node, r.output)),
                )
            })?;
            Ok((name.clone(), resolved.clone()))
        })
        .collect()
}

/// Coordinator state for one run. Only the coordinating task touches it.
struct RunState {
    outputs: HashMap<String, Outputs>,
    reports: HashMap<String, NodeReport>,
    /// Unfinished dependency count per node.
    waiting: HashMap<String, usize>,
    /// Failed or blocked dependencies per blocked node.
    blocked: BTreeMap<String, BTreeSet<String>>,
    /// Ready to dispatch, keyed by execution position.
    ready: BTreeMap<usize, String>,
}

impl RunState {
    fn new(graph: &Graph) -> Self {
        let waiting: HashMap<String, usize> = graph
            .nodes()
            .iter()
            .map(|n| (n.id.clone(), graph.dependencies(&n.id).map_or(0, BTreeSet::len)))
            .collect();
        let ready = graph
            .nodes()
            .iter()
            .enumerate()
            .filter(|(_, n)| waiting.get(&n.id) == Some(&0))
            .map(|(i, n)| (i, n.id.clone()))
            .collect();
        Self {
            outputs: HashMap::new(),
            reports: HashMap::new(),
            waiting,
            blocked: BTreeMap::new(),
            ready,
        }
    }

    /// A node succeeded: release dependents whose dependencies are all done.
    fn release(&mut self, graph: &Graph, id: &str) {
        for dependent in graph.dependents(id) {
            if let Some(count) = self.waiting.get_mut(dependent) {
                *count -= 1;
                if *count == 0 && !self.blocked.contains_key(dependent) {
                    if let Some(pos) = graph.position(dependent) {
                        self.ready.insert(pos, dependent.clone());
                    }
                }
            }
        }
    }

    /// A node failed: block every transitive dependent.
    fn block(&mut self, graph: &Graph, id: &str) {
        let mut frontier = vec![id.to_string()];
        while let Some(failed) = frontier.pop() {
            for dependent in graph.dependents(&failed) {
                let by = self.blocked.entry(dependent.clone()).or_default();
                let newly_blocked = by.is_empty();
                by.insert(failed.clone());
                if newly_blocked {
                    if let Some(pos) = graph.position(dependent) {
                        self.ready.remove(&pos);
                    }
                    frontier.push(dependent.clone());
                }
            }
        }
    }
}

/// Applies a graph against a set of stores.
#[derive(Clone)]
pub struct Orchestrator {
    applier: Arc<dyn Applier>,
    stores: Stores,
    concurrency: usize,
}

impl Orchestrator {
    pub fn new(applier: Arc<dyn Applier>, stores: Stores) -> Self {
        Self {
            applier,
            stores,
            concurrency: 4,
        }
    }

    /// Maximum number of nodes applied at once. Zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Run `graph` in the background, returning a channel of events and a
    /// handle to the final report.
    pub fn execute(
        &self,
        graph: Graph,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<RunEvent>, tokio::task::JoinHandle<Result<RunReport>>) {
        let (tx, rx) = mpsc::channel(100);
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(&graph, cancel, Some(tx)).await });
        (rx, handle)
    }

    /// Apply every node of `graph`.
    ///
    /// Per-node failures are recorded in the report; the returned error is
    /// reserved for run-level problems (lock held, internal invariant
    /// violations). Every node gets a terminal status, including on
    /// cancellation.
    pub async fn run(
        &self,
        graph: &Graph,
        cancel: CancellationToken,
        events: Option<mpsc::Sender<RunEvent>>,
    ) -> Result<RunReport> {
        let run_id = RunId::new();
        let _guard = self.stores.lock.acquire(run_id).await?;
        let started_at = Utc::now();
        let emit = |event: RunEvent| {
            let events = events.clone();
            async move {
                if let Some(tx) = events {
                    let _ = tx.send(event).await;
                }
            }
        };

        info!(run_id = %run_id, nodes = graph.len(), concurrency = self.concurrency, "Run started");
        emit(RunEvent::RunStarted {
            run_id,
            nodes: graph.len(),
        })
        .await;

        let mut state = RunState::new(graph);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<(String, TaskOutcome)> = JoinSet::new();

        loop {
            while !cancel.is_cancelled() {
                let Some((_, id)) = state.ready.pop_first() else {
                    break;
                };
                let Some(node) = graph.node(&id) else {
                    return Err(Error::InternalInvariantViolation(format!("ready node '{id}' not in graph")));
                };

                let inputs = match resolve_inputs(node, &state.outputs) {
                    Ok(inputs) => inputs,
                    Err(e @ Error::InternalInvariantViolation(_)) => {
                        error!(node_id = %id, error = %e, "Aborting run");
                        return Err(e);
                    }
                    Err(e) => {
                        self.record_failure(graph, &mut state, &id, None, e, false, &emit)
                            .await;
                        continue;
                    }
                };

                let resolved = ResolvedNode {
                    node: node.clone(),
                    inputs,
                };
                let ctx = ApplyContext::new(run_id, cancel.clone());
                let applier = self.applier.clone();
                let semaphore = semaphore.clone();
                let events = events.clone();

                tasks.spawn(async move {
                    let permit = tokio::select! {
                        permit = semaphore.acquire_owned() => permit,
                        _ = ctx.cancel.cancelled() => return (resolved.node.id, TaskOutcome::NotStarted),
                    };
                    let Ok(_permit) = permit else {
                        return (resolved.node.id, TaskOutcome::NotStarted);
                    };

                    if let Some(tx) = &events {
                        let _ = tx
                            .send(RunEvent::NodeStarted {
                                id: resolved.node.id.clone(),
                            })
                            .await;
                    }
                    info!(node_id = %resolved.node.id, kind = ?resolved.node.kind, "Applying node");
                    let started_at = Utc::now();
                    let result = applier.apply(&resolved, &ctx).await;
                    (resolved.node.id, TaskOutcome::Finished { started_at, result })
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (id, outcome) = joined.map_err(|e| Error::InternalInvariantViolation(format!("apply task failed: {e}")))?;

            match outcome {
                TaskOutcome::NotStarted => {}
                TaskOutcome::Finished {
                    started_at,
                    result: Ok(outcome),
                } => {
                    self.record_success(graph, &mut state, &id, started_at, outcome, &emit)
                        .await?;
                }
                TaskOutcome::Finished {
                    started_at,
                    result: Err(e),
                } => {
                    let cancelled = cancel.is_cancelled();
                    self.record_failure(graph, &mut state, &id, Some(started_at), e, cancelled, &emit)
                        .await;
                }
            }
        }

        // Anything without a report was never dispatched.
        let cancelled = cancel.is_cancelled();
        let mut nodes = Vec::with_capacity(graph.len());
        for node in graph.nodes() {
            let report = match state.reports.remove(&node.id) {
                Some(report) => report,
                None => {
                    let reason = match state.blocked.get(&node.id) {
                        Some(by) => SkipReason::BlockedBy {
                            nodes: by.iter().cloned().collect(),
                        },
                        None if cancelled => SkipReason::Cancelled,
                        None => {
                            return Err(Error::InternalInvariantViolation(format!(
                                "node '{}' was never dispatched",
                                node.id
                            )));
                        }
                    };
                    info!(node_id = %node.id, reason = ?reason, "Node skipped");
                    emit(RunEvent::NodeSkipped {
                        id: node.id.clone(),
                        reason: reason.clone(),
                    })
                    .await;
                    NodeReport::new(&node.id, node.kind, NodeStatus::Skipped { skip: reason })
                }
            };
            nodes.push(report);
        }

        let status = RunReport::status_of(&nodes);
        info!(run_id = %run_id, status = ?status, cancelled, "Run completed");
        emit(RunEvent::RunCompleted { status }).await;

        Ok(RunReport {
            run_id,
            status,
            cancelled,
            nodes,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn record_success<F, Fut>(
        &self,
        graph: &Graph,
        state: &mut RunState,
        id: &str,
        started_at: DateTime<Utc>,
        outcome: ApplyOutcome,
        emit: &F,
    ) -> Result<()>
    where
        F: Fn(RunEvent) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let node = graph
            .node(id)
            .ok_or_else(|| Error::InternalInvariantViolation(format!("finished node '{id}' not in graph")))?;

        let published = publish_node(
            self.stores.parameters.as_ref(),
            self.stores.secrets.as_ref(),
            node,
            &outcome.outputs,
        )
        .await;

        let mut report = NodeReport::new(id, node.kind, NodeStatus::Applied);
        report.outputs = redact_outputs(&outcome.outputs);
        report.failed_publishes = published.failed;
        report.started_at = Some(started_at);
        report.finished_at = Some(Utc::now());
        let executed = outcome.trigger.as_ref().map(|t| t.executed);
        report.trigger = outcome.trigger;

        if !report.failed_publishes.is_empty() {
            warn!(node_id = %id, failed = report.failed_publishes.len(), "Some outputs were not published");
        }
        info!(node_id = %id, ?executed, "Node applied");

        state.outputs.insert(id.to_string(), outcome.outputs);
        state.reports.insert(id.to_string(), report);
        state.release(graph, id);
        emit(RunEvent::NodeApplied {
            id: id.to_string(),
            executed,
        })
        .await;
        Ok(())
    }

    async fn record_failure<F, Fut>(
        &self,
        graph: &Graph,
        state: &mut RunState,
        id: &str,
        started_at: Option<DateTime<Utc>>,
        err: Error,
        cancelled: bool,
        emit: &F,
    ) where
        F: Fn(RunEvent) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let err = Error::node_apply_failed(id, err);
        error!(node_id = %id, error = %err, "Node failed");

        let kind = graph.node(id).map_or(keel_core::NodeKind::Plain, |n| n.kind);
        let mut report = NodeReport::new(
            id,
            kind,
            NodeStatus::Failed {
                error: err.to_string(),
            },
        );
        report.started_at = started_at;
        report.finished_at = Some(Utc::now());
        report.trigger = err.trigger().cloned();
        state.reports.insert(id.to_string(), report);

        // Dependents of a node interrupted by cancellation are reported as
        // cancelled rather than blocked.
        let interrupted = cancelled && err.is_cancelled();
        if !interrupted {
            state.block(graph, id);
        }

        emit(RunEvent::NodeFailed {
            id: id.to_string(),
            error: err.to_string(),
        })
        .await;
    }
}

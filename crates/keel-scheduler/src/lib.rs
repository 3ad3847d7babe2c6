//! Dependency graph and run orchestration for Keel.
//!
//! Builds the node graph, applies nodes in dependency order with bounded
//! concurrency, resolves typed references between them, and publishes
//! outputs as each node completes.

pub mod graph;
pub mod orchestrator;
pub mod plan;

pub use graph::Graph;
pub use orchestrator::{Orchestrator, RunEvent, resolve_inputs};
pub use plan::{Plan, PlanAction, PlannedNode, plan};

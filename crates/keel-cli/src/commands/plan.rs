//! `keel plan`: dry run.

use anyhow::{Context, Result};
use keel_scheduler::{PlanAction, plan};
use keel_store::FileStore;
use std::path::Path;
use std::sync::Arc;

use super::LoadedStack;

pub async fn run(path: &Path, force: &[String], json: bool) -> Result<()> {
    let loaded = LoadedStack::load(path, force)?;
    let graph = loaded.graph()?;

    let store = FileStore::open(&loaded.settings.state_dir)
        .await
        .with_context(|| format!("Failed to open state directory: {}", loaded.settings.state_dir.display()))?;
    let plan = plan(&graph, Arc::new(store)).await.context("Failed to compute plan")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Plan for stack: {}", loaded.stack.name);
    for (i, node) in plan.nodes.iter().enumerate() {
        let action = match &node.action {
            PlanAction::Apply => "apply".to_string(),
            PlanAction::Rebuild { fingerprint, forced: true } => format!("rebuild (forced), fingerprint {fingerprint}"),
            PlanAction::Rebuild { fingerprint, .. } => format!("rebuild, fingerprint {fingerprint}"),
            PlanAction::UpToDate { fingerprint } => format!("up to date, fingerprint {fingerprint}"),
            PlanAction::Error { message } => format!("cannot fingerprint: {message}"),
        };
        let deps = if node.depends_on.is_empty() {
            String::new()
        } else {
            format!(" (after {})", node.depends_on.join(", "))
        };
        println!("  {:>2}. {}{} - {}", i + 1, node.id, deps, action);
    }
    println!("\n{} image(s) would be rebuilt", plan.rebuilds().count());
    Ok(())
}

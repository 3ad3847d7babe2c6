//! `keel apply`: run a stack against the durable stores.

use anyhow::{Context, Result, bail};
use keel_core::report::{NodeStatus, RunReport, RunStatus, SkipReason};
use keel_core::store::Stores;
use keel_executor::{ApplyTimeouts, CommandProvisioner, ContainerTool, DefaultApplier, RegistryLogin};
use keel_scheduler::{Orchestrator, RunEvent};
use keel_store::FileStore;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::LoadedStack;

pub async fn run(path: &Path, force: &[String], concurrency: Option<usize>, report_path: Option<&Path>) -> Result<()> {
    let loaded = LoadedStack::load(path, force)?;
    let graph = loaded.graph()?;
    let settings = &loaded.settings;

    println!("Applying stack: {}", loaded.stack.name);
    println!("Nodes: {}", graph.len());

    let store = FileStore::open(&settings.state_dir)
        .await
        .with_context(|| format!("Failed to open state directory: {}", settings.state_dir.display()))?;
    let stores = Stores::from_backend(Arc::new(store));

    let login = settings
        .registry
        .as_ref()
        .map(|c| RegistryLogin::new(&c.username, &c.password));
    let builder = ContainerTool::new(&settings.container_tool).with_login(login);
    let applier = DefaultApplier::new(stores.triggers.clone(), Arc::new(builder))
        .with_provisioner(CommandProvisioner::new().with_working_dir(&loaded.base_dir))
        .with_timeouts(ApplyTimeouts {
            scan: settings.scan_timeout,
            action: settings.action_timeout,
            call: settings.call_timeout,
        });

    let orchestrator = Orchestrator::new(Arc::new(applier), stores)
        .with_concurrency(concurrency.unwrap_or(settings.concurrency));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    println!("\n--- Starting run ---\n");
    let (mut rx, handle) = orchestrator.execute(graph, cancel);

    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::RunStarted { run_id, .. } => println!("Run {run_id}"),
            RunEvent::NodeStarted { id } => println!("▶ '{id}' started"),
            RunEvent::NodeApplied { id, executed } => match executed {
                Some(false) => println!("✓ '{id}' unchanged, build skipped"),
                _ => println!("✓ '{id}' applied"),
            },
            RunEvent::NodeFailed { id, error } => println!("✗ '{id}' failed: {error}"),
            RunEvent::NodeSkipped { id, reason } => println!("⊘ '{id}' skipped: {}", describe_skip(&reason)),
            RunEvent::RunCompleted { status } => println!("\n--- Run finished: {} ---", describe_status(status)),
        }
    }

    let report = handle
        .await
        .context("Run task failed")?
        .context("Run aborted")?;

    print_summary(&report);

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write report: {}", path.display()))?;
        println!("\nReport written to {}", path.display());
    }

    match report.status {
        RunStatus::AllApplied => Ok(()),
        status => bail!("Run finished with status: {}", describe_status(status)),
    }
}

fn describe_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::AllApplied => "all applied",
        RunStatus::PartiallyApplied => "partially applied",
        RunStatus::Failed => "failed",
    }
}

fn describe_skip(reason: &SkipReason) -> String {
    match reason {
        SkipReason::BlockedBy { nodes } => format!("blocked by {}", nodes.join(", ")),
        SkipReason::Cancelled => "cancelled".to_string(),
    }
}

fn print_summary(report: &RunReport) {
    println!("\n--- Node Summary ---");
    for node in &report.nodes {
        let status = match &node.status {
            NodeStatus::Applied => "✓ applied".to_string(),
            NodeStatus::Failed { error } => format!("✗ failed: {error}"),
            NodeStatus::Skipped { skip } => format!("⊘ skipped: {}", describe_skip(skip)),
        };
        println!("  {} - {}", node.id, status);

        if let Some(trigger) = &node.trigger {
            println!(
                "      fingerprint {} key {} ({})",
                trigger.fingerprint,
                trigger.key,
                if trigger.executed { "built" } else { "unchanged" }
            );
        }
        // Secret outputs are already redacted in the report.
        for (name, value) in &node.outputs {
            println!("      {name} = {value}");
        }
        for failure in &node.failed_publishes {
            println!("      ✗ publish {}: {}", failure.path, failure.cause);
        }
    }
}

//! CLI command implementations.

pub mod apply;
pub mod fingerprint;
pub mod plan;
pub mod stores;

use anyhow::{Context, Result, bail};
use keel_config::{Settings, StackDefinition, load_stack};
use keel_core::NodeKind;
use keel_scheduler::Graph;
use std::path::{Path, PathBuf};

/// A stack file with settings resolved and forced nodes marked.
pub struct LoadedStack {
    pub stack: StackDefinition,
    pub settings: Settings,
    /// Directory of the stack file; relative paths resolve against it.
    pub base_dir: PathBuf,
}

impl LoadedStack {
    pub fn load(path: &Path, force: &[String]) -> Result<Self> {
        let mut stack =
            load_stack(path).with_context(|| format!("Failed to load stack file: {}", path.display()))?;

        let mut settings = stack.settings.clone();
        settings
            .apply_process_env()
            .context("Invalid KEEL_* environment override")?;

        let base_dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if settings.state_dir.is_relative() {
            settings.state_dir = base_dir.join(&settings.state_dir);
        }

        mark_forced(&mut stack, force)?;
        Ok(Self {
            stack,
            settings,
            base_dir,
        })
    }

    pub fn graph(&self) -> Result<Graph> {
        Graph::build(self.stack.nodes.clone()).context("Invalid dependency graph")
    }
}

/// Set the forced flag on the named build nodes.
fn mark_forced(stack: &mut StackDefinition, force: &[String]) -> Result<()> {
    for id in force {
        let Some(node) = stack.nodes.iter_mut().find(|n| &n.id == id) else {
            bail!("--force names unknown node '{id}'");
        };
        match (node.kind, node.build.as_mut()) {
            (NodeKind::BuildTriggered, Some(build)) => build.forced = true,
            _ => bail!("--force names '{id}', which is not an image node"),
        }
    }
    Ok(())
}

pub fn validate(path: &Path) -> Result<()> {
    let loaded = LoadedStack::load(path, &[])?;
    let graph = loaded.graph()?;
    println!(
        "Stack '{}' is valid: {} nodes",
        loaded.stack.name,
        graph.len()
    );
    for (i, node) in graph.nodes().iter().enumerate() {
        println!("  {:>2}. {}", i + 1, node.id);
    }
    Ok(())
}

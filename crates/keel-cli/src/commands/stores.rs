//! `keel params` / `keel secrets`: read published entries.

use anyhow::{Context, Result};
use keel_core::store::{ParameterStore, SecretStore};
use keel_store::FileStore;
use std::path::Path;

async fn open(state_dir: &Path) -> Result<FileStore> {
    FileStore::open(state_dir)
        .await
        .with_context(|| format!("Failed to open state directory: {}", state_dir.display()))
}

pub async fn list_params(state_dir: &Path, prefix: &str) -> Result<()> {
    let store = open(state_dir).await?;
    for path in ParameterStore::list(&store, prefix).await? {
        println!("{path}");
    }
    Ok(())
}

pub async fn get_param(state_dir: &Path, path: &str) -> Result<()> {
    let store = open(state_dir).await?;
    let entry = ParameterStore::get(&store, path).await?;
    println!("{}", entry.value);
    println!("(published by '{}')", entry.producer_node_id);
    Ok(())
}

/// Names only; secret values are never printed.
pub async fn list_secrets(state_dir: &Path, prefix: &str) -> Result<()> {
    let store = open(state_dir).await?;
    for name in SecretStore::list(&store, prefix).await? {
        println!("{name}");
    }
    Ok(())
}

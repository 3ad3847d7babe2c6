//! `keel fingerprint`: print the content fingerprint of a directory.

use anyhow::{Context, Result};
use keel_executor::{DEFAULT_EXCLUDES, ExcludeSet, fingerprint_async};
use std::path::Path;

pub async fn run(dir: &Path, exclude: Vec<String>, no_default_excludes: bool) -> Result<()> {
    let mut globs: Vec<String> = if no_default_excludes {
        Vec::new()
    } else {
        DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect()
    };
    globs.extend(exclude);

    let excludes = ExcludeSet::new(&globs).context("Invalid exclude pattern")?;
    let fingerprint = fingerprint_async(dir.to_path_buf(), excludes)
        .await
        .with_context(|| format!("Failed to fingerprint {}", dir.display()))?;

    println!("{fingerprint}");
    Ok(())
}

//! Content fingerprinting of source trees.
//!
//! The fingerprint of a directory is a SHA-256 over every included regular
//! file, keyed by its path relative to the root. Entries are sorted before
//! aggregation, so the result does not depend on traversal order, and a
//! rename changes it even when contents are identical.
//!
//! The scan is not safe against concurrent modification of the tree.

use keel_core::{Error, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Exclusions callers usually want for source trees.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    ".venv",
    "venv",
    "__pycache__",
    "*.pyc",
    ".DS_Store",
];

/// Hex-encoded aggregate digest of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single compiled exclude pattern.
#[derive(Debug, Clone)]
struct Pattern {
    regex: Regex,
    /// Patterns without a `/` match any single path segment.
    segment: bool,
}

/// Compiled set of glob exclusions.
///
/// `*` and `?` never cross a `/`; `**` spans any number of segments. A
/// pattern without `/` is tested against each entry's own name, so
/// `__pycache__` excludes that directory at any depth. Other patterns are
/// matched against the whole relative path. An excluded directory takes its
/// subtree with it.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<Pattern>,
}

impl ExcludeSet {
    pub fn new<I, S>(globs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = globs
            .into_iter()
            .map(|g| compile_glob(g.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// `relative` uses `/` separators.
    pub fn is_excluded(&self, relative: &str) -> bool {
        let name = relative.rsplit('/').next().unwrap_or(relative);
        self.patterns.iter().any(|p| {
            if p.segment {
                p.regex.is_match(name)
            } else {
                p.regex.is_match(relative)
            }
        })
    }
}

fn compile_glob(glob: &str) -> Result<Pattern> {
    let trimmed = glob.trim_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidInput(format!("empty exclude pattern '{glob}'")));
    }

    let mut re = String::from("^");
    let mut chars = trimmed.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    re.push_str("(?:.*/)?");
                } else {
                    re.push_str(".*");
                }
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');

    let regex = Regex::new(&re)
        .map_err(|e| Error::InvalidInput(format!("invalid exclude pattern '{glob}': {e}")))?;
    Ok(Pattern {
        regex,
        segment: !trimmed.contains('/'),
    })
}

fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| Error::io(path, e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint `root`, skipping anything matched by `excludes`.
///
/// Only regular files contribute; symlinks are not followed.
pub fn fingerprint(root: &Path, excludes: &ExcludeSet) -> Result<Fingerprint> {
    let meta = std::fs::metadata(root).map_err(|e| Error::io(root, e))?;
    if !meta.is_dir() {
        return Err(Error::io(
            root,
            std::io::Error::new(std::io::ErrorKind::NotADirectory, "not a directory"),
        ));
    }

    let mut entries: Vec<(String, String)> = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !excludes.is_excluded(&relative_key(root, e.path())));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
            Error::io(path, source)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let key = relative_key(root, entry.path());
        let digest = hash_file(entry.path())?;
        entries.push((key, digest));
    }

    let files = entries.len();
    let fp = aggregate(entries);
    debug!(root = %root.display(), files, fingerprint = %fp, "Fingerprinted tree");
    Ok(fp)
}

/// Combine `(relative path, file digest)` pairs, in whatever order they
/// were enumerated, into one fingerprint.
fn aggregate(mut entries: Vec<(String, String)>) -> Fingerprint {
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (path, digest) in &entries {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Run [`fingerprint`] on a blocking worker thread.
pub async fn fingerprint_async(root: PathBuf, excludes: ExcludeSet) -> Result<Fingerprint> {
    tokio::task::spawn_blocking(move || fingerprint(&root, &excludes))
        .await
        .map_err(|e| Error::InternalInvariantViolation(format!("fingerprint task failed: {e}")))?
}

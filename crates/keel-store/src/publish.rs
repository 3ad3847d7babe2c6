//! Publishing node outputs to the parameter and secret stores.

use keel_core::report::PublishFailure;
use keel_core::store::{Entry, ParameterEntry, ParameterStore, SecretEntry, SecretStore};
use keel_core::{Error, Outputs, PublishTarget, ResourceNode};
use tracing::{debug, warn};

/// Result of one publish batch.
#[derive(Debug, Default)]
pub struct PublishReport {
    pub published: Vec<String>,
    pub failed: Vec<PublishFailure>,
}

impl PublishReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, path: impl Into<String>, err: &Error) {
        let cause = match err {
            Error::PublishFailed { cause, .. } => cause.clone(),
            other => other.to_string(),
        };
        self.failed.push(PublishFailure {
            path: path.into(),
            cause,
        });
    }
}

/// `/<domain>/<key>`: a leading slash and at least two non-empty segments.
pub fn is_valid_parameter_path(path: &str) -> bool {
    match path.strip_prefix('/') {
        Some(rest) => {
            let segments: Vec<&str> = rest.split('/').collect();
            segments.len() >= 2 && segments.iter().all(|s| !s.is_empty())
        }
        None => false,
    }
}

pub fn is_valid_secret_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(char::is_whitespace)
}

fn check_entry(entry: &Entry) -> keel_core::Result<()> {
    let (ok, expected) = match entry {
        Entry::Parameter(p) => (is_valid_parameter_path(&p.name), "/<domain>/<key>"),
        Entry::Secret(s) => (is_valid_secret_name(&s.name), "a non-empty name without whitespace"),
    };
    if ok {
        Ok(())
    } else {
        Err(Error::PublishFailed {
            path: entry.path().to_string(),
            cause: format!("path must be {expected}"),
        })
    }
}

/// Build the publish entries a node declares from its outputs.
///
/// Entries that cannot be built (missing output, sensitive value routed to
/// the parameter target) come back as failures instead.
pub fn entries_for(node: &ResourceNode, outputs: &Outputs) -> (Vec<Entry>, Vec<PublishFailure>) {
    let mut entries = Vec::new();
    let mut report = PublishReport::default();

    for spec in &node.publish {
        let Some(value) = outputs.get(&spec.output) else {
            report.failed.push(PublishFailure {
                path: spec.path.clone(),
                cause: format!("output '{}' was not produced by '{}'", spec.output, node.id),
            });
            continue;
        };

        let entry = match spec.target {
            PublishTarget::Parameter => {
                ParameterEntry::from_value(&spec.path, value, &node.id).map(Entry::Parameter)
            }
            PublishTarget::Secret => {
                SecretEntry::from_value(&spec.path, value, &node.id).map(Entry::Secret)
            }
        };
        match entry {
            Ok(entry) => entries.push(entry),
            Err(e) => report.fail(&spec.path, &e),
        }
    }

    (entries, report.failed)
}

/// Write every entry to its store. Each entry is attempted independently;
/// a failure is recorded and the rest continue. Last writer wins.
pub async fn publish(
    parameters: &dyn ParameterStore,
    secrets: &dyn SecretStore,
    entries: Vec<Entry>,
) -> PublishReport {
    let mut report = PublishReport::default();

    for entry in entries {
        let path = entry.path().to_string();
        if let Err(e) = check_entry(&entry) {
            warn!(path = %path, "Rejected publish path");
            report.fail(path, &e);
            continue;
        }

        let result = match entry {
            Entry::Parameter(p) => parameters.put(p).await,
            Entry::Secret(s) => secrets.put(s).await,
        };

        match result {
            Ok(()) => {
                debug!(path = %path, "Published");
                report.published.push(path);
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Publish failed");
                report.fail(path, &e);
            }
        }
    }

    report
}

/// Build and publish everything `node` declares.
pub async fn publish_node(
    parameters: &dyn ParameterStore,
    secrets: &dyn SecretStore,
    node: &ResourceNode,
    outputs: &Outputs,
) -> PublishReport {
    let (entries, rejected) = entries_for(node, outputs);
    let mut report = publish(parameters, secrets, entries).await;
    report.failed.splice(0..0, rejected);
    report
}

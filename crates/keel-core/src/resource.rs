//! Resource node declarations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::value::{OutputRef, Value};

/// Default target platform for container builds.
pub const DEFAULT_PLATFORM: &str = "linux/amd64";

/// What kind of work applying a node involves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Applied directly through a provisioning call.
    Plain,
    /// Guarded by a content fingerprint; runs an external build/push action.
    BuildTriggered,
}

/// Build settings for a `BuildTriggered` node.
///
/// The image repository is the node's `repository` input so that it can
/// reference the registry node's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Source tree to fingerprint and build.
    pub context: PathBuf,
    /// Glob patterns excluded from the fingerprint.
    pub exclude: Vec<String>,
    /// Target platform passed to the build tool.
    pub platform: String,
    /// Dockerfile path, relative to the context.
    pub dockerfile: Option<PathBuf>,
    /// Fixed image tag. Derived from the trigger key when absent.
    pub tag: Option<String>,
    /// Rebuild even when the fingerprint is unchanged.
    pub forced: bool,
}

impl BuildSpec {
    pub fn new(context: impl Into<PathBuf>) -> Self {
        Self {
            context: context.into(),
            exclude: Vec::new(),
            platform: DEFAULT_PLATFORM.to_string(),
            dockerfile: None,
            tag: None,
            forced: false,
        }
    }
}

/// Which store a published output goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishTarget {
    Parameter,
    Secret,
}

/// Declares that an output is published under a namespaced path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishSpec {
    pub target: PublishTarget,
    pub path: String,
    pub output: String,
}

/// The atomic provisioning unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Unique within a graph.
    pub id: String,
    pub kind: NodeKind,
    pub inputs: BTreeMap<String, Value>,
    /// Ordering-only dependencies with no data edge.
    pub explicit_deps: BTreeSet<String>,
    /// Present iff `kind` is `BuildTriggered`.
    pub build: Option<BuildSpec>,
    /// External provisioning command for plain nodes.
    pub command: Option<Vec<String>>,
    /// Output names to be treated as secrets when produced.
    pub sensitive_outputs: BTreeSet<String>,
    pub publish: Vec<PublishSpec>,
}

impl ResourceNode {
    /// A plain node with no inputs.
    pub fn plain(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Plain,
            inputs: BTreeMap::new(),
            explicit_deps: BTreeSet::new(),
            build: None,
            command: None,
            sensitive_outputs: BTreeSet::new(),
            publish: Vec::new(),
        }
    }

    /// A build-triggered node.
    pub fn build(id: impl Into<String>, spec: BuildSpec) -> Self {
        Self {
            kind: NodeKind::BuildTriggered,
            build: Some(spec),
            ..Self::plain(id)
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.explicit_deps.insert(id.into());
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_sensitive_output(mut self, name: impl Into<String>) -> Self {
        self.sensitive_outputs.insert(name.into());
        self
    }

    pub fn publish_parameter(mut self, path: impl Into<String>, output: impl Into<String>) -> Self {
        self.publish.push(PublishSpec {
            target: PublishTarget::Parameter,
            path: path.into(),
            output: output.into(),
        });
        self
    }

    pub fn publish_secret(mut self, name: impl Into<String>, output: impl Into<String>) -> Self {
        self.publish.push(PublishSpec {
            target: PublishTarget::Secret,
            path: name.into(),
            output: output.into(),
        });
        self
    }

    /// Every reference held by the node's inputs.
    pub fn references(&self) -> impl Iterator<Item = &OutputRef> {
        self.inputs.values().filter_map(Value::as_reference)
    }

    /// The node ids this node depends on: referenced producers plus
    /// explicit ordering dependencies.
    pub fn depends_on(&self) -> BTreeSet<String> {
        self.references()
            .map(|r| r.node.clone())
            .chain(self.explicit_deps.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depends_on_is_derived_from_references() {
        let node = ResourceNode::plain("runtime")
            .with_input("image_uri", Value::reference("image", "uri"))
            .with_input("role", Value::reference("auth", "role_arn"))
            .with_input("replicas", Value::literal(2i64))
            .with_input("token", Value::secret("t"));

        let deps: Vec<_> = node.depends_on().into_iter().collect();
        assert_eq!(deps, vec!["auth", "image"]);
    }

    #[test]
    fn test_explicit_dependency_added() {
        let node = ResourceNode::plain("secrets").with_dependency("auth");
        assert!(node.depends_on().contains("auth"));
    }

    #[test]
    fn test_build_node_defaults() {
        let node = ResourceNode::build("image", BuildSpec::new("./src"));
        assert_eq!(node.kind, NodeKind::BuildTriggered);
        let spec = node.build.unwrap();
        assert_eq!(spec.platform, DEFAULT_PLATFORM);
        assert!(!spec.forced);
    }
}

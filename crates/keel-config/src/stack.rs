//! Stack definition parsing.
//!
//! A stack file declares resource nodes:
//!
//! ```kdl
//! stack "cx-agent"
//!
//! resource "registry" {
//!     input "name" "cx-agent"
//! }
//!
//! image "agent-image" {
//!     context "./src"
//!     exclude "**/__pycache__" ".venv"
//!     repository ref="registry.name"
//! }
//!
//! resource "runtime" depends-on="auth" {
//!     input "image_uri" ref="agent-image.uri"
//!     input "api_key" secret-env="GATEWAY_API_KEY"
//!     command "./scripts/runtime.sh"
//!     publish "/amazon/runtime_arn" from="arn"
//! }
//! ```

use keel_core::resource::{BuildSpec, PublishSpec, PublishTarget, ResourceNode};
use keel_core::value::{OutputRef, Scalar, Value};
use kdl::{KdlDocument, KdlNode, KdlValue};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::kdl_ext::{all_string_args, first_arg, first_string_arg, flag, string_list_prop, string_prop};
use crate::settings::Settings;
use crate::{ConfigError, ConfigResult};

/// A parsed stack file.
#[derive(Debug, Clone)]
pub struct StackDefinition {
    pub name: String,
    pub settings: Settings,
    /// Nodes in declaration order.
    pub nodes: Vec<ResourceNode>,
}

/// Read a stack file, resolving build contexts relative to its directory.
pub fn load_stack(path: &Path) -> ConfigResult<StackDefinition> {
    let content = std::fs::read_to_string(path)?;
    let mut stack = parse_stack(&content)?;

    let base = path.parent().unwrap_or(Path::new("."));
    for build in stack.nodes.iter_mut().filter_map(|n| n.build.as_mut()) {
        if build.context.is_relative() {
            build.context = base.join(&build.context);
        }
    }
    Ok(stack)
}

/// Parse a stack definition, reading `secret-env` values from the process environment.
pub fn parse_stack(kdl: &str) -> ConfigResult<StackDefinition> {
    parse_stack_with(kdl, |key| std::env::var(key).ok())
}

/// Parse a stack definition with an explicit environment lookup.
pub fn parse_stack_with<F>(kdl: &str, env: F) -> ConfigResult<StackDefinition>
where
    F: Fn(&str) -> Option<String>,
{
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut settings = Settings::default();
    let mut nodes = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "stack" => {
                name = first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("stack name".to_string()))?;
            }
            "settings" => settings.apply_kdl(node)?,
            "resource" => nodes.push(parse_resource(node, &env)?),
            "image" => nodes.push(parse_image(node, &env)?),
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("stack name".to_string()));
    }

    validate(&nodes)?;

    Ok(StackDefinition {
        name,
        settings,
        nodes,
    })
}

fn parse_resource<F>(node: &KdlNode, env: &F) -> ConfigResult<ResourceNode>
where
    F: Fn(&str) -> Option<String>,
{
    let id = node_id(node, "resource")?;
    let mut resource = ResourceNode::plain(&id);
    parse_common(&mut resource, node, env)?;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "command" {
                let command = all_string_args(child);
                if command.is_empty() {
                    return Err(ConfigError::MissingField(format!("command for '{id}'")));
                }
                resource.command = Some(command);
            }
        }
    }

    Ok(resource)
}

fn parse_image<F>(node: &KdlNode, env: &F) -> ConfigResult<ResourceNode>
where
    F: Fn(&str) -> Option<String>,
{
    let id = node_id(node, "image")?;
    let mut context = None;
    let mut spec = BuildSpec::new(PathBuf::new());

    let mut resource = ResourceNode::build(&id, BuildSpec::new(PathBuf::new()));
    parse_common(&mut resource, node, env)?;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "context" => context = first_string_arg(child).map(PathBuf::from),
                "exclude" => spec.exclude.extend(all_string_args(child)),
                "platform" => {
                    spec.platform = first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField(format!("platform for '{id}'")))?;
                }
                "dockerfile" => spec.dockerfile = first_string_arg(child).map(PathBuf::from),
                "tag" => spec.tag = first_string_arg(child),
                "forced" => spec.forced = flag(child)?,
                "repository" => {
                    if resource.inputs.contains_key("repository") {
                        return Err(ConfigError::Duplicate(format!("input 'repository' in '{id}'")));
                    }
                    let value = parse_value(child, &id, env)?;
                    resource.inputs.insert("repository".to_string(), value);
                }
                _ => {}
            }
        }
    }

    spec.context = context.ok_or_else(|| ConfigError::MissingField(format!("context for image '{id}'")))?;
    if !resource.inputs.contains_key("repository") {
        return Err(ConfigError::MissingField(format!("repository for image '{id}'")));
    }
    resource.build = Some(spec);

    Ok(resource)
}

/// Children shared by every node type: inputs, dependencies, publishing.
fn parse_common<F>(resource: &mut ResourceNode, node: &KdlNode, env: &F) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    let id = resource.id.clone();
    resource.explicit_deps.extend(string_list_prop(node, "depends-on"));

    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        match child.name().value() {
            "input" => {
                let name = first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField(format!("input name in '{id}'")))?;
                if resource.inputs.contains_key(&name) {
                    return Err(ConfigError::Duplicate(format!("input '{name}' in '{id}'")));
                }
                let value = parse_input_value(child, &id, &name, env)?;
                resource.inputs.insert(name, value);
            }
            "sensitive" => resource.sensitive_outputs.extend(all_string_args(child)),
            "publish" | "secret" => {
                let target = if child.name().value() == "publish" {
                    PublishTarget::Parameter
                } else {
                    PublishTarget::Secret
                };
                let path = first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField(format!("publish path in '{id}'")))?;
                let output = string_prop(child, "from").ok_or_else(|| {
                    ConfigError::MissingField(format!("from= for publish '{path}' in '{id}'"))
                })?;
                if target == PublishTarget::Parameter {
                    check_parameter_path(&path)?;
                }
                resource.publish.push(PublishSpec {
                    target,
                    path,
                    output,
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// `input "name" <literal>` or `input "name" ref=|secret=|secret-env=`.
fn parse_input_value<F>(node: &KdlNode, id: &str, name: &str, env: &F) -> ConfigResult<Value>
where
    F: Fn(&str) -> Option<String>,
{
    let positional: Vec<&KdlValue> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
        .collect();

    if let Some(literal) = positional.get(1) {
        return Ok(Value::Literal(scalar(literal, &format!("{id}.{name}"))?));
    }

    let field = format!("input '{name}' in '{id}'");
    value_from_props(node, &field, env)?.ok_or(ConfigError::MissingField(field))
}

/// `repository "literal"` or `repository ref="registry.url"`.
fn parse_value<F>(node: &KdlNode, id: &str, env: &F) -> ConfigResult<Value>
where
    F: Fn(&str) -> Option<String>,
{
    let field = format!("{} in '{id}'", node.name().value());
    if let Some(literal) = first_arg(node) {
        return Ok(Value::Literal(scalar(literal, &field)?));
    }
    value_from_props(node, &field, env)?.ok_or(ConfigError::MissingField(field))
}

fn value_from_props<F>(node: &KdlNode, field: &str, env: &F) -> ConfigResult<Option<Value>>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(reference) = string_prop(node, "ref") {
        let r: OutputRef = reference.parse().map_err(|_| {
            ConfigError::InvalidReference(format!("{field}: '{reference}' is not node.output"))
        })?;
        return Ok(Some(Value::Reference(r)));
    }
    if let Some(secret) = node.get("secret") {
        return Ok(Some(Value::Secret(scalar(secret, field)?)));
    }
    if let Some(var) = string_prop(node, "secret-env") {
        let value = env(&var).ok_or(ConfigError::MissingEnv(var))?;
        return Ok(Some(Value::secret(value)));
    }
    Ok(None)
}

fn scalar(value: &KdlValue, field: &str) -> ConfigResult<Scalar> {
    if let Some(s) = value.as_string() {
        return Ok(Scalar::String(s.to_string()));
    }
    if let Some(b) = value.as_bool() {
        return Ok(Scalar::Bool(b));
    }
    if let Some(i) = value.as_integer() {
        return i64::try_from(i)
            .map(Scalar::Int)
            .map_err(|e| ConfigError::InvalidValue {
                field: field.to_string(),
                message: e.to_string(),
            });
    }
    if let Some(f) = value.as_float() {
        return Ok(Scalar::Float(f));
    }
    Err(ConfigError::InvalidValue {
        field: field.to_string(),
        message: "null is not a valid value".to_string(),
    })
}

fn node_id(node: &KdlNode, kind: &str) -> ConfigResult<String> {
    let id = first_string_arg(node).ok_or_else(|| ConfigError::MissingField(format!("{kind} id")))?;
    if id.is_empty() || id.contains('.') || id.contains(char::is_whitespace) {
        return Err(ConfigError::InvalidValue {
            field: format!("{kind} id"),
            message: format!("'{id}' must be non-empty without dots or whitespace"),
        });
    }
    Ok(id)
}

fn check_parameter_path(path: &str) -> ConfigResult<()> {
    let segments: Vec<&str> = path.strip_prefix('/').map(|p| p.split('/').collect()).unwrap_or_default();
    if segments.len() < 2 || segments.iter().any(|s| s.is_empty()) {
        return Err(ConfigError::InvalidValue {
            field: "publish path".to_string(),
            message: format!("'{path}' must look like /<domain>/<key>"),
        });
    }
    Ok(())
}

/// Check ids are unique and every reference or dependency names a declared node.
fn validate(nodes: &[ResourceNode]) -> ConfigResult<()> {
    let mut ids = HashSet::new();
    for node in nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(ConfigError::Duplicate(format!("node '{}'", node.id)));
        }
    }

    for node in nodes {
        for dep in node.depends_on() {
            if dep == node.id {
                return Err(ConfigError::InvalidReference(format!(
                    "node '{}' depends on itself",
                    node.id
                )));
            }
            if !ids.contains(dep.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "node '{}' depends on unknown node '{}'",
                    node.id, dep
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::NodeKind;

    const NO_ENV: fn(&str) -> Option<String> = |_| None;

    #[test]
    fn test_parse_simple_stack() {
        let kdl = r#"
            stack "cx-agent"

            resource "registry" {
                input "name" "cx-agent"
                input "retention" 30
            }
        "#;

        let stack = parse_stack_with(kdl, NO_ENV).unwrap();
        assert_eq!(stack.name, "cx-agent");
        assert_eq!(stack.nodes.len(), 1);

        let registry = &stack.nodes[0];
        assert_eq!(registry.kind, NodeKind::Plain);
        assert_eq!(registry.inputs["name"], Value::literal("cx-agent"));
        assert_eq!(registry.inputs["retention"], Value::literal(30i64));
    }

    #[test]
    fn test_parse_image_and_references() {
        let kdl = r#"
            stack "cx-agent"

            resource "registry" {
                input "name" "cx-agent"
            }

            image "agent-image" {
                context "./src"
                exclude "**/__pycache__" ".venv"
                repository ref="registry.name"
                platform "linux/arm64"
                forced
            }

            resource "runtime" {
                input "image_uri" ref="agent-image.uri"
                command "./scripts/runtime.sh" "--apply"
                publish "/amazon/runtime_arn" from="arn"
            }
        "#;

        let stack = parse_stack_with(kdl, NO_ENV).unwrap();
        let image = &stack.nodes[1];
        assert_eq!(image.kind, NodeKind::BuildTriggered);
        let build = image.build.as_ref().unwrap();
        assert_eq!(build.context, PathBuf::from("./src"));
        assert_eq!(build.exclude, vec!["**/__pycache__", ".venv"]);
        assert_eq!(build.platform, "linux/arm64");
        assert!(build.forced);
        assert_eq!(image.inputs["repository"], Value::reference("registry", "name"));

        let runtime = &stack.nodes[2];
        assert!(runtime.depends_on().contains("agent-image"));
        assert_eq!(
            runtime.command.as_deref(),
            Some(&["./scripts/runtime.sh".to_string(), "--apply".to_string()][..])
        );
        assert_eq!(runtime.publish[0].target, PublishTarget::Parameter);
    }

    #[test]
    fn test_secret_inputs() {
        let kdl = r#"
            stack "s"

            resource "gateway" {
                input "api_key" secret-env="GATEWAY_API_KEY"
                input "client_secret" secret="literal-secret"
                sensitive "token"
                secret "gateway_credentials" from="token"
            }
        "#;

        let stack = parse_stack_with(kdl, |k| (k == "GATEWAY_API_KEY").then(|| "sk-123".to_string())).unwrap();
        let gateway = &stack.nodes[0];
        assert!(gateway.inputs["api_key"].is_secret());
        assert!(gateway.inputs["client_secret"].is_secret());
        assert!(gateway.sensitive_outputs.contains("token"));
        assert_eq!(gateway.publish[0].target, PublishTarget::Secret);
    }

    #[test]
    fn test_missing_secret_env() {
        let kdl = r#"
            stack "s"
            resource "gateway" {
                input "api_key" secret-env="NOT_SET"
            }
        "#;
        assert!(matches!(
            parse_stack_with(kdl, NO_ENV),
            Err(ConfigError::MissingEnv(_))
        ));
    }

    #[test]
    fn test_detect_unknown_reference() {
        let kdl = r#"
            stack "bad"
            resource "runtime" {
                input "image_uri" ref="nonexistent.uri"
            }
        "#;

        assert!(matches!(
            parse_stack_with(kdl, NO_ENV),
            Err(ConfigError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_detect_duplicate_nodes() {
        let kdl = r#"
            stack "dup"
            resource "a"
            resource "a"
        "#;

        assert!(matches!(
            parse_stack_with(kdl, NO_ENV),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn test_depends_on_forms() {
        let kdl = r#"
            stack "deps"
            resource "auth"
            resource "kb"
            resource "secrets" depends-on="auth" {
                depends-on "kb"
            }
        "#;

        let stack = parse_stack_with(kdl, NO_ENV).unwrap();
        let deps: Vec<_> = stack.nodes[2].depends_on().into_iter().collect();
        assert_eq!(deps, vec!["auth", "kb"]);
    }

    #[test]
    fn test_bad_parameter_path() {
        let kdl = r#"
            stack "p"
            resource "guardrail" {
                publish "guardrail_id" from="id"
            }
        "#;

        assert!(matches!(
            parse_stack_with(kdl, NO_ENV),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_image_requires_context_and_repository() {
        let kdl = r#"
            stack "i"
            image "img" {
                repository "example.com/img"
            }
        "#;
        assert!(matches!(
            parse_stack_with(kdl, NO_ENV),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_repository_declared_twice_rejected() {
        let as_input = r#"
            stack "i"
            image "img" {
                context "."
                input "repository" "example.com/a"
                repository "example.com/b"
            }
        "#;
        assert!(matches!(
            parse_stack_with(as_input, NO_ENV),
            Err(ConfigError::Duplicate(_))
        ));

        let repeated = r#"
            stack "i"
            image "img" {
                context "."
                repository "example.com/a"
                repository "example.com/b"
            }
        "#;
        assert!(matches!(
            parse_stack_with(repeated, NO_ENV),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn test_missing_stack_name() {
        assert!(matches!(
            parse_stack_with("resource \"a\"", NO_ENV),
            Err(ConfigError::MissingField(_))
        ));
    }
}

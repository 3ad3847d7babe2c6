//! Provisioning of plain nodes.

use keel_core::applier::ResolvedNode;
use keel_core::{Error, Outputs, Result, Scalar, Value};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::process::{Invocation, redacted_stderr_tail};

/// Runs a plain node's external command.
///
/// The resolved inputs are written to stdin as one JSON object (secrets in
/// plaintext, on stdin only) and stdout is parsed as a JSON object of
/// outputs. Output names the node lists as sensitive come back as secrets.
/// Nodes without a command pass their inputs through as outputs.
#[derive(Debug, Clone, Default)]
pub struct CommandProvisioner {
    working_dir: Option<PathBuf>,
}

impl CommandProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory commands run in; relative command paths resolve against it.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub async fn provision(&self, node: &ResolvedNode, cancel: &CancellationToken) -> Result<Outputs> {
        let Some((program, args)) = node.node.command.as_ref().and_then(|c| c.split_first()) else {
            return Ok(pass_through(node));
        };

        let stdin: serde_json::Map<String, serde_json::Value> = node
            .inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.expose_json()))
            .collect();
        let stdin = serde_json::to_vec(&stdin)
            .map_err(|e| Error::InternalInvariantViolation(format!("encoding inputs: {e}")))?;

        let program = match &self.working_dir {
            Some(dir) if program.contains('/') && !program.starts_with('/') => {
                dir.join(program).display().to_string()
            }
            _ => program.clone(),
        };

        info!(node_id = %node.id(), program = %program, "Running provisioning command");
        let mut invocation = Invocation::new(&program)
            .args(args.iter().cloned())
            .stdin(stdin);
        if let Some(dir) = &self.working_dir {
            invocation = invocation.current_dir(dir);
        }
        let output = invocation.output(cancel).await?;

        if !output.status.success() {
            error!(node_id = %node.id(), code = ?output.status.code(), "Provisioning command failed");
            return Err(Error::action_failed(
                node.id(),
                format!(
                    "command exited with {}: {}",
                    output.status,
                    redacted_stderr_tail(&output, &secret_inputs(node))
                ),
            ));
        }

        parse_outputs(node, &output.stdout)
    }
}

/// Plaintext of every secret input, for masking command diagnostics.
fn secret_inputs(node: &ResolvedNode) -> Vec<String> {
    node.inputs
        .values()
        .filter_map(|v| match v {
            Value::Secret(s) => Some(s.to_string()),
            _ => None,
        })
        .collect()
}

fn pass_through(node: &ResolvedNode) -> Outputs {
    node.inputs
        .iter()
        .map(|(k, v)| {
            let v = match v {
                Value::Literal(s) if node.node.sensitive_outputs.contains(k) => Value::Secret(s.clone()),
                other => other.clone(),
            };
            (k.clone(), v)
        })
        .collect()
}

fn parse_outputs(node: &ResolvedNode, stdout: &[u8]) -> Result<Outputs> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Outputs::new());
    }

    let parsed: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|e| Error::action_failed(node.id(), format!("stdout is not valid JSON: {e}")))?;
    let serde_json::Value::Object(map) = parsed else {
        return Err(Error::action_failed(node.id(), "stdout must be a JSON object"));
    };

    Ok(map
        .iter()
        .map(|(k, v)| {
            let scalar = Scalar::from_json(v);
            let value = if node.node.sensitive_outputs.contains(k) {
                Value::Secret(scalar)
            } else {
                Value::Literal(scalar)
            };
            (k.clone(), value)
        })
        .collect())
}

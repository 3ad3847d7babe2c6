//! The default node applier.

use async_trait::async_trait;
use keel_core::applier::{Applier, ApplyContext, ApplyOutcome, ResolvedNode, TriggerAudit};
use keel_core::store::TriggerStore;
use keel_core::{BuildSpec, Error, NodeKind, Outputs, Result, Value};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::info;

use crate::container::{ImageBuildRequest, ImageBuilder, image_uri};
use crate::fingerprint::{ExcludeSet, fingerprint_async};
use crate::provisioner::CommandProvisioner;
use crate::trigger::{FORCED_KEY_PREFIX, TriggerRunner};

/// Length of tags derived from a trigger key.
pub const TAG_LEN: usize = 12;

/// Input naming the image repository of a build node.
pub const REPOSITORY_INPUT: &str = "repository";

/// Per-call time limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyTimeouts {
    pub scan: Duration,
    pub action: Duration,
    pub call: Duration,
}

impl Default for ApplyTimeouts {
    fn default() -> Self {
        Self {
            scan: Duration::from_secs(60),
            action: Duration::from_secs(1800),
            call: Duration::from_secs(300),
        }
    }
}

/// Image tag derived from a trigger key: the first [`TAG_LEN`] hex
/// characters, ignoring the forced-key prefix.
pub fn default_tag(key: &str) -> String {
    key.strip_prefix(FORCED_KEY_PREFIX)
        .unwrap_or(key)
        .chars()
        .filter(char::is_ascii_hexdigit)
        .take(TAG_LEN)
        .collect()
}

async fn within<T>(
    limit: Duration,
    resource_id: &str,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::action_failed(
            resource_id,
            format!("{what} timed out after {}s", limit.as_secs()),
        )),
    }
}

/// Applies plain nodes through a [`CommandProvisioner`] and build nodes
/// through a fingerprint-guarded [`ImageBuilder`] run.
pub struct DefaultApplier {
    runner: TriggerRunner,
    builder: Arc<dyn ImageBuilder>,
    provisioner: CommandProvisioner,
    timeouts: ApplyTimeouts,
}

impl DefaultApplier {
    pub fn new(triggers: Arc<dyn TriggerStore>, builder: Arc<dyn ImageBuilder>) -> Self {
        Self {
            runner: TriggerRunner::new(triggers),
            builder,
            provisioner: CommandProvisioner::new(),
            timeouts: ApplyTimeouts::default(),
        }
    }

    pub fn with_provisioner(mut self, provisioner: CommandProvisioner) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_timeouts(mut self, timeouts: ApplyTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    async fn apply_build(&self, node: &ResolvedNode, spec: &BuildSpec, ctx: &ApplyContext) -> Result<ApplyOutcome> {
        let id = node.id();
        let repository = node.input_string(REPOSITORY_INPUT).ok_or_else(|| {
            Error::InvalidInput(format!("build node '{id}' has no resolved '{REPOSITORY_INPUT}' input"))
        })?;

        let excludes = ExcludeSet::new(&spec.exclude)?;
        let fingerprint = within(
            self.timeouts.scan,
            id,
            "fingerprint scan",
            fingerprint_async(spec.context.clone(), excludes),
        )
        .await?
        .into_string();
        let fp = &fingerprint;
        let attempted = OnceLock::new();
        let attempted_key = &attempted;

        let outcome = self
            .runner
            .run_if_changed(id, &fingerprint, spec.forced, |key| async move {
                let _ = attempted_key.set(key.clone());
                let tag = spec.tag.clone().unwrap_or_else(|| default_tag(&key));
                let request = ImageBuildRequest {
                    resource_id: id.to_string(),
                    context: spec.context.clone(),
                    dockerfile: spec.dockerfile.clone(),
                    platform: spec.platform.clone(),
                    image_uri: image_uri(&repository, &tag),
                };
                within(
                    self.timeouts.action,
                    id,
                    "image build",
                    self.builder.build_and_push(&request, &ctx.cancel),
                )
                .await?;

                let mut outputs = Outputs::new();
                outputs.insert("uri".into(), Value::literal(request.image_uri));
                outputs.insert("tag".into(), Value::literal(tag));
                outputs.insert("fingerprint".into(), Value::literal(fp.clone()));
                Ok(outputs)
            })
            .await
            .map_err(|cause| match attempted.into_inner() {
                // The action ran under this key; keep it for the report.
                Some(key) => Error::TriggeredActionFailed {
                    trigger: TriggerAudit {
                        fingerprint: fingerprint.clone(),
                        key,
                        executed: true,
                    },
                    cause: Box::new(cause),
                },
                None => cause,
            })?;

        info!(
            node_id = %id,
            fingerprint = %fingerprint,
            executed = outcome.executed,
            "Build node applied"
        );

        Ok(ApplyOutcome {
            outputs: outcome.output,
            trigger: Some(TriggerAudit {
                fingerprint,
                key: outcome.key,
                executed: outcome.executed,
            }),
        })
    }
}

#[async_trait]
impl Applier for DefaultApplier {
    fn name(&self) -> &'static str {
        "default"
    }

    async fn apply(&self, node: &ResolvedNode, ctx: &ApplyContext) -> Result<ApplyOutcome> {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match node.node.kind {
            NodeKind::BuildTriggered => {
                let spec = node.node.build.as_ref().ok_or_else(|| {
                    Error::InternalInvariantViolation(format!(
                        "build node '{}' has no build settings",
                        node.id()
                    ))
                })?;
                self.apply_build(node, spec, ctx).await
            }
            NodeKind::Plain => {
                let outputs = within(
                    self.timeouts.call,
                    node.id(),
                    "provisioning call",
                    self.provisioner.provision(node, &ctx.cancel),
                )
                .await?;
                Ok(ApplyOutcome::new(outputs))
            }
        }
    }
}

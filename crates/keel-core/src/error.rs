//! Error types for Keel.

use std::path::PathBuf;

use thiserror::Error;

use crate::applier::TriggerAudit;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cycle detected in dependencies: {}", .path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("action failed for '{resource_id}': {cause}")]
    ActionFailed { resource_id: String, cause: String },

    #[error("node '{node_id}' failed: {cause}")]
    NodeApplyFailed {
        node_id: String,
        #[source]
        cause: Box<Error>,
    },

    /// A triggered build that ran and failed, with the key it ran under.
    #[error("{cause}")]
    TriggeredActionFailed {
        trigger: TriggerAudit,
        #[source]
        cause: Box<Error>,
    },

    #[error("publish failed for '{path}': {cause}")]
    PublishFailed { path: String, cause: String },

    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    /// Wrap an io error with the path it happened at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Build an `ActionFailed` from anything printable.
    pub fn action_failed(resource_id: impl Into<String>, cause: impl ToString) -> Self {
        Error::ActionFailed {
            resource_id: resource_id.into(),
            cause: cause.to_string(),
        }
    }

    /// Wrap a node-level failure for reporting. Already wrapped errors pass through.
    pub fn node_apply_failed(node_id: impl Into<String>, cause: Error) -> Self {
        match cause {
            Error::NodeApplyFailed { .. } => cause,
            other => Error::NodeApplyFailed {
                node_id: node_id.into(),
                cause: Box::new(other),
            },
        }
    }

    /// The trigger audit carried by a failed triggered build, if any.
    pub fn trigger(&self) -> Option<&TriggerAudit> {
        match self {
            Error::TriggeredActionFailed { trigger, .. } => Some(trigger),
            Error::NodeApplyFailed { cause, .. } => cause.trigger(),
            _ => None,
        }
    }

    /// Whether the error is a cancellation, possibly wrapped.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::NodeApplyFailed { cause, .. } | Error::TriggeredActionFailed { cause, .. } => cause.is_cancelled(),
            _ => false,
        }
    }

    /// Whether a caller may reasonably retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io { .. } | Error::ActionFailed { .. } | Error::Timeout(_) => true,
            Error::PublishFailed { .. } | Error::Store(_) => true,
            Error::NodeApplyFailed { cause, .. } | Error::TriggeredActionFailed { cause, .. } => {
                cause.is_retryable()
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_path() {
        let err = Error::CycleDetected {
            path: vec!["a".into(), "b".into(), "c".into(), "a".into()],
        };
        assert_eq!(
            err.to_string(),
            "cycle detected in dependencies: a -> b -> c -> a"
        );
    }

    #[test]
    fn test_node_apply_failed_does_not_double_wrap() {
        let inner = Error::action_failed("image", "exit status 1");
        let wrapped = Error::node_apply_failed("image", inner);
        let rewrapped = Error::node_apply_failed("other", wrapped);

        match rewrapped {
            Error::NodeApplyFailed { node_id, cause } => {
                assert_eq!(node_id, "image");
                assert!(matches!(*cause, Error::ActionFailed { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_trigger_audit_survives_wrapping() {
        let failed = Error::TriggeredActionFailed {
            trigger: TriggerAudit {
                fingerprint: "ab12".into(),
                key: "ab12".into(),
                executed: true,
            },
            cause: Box::new(Error::action_failed("image", "push failed")),
        };
        assert_eq!(failed.to_string(), "action failed for 'image': push failed");

        let wrapped = Error::node_apply_failed("image", failed);
        assert_eq!(wrapped.trigger().map(|t| t.key.as_str()), Some("ab12"));
        assert!(!wrapped.is_cancelled());
        assert!(Error::node_apply_failed("image", Error::Cancelled).is_cancelled());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::action_failed("x", "boom").is_retryable());
        assert!(!Error::CycleDetected { path: vec![] }.is_retryable());
        assert!(!Error::InternalInvariantViolation("bug".into()).is_retryable());
    }
}

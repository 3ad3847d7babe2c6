//! Change-triggered execution.
//!
//! A build action only runs when its trigger key differs from the key stored
//! for the resource, when no record exists, or when forced. Successful runs
//! persist the new key together with the action output; skipped runs return
//! the stored output.

use keel_core::store::{TriggerRecord, TriggerStore};
use keel_core::{Error, Outputs, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Prefix of keys used by forced runs. Never a valid hex fingerprint.
pub const FORCED_KEY_PREFIX: &str = "forced:";

/// A key unique to one forced invocation.
pub fn forced_key() -> String {
    format!("{FORCED_KEY_PREFIX}{}", Uuid::now_v7())
}

/// What [`TriggerRunner::run_if_changed`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerOutcome {
    pub output: Outputs,
    /// The key compared against the stored record.
    pub key: String,
    /// Whether the action ran.
    pub executed: bool,
}

/// Runs actions guarded by a trigger store.
#[derive(Clone)]
pub struct TriggerRunner {
    store: Arc<dyn TriggerStore>,
}

impl TriggerRunner {
    pub fn new(store: Arc<dyn TriggerStore>) -> Self {
        Self { store }
    }

    /// Whether an unforced run with `key` would execute.
    pub async fn would_run(&self, resource_id: &str, key: &str) -> Result<bool> {
        Ok(match self.store.get(resource_id).await? {
            Some(record) => record.last_key != key,
            None => true,
        })
    }

    /// Execute `action` iff forced, no record exists, or `current_key`
    /// differs from the stored key.
    ///
    /// If persisting the new record fails the call fails too, so the next
    /// invocation runs the action again instead of skipping it.
    pub async fn run_if_changed<F, Fut>(
        &self,
        resource_id: &str,
        current_key: &str,
        forced: bool,
        action: F,
    ) -> Result<TriggerOutcome>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Outputs>>,
    {
        let key = if forced {
            forced_key()
        } else {
            current_key.to_string()
        };

        let prior = self.store.get(resource_id).await?;
        if let Some(record) = prior.as_ref().filter(|r| !forced && r.last_key == key) {
            debug!(resource_id = %resource_id, key = %key, "Trigger key unchanged; skipping action");
            return Ok(TriggerOutcome {
                output: record.last_output.clone(),
                key,
                executed: false,
            });
        }

        info!(
            resource_id = %resource_id,
            key = %key,
            forced,
            had_record = prior.is_some(),
            "Running triggered action"
        );

        let output = action(key.clone()).await.map_err(|e| match e {
            Error::ActionFailed { .. } | Error::Cancelled => e,
            other => Error::action_failed(resource_id, other),
        })?;

        self.store
            .put(TriggerRecord::new(resource_id, key.clone(), output.clone()))
            .await?;

        Ok(TriggerOutcome {
            output,
            key,
            executed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keel_core::Value;
    use keel_store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn output(tag: &str) -> Outputs {
        let mut o = Outputs::new();
        o.insert("tag".into(), Value::literal(tag));
        o
    }

    struct Counter(AtomicUsize);

    impl Counter {
        fn new() -> Self {
            Self(AtomicUsize::new(0))
        }

        async fn act(&self, key: String) -> Result<Outputs> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(output(&key))
        }

        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_unchanged_key_suppresses_action() {
        let runner = TriggerRunner::new(Arc::new(InMemoryStore::new()));
        let counter = Counter::new();

        let first = runner
            .run_if_changed("image", "k1", false, |k| counter.act(k))
            .await
            .unwrap();
        assert!(first.executed);

        let second = runner
            .run_if_changed("image", "k1", false, |k| counter.act(k))
            .await
            .unwrap();
        assert!(!second.executed);
        assert_eq!(second.output, first.output);
        assert_eq!(counter.count(), 1);

        let third = runner
            .run_if_changed("image", "k2", false, |k| counter.act(k))
            .await
            .unwrap();
        assert!(third.executed);
        assert_eq!(counter.count(), 2);
    }

    #[tokio::test]
    async fn test_forced_always_runs_with_unique_key() {
        let runner = TriggerRunner::new(Arc::new(InMemoryStore::new()));
        let counter = Counter::new();

        runner
            .run_if_changed("image", "k1", false, |k| counter.act(k))
            .await
            .unwrap();
        let a = runner
            .run_if_changed("image", "k1", true, |k| counter.act(k))
            .await
            .unwrap();
        let b = runner
            .run_if_changed("image", "k1", true, |k| counter.act(k))
            .await
            .unwrap();

        assert_eq!(counter.count(), 3);
        assert!(a.key.starts_with(FORCED_KEY_PREFIX));
        assert_ne!(a.key, b.key);
    }

    #[tokio::test]
    async fn test_failed_action_leaves_record_untouched() {
        let store = Arc::new(InMemoryStore::new());
        let runner = TriggerRunner::new(store.clone());
        let counter = Counter::new();

        runner
            .run_if_changed("image", "k1", false, |k| counter.act(k))
            .await
            .unwrap();
        let err = runner
            .run_if_changed("image", "k2", false, |_| async {
                Err(Error::Store("registry unreachable".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ActionFailed { ref resource_id, .. } if resource_id == "image"));

        let record = TriggerStore::get(store.as_ref(), "image").await.unwrap().unwrap();
        assert_eq!(record.last_key, "k1");
    }

    /// Store whose writes fail until `healthy` is set.
    struct FailingPut {
        inner: InMemoryStore,
        healthy: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TriggerStore for FailingPut {
        async fn get(&self, id: &str) -> Result<Option<TriggerRecord>> {
            TriggerStore::get(&self.inner, id).await
        }

        async fn put(&self, record: TriggerRecord) -> Result<()> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(Error::Store("disk full".into()));
            }
            TriggerStore::put(&self.inner, record).await
        }

        async fn delete(&self, id: &str) -> Result<()> {
            TriggerStore::delete(&self.inner, id).await
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_reruns_next_time() {
        let store = Arc::new(FailingPut {
            inner: InMemoryStore::new(),
            healthy: std::sync::atomic::AtomicBool::new(false),
        });
        let runner = TriggerRunner::new(store.clone());
        let counter = Counter::new();

        let err = runner
            .run_if_changed("image", "k1", false, |k| counter.act(k))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));

        store.healthy.store(true, Ordering::SeqCst);
        let outcome = runner
            .run_if_changed("image", "k1", false, |k| counter.act(k))
            .await
            .unwrap();
        assert!(outcome.executed);
        assert_eq!(counter.count(), 2);
    }

    #[tokio::test]
    async fn test_would_run() {
        let runner = TriggerRunner::new(Arc::new(InMemoryStore::new()));
        assert!(runner.would_run("image", "k1").await.unwrap());
        runner
            .run_if_changed("image", "k1", false, |k| async move { Ok(output(&k)) })
            .await
            .unwrap();
        assert!(!runner.would_run("image", "k1").await.unwrap());
        assert!(runner.would_run("image", "k2").await.unwrap());
    }
}

//! Registry -> Image -> Runtime across three runs against a durable store.

use async_trait::async_trait;
use keel_core::report::{NodeStatus, RunReport, RunStatus};
use keel_core::store::{ParameterStore, Stores};
use keel_core::{Error, ResourceNode, Result, Value};
use keel_executor::{DefaultApplier, ImageBuildRequest, ImageBuilder};
use keel_scheduler::{Graph, Orchestrator};
use keel_store::FileStore;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const STACK: &str = r#"
stack "scenario"

resource "registry" {
    input "url" "registry.local/cx-agent"
}

image "image" {
    context "./src"
    exclude "**/__pycache__"
    repository ref="registry.url"
}

resource "runtime" {
    input "image_uri" ref="image.uri"
    publish "/amazon/runtime_image" from="image_uri"
}
"#;

#[derive(Default)]
struct FakeBuilder {
    pushed: Mutex<Vec<String>>,
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build_and_push(&self, request: &ImageBuildRequest, _cancel: &CancellationToken) -> Result<()> {
        self.pushed.lock().unwrap().push(request.image_uri.clone());
        Ok(())
    }
}

/// Failing builder used to check that a failed build leaves the old record.
struct BrokenBuilder;

#[async_trait]
impl ImageBuilder for BrokenBuilder {
    async fn build_and_push(&self, request: &ImageBuildRequest, _cancel: &CancellationToken) -> Result<()> {
        Err(Error::action_failed(&request.resource_id, "push failed (exit status: 1): denied"))
    }
}

async fn run(root: &Path, builder: Arc<dyn ImageBuilder>) -> RunReport {
    let stack = keel_config::load_stack(&root.join("keel.kdl")).unwrap();
    let graph = Graph::build(stack.nodes).unwrap();
    let store = Arc::new(FileStore::open(root.join(".keel")).await.unwrap());
    let stores = Stores::from_backend(store);
    let applier = DefaultApplier::new(stores.triggers.clone(), builder);

    Orchestrator::new(Arc::new(applier), stores)
        .run(&graph, CancellationToken::new(), None)
        .await
        .unwrap()
}

fn output(report: &RunReport, node: &str, name: &str) -> String {
    report.node(node).unwrap().outputs[name]
        .as_str()
        .unwrap()
        .to_string()
}

fn executed(report: &RunReport) -> bool {
    report.node("image").unwrap().trigger.as_ref().unwrap().executed
}

fn workspace() -> TempDir {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("keel.kdl"), STACK).unwrap();
    std::fs::create_dir_all(root.path().join("src")).unwrap();
    std::fs::write(root.path().join("src/app.py"), "print('hello')\n").unwrap();
    root
}

#[tokio::test]
async fn test_rebuilds_only_when_source_changes() {
    let root = workspace();
    let builder = Arc::new(FakeBuilder::default());

    // First run: the image builds and the runtime receives its uri.
    let first = run(root.path(), builder.clone()).await;
    assert_eq!(first.status, RunStatus::AllApplied);
    assert!(executed(&first));
    let uri1 = output(&first, "image", "uri");
    assert!(uri1.starts_with("registry.local/cx-agent:"));
    assert_eq!(output(&first, "runtime", "image_uri"), uri1);

    // Second run, unchanged tree: no build, same uri downstream.
    std::fs::create_dir_all(root.path().join("src/__pycache__")).unwrap();
    std::fs::write(root.path().join("src/__pycache__/app.pyc"), "cache").unwrap();
    let second = run(root.path(), builder.clone()).await;
    assert!(!executed(&second));
    assert_eq!(output(&second, "image", "uri"), uri1);
    assert_eq!(output(&second, "runtime", "image_uri"), uri1);
    assert_eq!(builder.pushed.lock().unwrap().len(), 1);

    // Third run, one byte changed: rebuild with a new uri.
    std::fs::write(root.path().join("src/app.py"), "print('hellO')\n").unwrap();
    let third = run(root.path(), builder.clone()).await;
    assert!(executed(&third));
    let uri2 = output(&third, "image", "uri");
    assert_ne!(uri2, uri1);
    assert_eq!(output(&third, "runtime", "image_uri"), uri2);
    assert_eq!(*builder.pushed.lock().unwrap(), vec![uri1, uri2.clone()]);

    let store = FileStore::open(root.path().join(".keel")).await.unwrap();
    let published = ParameterStore::get(&store, "/amazon/runtime_image").await.unwrap();
    assert_eq!(published.value.as_str(), Some(uri2.as_str()));
}

#[tokio::test]
async fn test_failed_build_is_retried_next_run() {
    let root = workspace();
    let builder = Arc::new(FakeBuilder::default());

    let first = run(root.path(), builder.clone()).await;
    let uri1 = output(&first, "image", "uri");

    std::fs::write(root.path().join("src/app.py"), "print('changed')\n").unwrap();
    let broken = run(root.path(), Arc::new(BrokenBuilder)).await;
    assert_eq!(broken.status, RunStatus::PartiallyApplied);
    assert!(matches!(
        broken.node("image").unwrap().status,
        NodeStatus::Failed { .. }
    ));
    assert!(matches!(
        broken.node("runtime").unwrap().status,
        NodeStatus::Skipped { .. }
    ));

    // The failed attempt still records which key it ran under.
    let attempted = broken.node("image").unwrap().trigger.as_ref().unwrap();
    assert!(attempted.executed);
    assert_eq!(attempted.key, attempted.fingerprint);
    assert_ne!(
        attempted.fingerprint,
        output(&first, "image", "fingerprint")
    );

    let retry = run(root.path(), builder.clone()).await;
    assert!(executed(&retry));
    assert_ne!(output(&retry, "image", "uri"), uri1);
    assert_eq!(builder.pushed.lock().unwrap().len(), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_command_does_not_leak_secret_inputs() {
    let root = TempDir::new().unwrap();
    let node = ResourceNode::plain("gateway")
        .with_input("api_key", Value::secret("SUPERSECRET123"))
        .with_command(vec!["sh".into(), "-c".into(), "cat >&2; exit 1".into()]);
    let graph = Graph::build(vec![node]).unwrap();
    let store = Arc::new(FileStore::open(root.path().join(".keel")).await.unwrap());
    let stores = Stores::from_backend(store);
    let applier = DefaultApplier::new(stores.triggers.clone(), Arc::new(FakeBuilder::default()));

    let (mut events, handle) =
        Orchestrator::new(Arc::new(applier), stores).execute(graph, CancellationToken::new());
    let mut rendered = Vec::new();
    while let Some(event) = events.recv().await {
        rendered.push(format!("{event:?}"));
    }
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("api_key"));
    assert!(!json.contains("SUPERSECRET123"));
    assert!(rendered.iter().all(|e| !e.contains("SUPERSECRET123")));
}

//! Request paths whose job cannot be queued must not strand the workspace.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};
use ws_orchestrator::test_utils::create_test_db;
use ws_orchestrator::{
    HealthConfig, OrchestratorConfig, OrchestratorError, WorkspaceService, WorkspaceStatus,
};
use ws_proxy::RecordingRoutes;
use ws_queue::{Job, JobKind, JobQueue, MemoryQueue, QueueError, ReceivedJob};
use ws_runtime::StubRuntime;

/// In-memory queue whose `send` can be switched off.
#[derive(Default)]
struct FlakyQueue {
    inner: MemoryQueue,
    down: AtomicBool,
}

impl FlakyQueue {
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobQueue for FlakyQueue {
    async fn send(&self, job: &Job) -> ws_queue::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(QueueError::Internal("queue unavailable".into()));
        }
        self.inner.send(job).await
    }

    async fn receive(&self) -> ws_queue::Result<Option<ReceivedJob>> {
        self.inner.receive().await
    }

    async fn delete(&self, receipt: &str) -> ws_queue::Result<()> {
        self.inner.delete(receipt).await
    }
}

struct Fixture {
    service: WorkspaceService,
    queue: Arc<FlakyQueue>,
    _health: MockServer,
}

async fn fixture() -> Fixture {
    let health = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&health)
        .await;

    let queue = Arc::new(FlakyQueue::default());
    let service = WorkspaceService::new(
        create_test_db().await,
        Arc::new(StubRuntime::new().with_address(health.address().to_string())),
        Arc::new(RecordingRoutes::new()),
        queue.clone(),
        OrchestratorConfig {
            health: HealthConfig {
                interval_ms: 10,
                max_attempts: 3,
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .unwrap();

    Fixture {
        service,
        queue,
        _health: health,
    }
}

#[tokio::test]
async fn test_create_enqueue_failure_marks_error() {
    let f = fixture().await;
    f.queue.set_down(true);

    assert!(matches!(
        f.service.create("demo", "base").await,
        Err(OrchestratorError::Queue(_))
    ));
    let workspace = f.service.get_by_name("demo").await.unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Error);
}

#[tokio::test]
async fn test_start_enqueue_failure_leaves_workspace_restartable() {
    let f = fixture().await;
    let workspace = f.service.create("demo", "base").await.unwrap();
    f.service.set_error(&workspace.id, "boot failed").await;

    f.queue.set_down(true);
    assert!(matches!(
        f.service.start(&workspace.id).await,
        Err(OrchestratorError::Queue(_))
    ));

    let failed = f.service.get(&workspace.id).await.unwrap();
    assert_eq!(failed.status, WorkspaceStatus::Error);
    assert!(failed
        .error_message
        .unwrap()
        .contains("failed to queue start"));

    f.queue.set_down(false);
    let restarted = f.service.start(&workspace.id).await.unwrap();
    assert_eq!(restarted.status, WorkspaceStatus::Creating);
    assert_eq!(
        f.queue.inner.pending().await.last(),
        Some(&Job::new(JobKind::Start, workspace.id.clone()))
    );
}

#[tokio::test]
async fn test_stop_enqueue_failure_leaves_workspace_removable() {
    let f = fixture().await;
    let workspace = f.service.create("demo", "base").await.unwrap();
    f.service.provision_and_start(&workspace.id).await.unwrap();

    f.queue.set_down(true);
    assert!(matches!(
        f.service.stop(&workspace.id).await,
        Err(OrchestratorError::Queue(_))
    ));

    let failed = f.service.get(&workspace.id).await.unwrap();
    assert_eq!(failed.status, WorkspaceStatus::Error);
    assert!(failed.error_message.unwrap().contains("failed to queue stop"));

    f.queue.set_down(false);
    f.service.remove(&workspace.id).await.unwrap();
    assert_eq!(
        f.queue.inner.pending().await.last(),
        Some(&Job::new(JobKind::Delete, workspace.id.clone()))
    );
}

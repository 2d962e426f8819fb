//! End-to-end tests: entry points, event consumption, and status rows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use conflux::{
    ChannelTransport, DispatchEngine, DispatchStatus, DownstreamClient, DownstreamError,
    EventHandler, EventLoop, EventProducer, KeyedDedupScheduler, Orchestrator, PayloadItem,
    ServiceName, SqliteStatusStore, Status, StatusStore, TaskEvent, TaskRequest, TransportError,
};
use serde_json::json;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct StubDownstream {
    failures: HashMap<ServiceName, String>,
}

#[async_trait]
impl DownstreamClient for StubDownstream {
    async fn call(
        &self,
        service: ServiceName,
        items: &[serde_json::Value],
    ) -> Result<serde_json::Value, DownstreamError> {
        match self.failures.get(&service) {
            Some(message) => Err(DownstreamError::Status {
                status: 500,
                body: message.clone(),
            }),
            None => Ok(json!({"service": service.as_str(), "processed": items.len()})),
        }
    }
}

struct FailingProducer;

#[async_trait]
impl EventProducer for FailingProducer {
    async fn publish(&self, _event: &TaskEvent) -> Result<(), TransportError> {
        Err(TransportError::Publish("broker unreachable".into()))
    }
}

async fn setup_store() -> Arc<SqliteStatusStore> {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    let store = SqliteStatusStore::new(pool);
    store.run_migrations().await.unwrap();
    Arc::new(store)
}

fn orchestrator(
    store: Arc<SqliteStatusStore>,
    stub: StubDownstream,
    producer: Option<Arc<dyn EventProducer>>,
) -> Arc<Orchestrator> {
    let engine = Arc::new(DispatchEngine::new(store.clone(), Arc::new(stub)));
    Arc::new(Orchestrator::new(store, engine, producer))
}

fn revenue_request() -> TaskRequest {
    TaskRequest {
        task_name: "monthly revenue".into(),
        task_description: Some("revenue only".into()),
        payload: vec![PayloadItem {
            revenue: Some(json!({"scenario_id": "s9", "business_type_id": "b9"})),
            ..Default::default()
        }],
    }
}

#[tokio::test]
async fn test_direct_dispatch_single_service() {
    let store = setup_store().await;
    let orchestrator = orchestrator(store.clone(), StubDownstream::default(), None);

    let outcome = orchestrator
        .dispatch_direct(revenue_request())
        .await
        .unwrap();
    assert_eq!(outcome.status, DispatchStatus::Success);
    assert_eq!(outcome.results.len(), 1);
    assert!(outcome.results.contains_key(&ServiceName::Revenue));
    assert!(outcome.errors.is_empty());

    let detail = store.get_task(&outcome.task_id).await.unwrap().unwrap();
    assert_eq!(detail.task.status, Status::Completed);
}

#[tokio::test]
async fn test_direct_dispatch_partial_success_fails_task() {
    let store = setup_store().await;
    let mut failures = HashMap::new();
    failures.insert(ServiceName::Rebates, "internal error".to_string());
    let orchestrator = orchestrator(store.clone(), StubDownstream { failures }, None);

    let request = TaskRequest {
        task_name: "revenue and rebates".into(),
        task_description: None,
        payload: vec![PayloadItem {
            revenue: Some(json!({"scenario_id": "s1", "business_type_id": "b1"})),
            rebates: Some(json!({"tier": 2})),
            ..Default::default()
        }],
    };

    let outcome = orchestrator.dispatch_direct(request).await.unwrap();
    assert_eq!(outcome.status, DispatchStatus::PartialSuccess);
    assert_eq!(outcome.results.len(), 1);
    assert!(outcome.errors.contains_key("rebates"));

    let detail = store.get_task(&outcome.task_id).await.unwrap().unwrap();
    assert_eq!(detail.task.status, Status::Failed);
}

#[tokio::test]
async fn test_direct_dispatch_validation_failure() {
    let store = setup_store().await;
    let orchestrator = orchestrator(store.clone(), StubDownstream::default(), None);

    let request = TaskRequest {
        task_name: "empty".into(),
        task_description: None,
        payload: vec![],
    };

    let outcome = orchestrator.dispatch_direct(request).await.unwrap();
    assert_eq!(outcome.status, DispatchStatus::Failure);
    assert!(outcome.errors.contains_key("validation"));

    let detail = store.get_task(&outcome.task_id).await.unwrap().unwrap();
    assert_eq!(detail.task.status, Status::Failed);
    assert!(detail.service_requests.is_empty());
}

#[tokio::test]
async fn test_submit_publishes_and_consumer_completes_task() {
    let store = setup_store().await;
    let transport = ChannelTransport::new(4, Duration::from_millis(50));
    let orchestrator = orchestrator(
        store.clone(),
        StubDownstream::default(),
        Some(Arc::new(transport.clone())),
    );

    let scheduler = Arc::new(KeyedDedupScheduler::new());
    let event_loop = EventLoop::new(
        Arc::new(transport.clone()),
        orchestrator.clone(),
        scheduler,
        Duration::from_millis(20),
    );
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let run = tokio::spawn(async move { event_loop.run(run_cancel).await });

    let receipt = orchestrator.submit(revenue_request()).await.unwrap();
    assert_eq!(receipt.status, "accepted");

    // The task starts pending and the consumer loop drives it to completion.
    tokio::time::sleep(Duration::from_millis(400)).await;
    cancel.cancel();
    run.await.unwrap().unwrap();

    let detail = store.get_task(&receipt.task_id).await.unwrap().unwrap();
    assert_eq!(detail.task.status, Status::Completed);
    assert_eq!(detail.service_requests.len(), 1);
    assert_eq!(transport.uncommitted(), 0);
}

#[tokio::test]
async fn test_submit_falls_back_to_direct_dispatch_on_publish_failure() {
    let store = setup_store().await;
    let orchestrator = orchestrator(
        store.clone(),
        StubDownstream::default(),
        Some(Arc::new(FailingProducer)),
    );

    let receipt = orchestrator.submit(revenue_request()).await.unwrap();
    assert_eq!(receipt.status, "accepted");

    // Cooperative shutdown drains the supervised background dispatch.
    orchestrator.drain().await;

    let detail = store.get_task(&receipt.task_id).await.unwrap().unwrap();
    assert_eq!(detail.task.status, Status::Completed);
    assert_eq!(detail.service_requests.len(), 1);
}

#[tokio::test]
async fn test_bare_correlation_event_uses_stored_payload() {
    let store = setup_store().await;
    let orchestrator = orchestrator(store.clone(), StubDownstream::default(), None);

    // Task persisted up front, as the async entry point does.
    let task = store
        .create_task(conflux::NewTask {
            task_id: Some("task-77".into()),
            name: "stored payload".into(),
            description: None,
            payload: revenue_request().payload,
        })
        .await
        .unwrap();

    let event = TaskEvent {
        task_id: task.task_id.clone(),
        scenario_id: "s9".into(),
        business_type_id: "b9".into(),
        timestamp: Utc::now(),
        task_name: None,
        task_description: None,
        payload: Vec::new(),
    };
    orchestrator.handle(event).await.unwrap();

    let detail = store.get_task("task-77").await.unwrap().unwrap();
    assert_eq!(detail.task.status, Status::Completed);
    assert_eq!(detail.service_requests.len(), 1);
}

#[tokio::test]
async fn test_event_for_unknown_task_creates_row() {
    let store = setup_store().await;
    let orchestrator = orchestrator(store.clone(), StubDownstream::default(), None);

    let event = TaskEvent {
        task_id: "task-unknown".into(),
        scenario_id: "s1".into(),
        business_type_id: "b1".into(),
        timestamp: Utc::now(),
        task_name: Some("late arrival".into()),
        task_description: None,
        payload: revenue_request().payload,
    };
    orchestrator.handle(event).await.unwrap();

    let detail = store.get_task("task-unknown").await.unwrap().unwrap();
    assert_eq!(detail.task.name, "late arrival");
    assert_eq!(detail.task.status, Status::Completed);
}

#[tokio::test]
async fn test_bare_event_for_unknown_task_fails_validation() {
    let store = setup_store().await;
    let orchestrator = orchestrator(store.clone(), StubDownstream::default(), None);

    let event = TaskEvent {
        task_id: "task-ghost".into(),
        scenario_id: "s1".into(),
        business_type_id: "b1".into(),
        timestamp: Utc::now(),
        task_name: None,
        task_description: None,
        payload: Vec::new(),
    };
    orchestrator.handle(event).await.unwrap();

    // The row exists so the drop is auditable, and validation failed it.
    let detail = store.get_task("task-ghost").await.unwrap().unwrap();
    assert_eq!(detail.task.status, Status::Failed);
    assert!(detail.service_requests.is_empty());
}

#[tokio::test]
async fn test_list_tasks_shows_both_entry_paths() {
    let store = setup_store().await;
    let orchestrator = orchestrator(store.clone(), StubDownstream::default(), None);

    orchestrator
        .dispatch_direct(revenue_request())
        .await
        .unwrap();
    let receipt = orchestrator.submit(revenue_request()).await.unwrap();
    orchestrator.drain().await;

    let tasks = orchestrator.list_tasks().await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].task_id, receipt.task_id);
}

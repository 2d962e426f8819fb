//! Orchestrator facade: the synchronous and asynchronous entry points, task
//! queries, and the event handler the consumer loop drives.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::dispatch::{DispatchEngine, DispatchOutcome};
use crate::model::{correlation_ids, PayloadItem, ServiceName, TaskRequest};
use crate::scheduler::EventHandler;
use crate::store::{NewTask, StatusStore, StoreError, TaskDetail, TaskRecord};
use crate::transport::{EventProducer, TaskEvent};

/// Receipt for an asynchronously accepted request.
#[derive(Debug, Clone, Serialize)]
pub struct Accepted {
    pub task_id: String,
    pub status: &'static str,
}

/// Front door for orchestration requests.
///
/// The synchronous path dispatches inline and returns the aggregated
/// outcome. The asynchronous path persists the task, publishes a correlation
/// event, and falls back to a supervised background dispatch when publishing
/// fails or no producer is configured.
pub struct Orchestrator {
    store: Arc<dyn StatusStore>,
    engine: Arc<DispatchEngine>,
    producer: Option<Arc<dyn EventProducer>>,
    background: tokio::sync::Mutex<JoinSet<()>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StatusStore>,
        engine: Arc<DispatchEngine>,
        producer: Option<Arc<dyn EventProducer>>,
    ) -> Self {
        Self {
            store,
            engine,
            producer,
            background: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Synchronous entry point: create the task and dispatch inline.
    pub async fn dispatch_direct(
        &self,
        request: TaskRequest,
    ) -> Result<DispatchOutcome, StoreError> {
        let task = self.create_task(&request).await?;
        self.engine.dispatch(&task.task_id, &request.payload).await
    }

    /// Asynchronous entry point: create the task, publish the event, return
    /// immediately.
    pub async fn submit(&self, request: TaskRequest) -> Result<Accepted, StoreError> {
        let task = self.create_task(&request).await?;
        let (scenario_id, business_type_id) = event_correlation(&request.payload);
        let event = TaskEvent {
            task_id: task.task_id.clone(),
            scenario_id,
            business_type_id,
            timestamp: Utc::now(),
            task_name: Some(request.task_name.clone()),
            task_description: request.task_description.clone(),
            payload: request.payload.clone(),
        };

        match &self.producer {
            Some(producer) => match producer.publish(&event).await {
                Ok(()) => info!(task_id = %task.task_id, "event published"),
                Err(e) => {
                    warn!(
                        task_id = %task.task_id,
                        error = %e,
                        "publish failed; falling back to direct dispatch"
                    );
                    self.spawn_dispatch(task.task_id.clone(), request.payload)
                        .await;
                }
            },
            None => {
                self.spawn_dispatch(task.task_id.clone(), request.payload)
                    .await
            }
        }

        Ok(Accepted {
            task_id: task.task_id,
            status: "accepted",
        })
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskDetail>, StoreError> {
        self.store.get_task(task_id).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.store.list_tasks().await
    }

    /// Wait for all background dispatches to finish. Part of cooperative
    /// shutdown: in-flight work is drained, not abandoned.
    pub async fn drain(&self) {
        let mut background = self.background.lock().await;
        while let Some(result) = background.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "background dispatch panicked");
            }
        }
    }

    async fn create_task(&self, request: &TaskRequest) -> Result<TaskRecord, StoreError> {
        self.store
            .create_task(NewTask {
                task_id: None,
                name: request.task_name.clone(),
                description: request.task_description.clone(),
                payload: request.payload.clone(),
            })
            .await
    }

    async fn spawn_dispatch(&self, task_id: String, payload: Vec<PayloadItem>) {
        let engine = Arc::clone(&self.engine);
        let mut background = self.background.lock().await;
        background.spawn(async move {
            if let Err(e) = engine.dispatch(&task_id, &payload).await {
                error!(task_id = %task_id, error = %e, "background dispatch failed");
            }
        });
    }
}

#[async_trait]
impl EventHandler for Orchestrator {
    async fn handle(&self, event: TaskEvent) -> Result<(), StoreError> {
        // The stored payload is authoritative; a bare correlation event only
        // identifies the task. Unknown tasks are created from the event.
        let payload = match self.store.get_task(&event.task_id).await? {
            Some(detail) => detail.task.payload,
            None => {
                info!(task_id = %event.task_id, "creating task row from event");
                let new_task = NewTask {
                    task_id: Some(event.task_id.clone()),
                    name: event
                        .task_name
                        .clone()
                        .unwrap_or_else(|| "unnamed task".to_string()),
                    description: event.task_description.clone(),
                    payload: event.payload.clone(),
                };
                match self.store.create_task(new_task).await {
                    Ok(task) => task.payload,
                    // Lost a create race with another consumer; use theirs.
                    Err(StoreError::DuplicateTask(_)) => self
                        .store
                        .get_task(&event.task_id)
                        .await?
                        .map(|detail| detail.task.payload)
                        .unwrap_or_default(),
                    Err(e) => return Err(e),
                }
            }
        };

        self.engine.dispatch(&event.task_id, &payload).await?;
        Ok(())
    }
}

/// Correlation ids for the published event, read from the first payload item
/// that carries them.
fn event_correlation(payload: &[PayloadItem]) -> (String, String) {
    for service in ServiceName::ALL {
        let (scenario, business) = correlation_ids(payload, service);
        if scenario.is_some() || business.is_some() {
            return (
                scenario.unwrap_or_default(),
                business.unwrap_or_default(),
            );
        }
    }
    (String::new(), String::new())
}

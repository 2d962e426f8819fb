//! Fan-out dispatch engine: partition a payload by target service, call the
//! services concurrently, aggregate partial success, and drive status writes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::downstream::DownstreamClient;
use crate::model::{correlation_ids, validate_payload, PayloadItem, ServiceName};
use crate::store::{NewServiceRequest, Status, StatusStore, StoreError};

/// Overall outcome of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Success,
    PartialSuccess,
    Failure,
}

/// Aggregated result of one dispatch. Partial success is a first-class
/// outcome: `results` and `errors` can both be non-empty.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub task_id: String,
    pub status: DispatchStatus,
    pub results: BTreeMap<ServiceName, serde_json::Value>,
    pub errors: BTreeMap<String, String>,
}

/// Dispatches validated payloads to the downstream services.
///
/// Only a [`StoreError`] aborts a dispatch; downstream failures are captured
/// per service and never escalate to sibling calls.
pub struct DispatchEngine {
    store: Arc<dyn StatusStore>,
    client: Arc<dyn DownstreamClient>,
}

impl DispatchEngine {
    pub fn new(store: Arc<dyn StatusStore>, client: Arc<dyn DownstreamClient>) -> Self {
        Self { store, client }
    }

    /// Run one dispatch for an existing task.
    pub async fn dispatch(
        &self,
        task_id: &str,
        payload: &[PayloadItem],
    ) -> Result<DispatchOutcome, StoreError> {
        info!(task_id, items = payload.len(), "starting dispatch");
        self.store
            .update_task_status(task_id, Status::InProgress, None)
            .await?;

        if let Err(e) = validate_payload(payload) {
            warn!(task_id, error = %e, "rejecting invalid payload");
            let mut errors = BTreeMap::new();
            errors.insert("validation".to_string(), e.to_string());
            let message = render_errors(&errors);
            self.store
                .update_task_status(task_id, Status::Failed, Some(&message))
                .await?;
            return Ok(DispatchOutcome {
                task_id: task_id.into(),
                status: DispatchStatus::Failure,
                results: BTreeMap::new(),
                errors,
            });
        }

        // Partition by present sub-item, preserving item order.
        let mut batches = Vec::new();
        for service in ServiceName::ALL {
            let items: Vec<serde_json::Value> = payload
                .iter()
                .filter_map(|item| item.get(service).cloned())
                .collect();
            if !items.is_empty() {
                batches.push((service, items));
            }
        }

        // Service request rows exist before any call goes out, so a crash
        // mid-dispatch leaves auditable PENDING rows.
        let mut pending = Vec::with_capacity(batches.len());
        for (service, items) in batches {
            let (scenario_id, business_type_id) = correlation_ids(payload, service);
            let record = self
                .store
                .create_service_request(
                    task_id,
                    NewServiceRequest {
                        service_name: service,
                        scenario_id,
                        business_type_id,
                        request_payload: json!({ "items": items }),
                    },
                )
                .await?;
            pending.push((service, record.id, items));
        }

        let mut calls = Vec::with_capacity(pending.len());
        for (service, id, items) in &pending {
            self.store
                .update_service_request_status(*id, Status::InProgress, None, None)
                .await?;
            let client = Arc::clone(&self.client);
            calls.push(async move { (*service, *id, client.call(*service, items).await) });
        }

        // Join, never race: every call settles before aggregation.
        let settled = futures::future::join_all(calls).await;

        let mut results = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for (service, id, outcome) in settled {
            match outcome {
                Ok(body) => {
                    self.store
                        .update_service_request_status(id, Status::Completed, Some(&body), None)
                        .await?;
                    results.insert(service, body);
                }
                Err(e) => {
                    let text = e.to_string();
                    error!(task_id, service = %service, error = %text, "downstream call failed");
                    self.store
                        .update_service_request_status(id, Status::Failed, None, Some(&text))
                        .await?;
                    errors.insert(service.as_str().to_string(), text);
                }
            }
        }

        let status = if errors.is_empty() {
            DispatchStatus::Success
        } else if results.is_empty() {
            DispatchStatus::Failure
        } else {
            DispatchStatus::PartialSuccess
        };

        match status {
            DispatchStatus::Success => {
                self.store
                    .update_task_status(task_id, Status::Completed, None)
                    .await?;
            }
            _ => {
                let message = render_errors(&errors);
                self.store
                    .update_task_status(task_id, Status::Failed, Some(&message))
                    .await?;
            }
        }

        info!(task_id, status = ?status, "dispatch settled");
        Ok(DispatchOutcome {
            task_id: task_id.into(),
            status,
            results,
            errors,
        })
    }
}

fn render_errors(errors: &BTreeMap<String, String>) -> String {
    serde_json::to_string(errors).unwrap_or_else(|_| format!("{errors:?}"))
}

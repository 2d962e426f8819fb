//! SQLite implementation of StatusStore.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use super::{
    rollup, NewServiceRequest, NewTask, RequestId, ServiceRequestRecord, Status, StatusStore,
    StoreError, TaskDetail, TaskRecord,
};
use crate::model::{PayloadItem, ServiceName};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conflux_tasks (
    id INTEGER PRIMARY KEY,
    task_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    description TEXT,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conflux_service_requests (
    id INTEGER PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES conflux_tasks(task_id) ON DELETE CASCADE,
    service_name TEXT NOT NULL,
    scenario_id TEXT,
    business_type_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    request_payload TEXT NOT NULL,
    response_payload TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conflux_tasks_created ON conflux_tasks(created_at, id);
CREATE INDEX IF NOT EXISTS idx_conflux_requests_task ON conflux_service_requests(task_id);
"#;

/// Errors longer than this are truncated before persisting.
const MAX_ERROR_LEN: usize = 2000;

/// SQLite-backed status store.
#[derive(Clone)]
pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl SqliteStatusStore {
    /// Create a new store over the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the task tracking tables.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
            }
        }
        Ok(())
    }
}

fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp {text:?}: {e}")))
}

fn parse_status(text: &str) -> Result<Status, StoreError> {
    text.parse().map_err(StoreError::Serialization)
}

fn parse_service(text: &str) -> Result<ServiceName, StoreError> {
    text.parse().map_err(StoreError::Serialization)
}

fn parse_payload(text: &str) -> Result<Vec<PayloadItem>, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn truncate_error(error: &str) -> &str {
    if error.len() > MAX_ERROR_LEN {
        let mut end = MAX_ERROR_LEN;
        while !error.is_char_boundary(end) {
            end -= 1;
        }
        &error[..end]
    } else {
        error
    }
}

type TaskRow = (
    String,         // task_id
    String,         // name
    Option<String>, // description
    String,         // payload
    String,         // status
    Option<String>, // error_message
    String,         // created_at
    String,         // updated_at
);

fn task_from_row(row: TaskRow) -> Result<TaskRecord, StoreError> {
    let (task_id, name, description, payload, status, error_message, created_at, updated_at) = row;
    Ok(TaskRecord {
        task_id,
        name,
        description,
        payload: parse_payload(&payload)?,
        status: parse_status(&status)?,
        error_message,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

type RequestRow = (
    i64,            // id
    String,         // task_id
    String,         // service_name
    Option<String>, // scenario_id
    Option<String>, // business_type_id
    String,         // status
    String,         // request_payload
    Option<String>, // response_payload
    Option<String>, // error_message
    String,         // created_at
    String,         // updated_at
);

fn request_from_row(row: RequestRow) -> Result<ServiceRequestRecord, StoreError> {
    let (
        id,
        task_id,
        service_name,
        scenario_id,
        business_type_id,
        status,
        request_payload,
        response_payload,
        error_message,
        created_at,
        updated_at,
    ) = row;
    Ok(ServiceRequestRecord {
        id: RequestId(id),
        task_id,
        service_name: parse_service(&service_name)?,
        scenario_id,
        business_type_id,
        status: parse_status(&status)?,
        request_payload: serde_json::from_str(&request_payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        response_payload: response_payload
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        error_message,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

/// Apply a task status write inside an open transaction, honoring the
/// monotone transition rule. Returns true when the row changed.
async fn apply_task_status(
    conn: &mut SqliteConnection,
    task_id: &str,
    status: Status,
    error_message: Option<&str>,
) -> Result<bool, StoreError> {
    let current: Option<String> =
        sqlx::query_scalar("SELECT status FROM conflux_tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

    let current = parse_status(&current.ok_or_else(|| StoreError::TaskNotFound(task_id.into()))?)?;

    if current == status {
        return Ok(false);
    }
    if !current.can_transition(status) {
        warn!(
            task_id,
            from = %current,
            to = %status,
            "ignoring disallowed task status transition"
        );
        return Ok(false);
    }

    sqlx::query(
        r#"
        UPDATE conflux_tasks
        SET status = ?, error_message = COALESCE(?, error_message), updated_at = ?
        WHERE task_id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(error_message.map(truncate_error))
    .bind(now_text())
    .bind(task_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| StoreError::Storage(e.to_string()))?;

    Ok(true)
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn create_task(&self, new_task: NewTask) -> Result<TaskRecord, StoreError> {
        let task_id = new_task
            .task_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let payload = serde_json::to_string(&new_task.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = now_text();

        let result = sqlx::query(
            r#"
            INSERT INTO conflux_tasks (task_id, name, description, payload, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&task_id)
        .bind(&new_task.name)
        .bind(&new_task.description)
        .bind(&payload)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            let message = e.to_string();
            return if message.contains("UNIQUE") {
                Err(StoreError::DuplicateTask(task_id))
            } else {
                Err(StoreError::Storage(message))
            };
        }

        let now = parse_timestamp(&now)?;
        Ok(TaskRecord {
            task_id,
            name: new_task.name,
            description: new_task.description,
            payload: new_task.payload,
            status: Status::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn create_service_request(
        &self,
        task_id: &str,
        request: NewServiceRequest,
    ) -> Result<ServiceRequestRecord, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM conflux_tasks WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StoreError::Storage(e.to_string()))?;
        if exists.is_none() {
            return Err(StoreError::TaskNotFound(task_id.into()));
        }

        let payload = serde_json::to_string(&request.request_payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = now_text();

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO conflux_service_requests
                (task_id, service_name, scenario_id, business_type_id, status, request_payload, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(task_id)
        .bind(request.service_name.as_str())
        .bind(&request.scenario_id)
        .bind(&request.business_type_id)
        .bind(&payload)
        .bind(&now)
        .bind(&now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let now = parse_timestamp(&now)?;
        Ok(ServiceRequestRecord {
            id: RequestId(id),
            task_id: task_id.into(),
            service_name: request.service_name,
            scenario_id: request.scenario_id,
            business_type_id: request.business_type_id,
            status: Status::Pending,
            request_payload: request.request_payload,
            response_payload: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: Status,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        apply_task_status(&mut tx, task_id, status, error_message).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))
    }

    async fn update_service_request_status(
        &self,
        id: RequestId,
        status: Status,
        response_payload: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<Option<Status>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let row: Option<(String, String)> =
            sqlx::query_as("SELECT task_id, status FROM conflux_service_requests WHERE id = ?")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StoreError::Storage(e.to_string()))?;
        let (task_id, current) = row.ok_or(StoreError::RequestNotFound(id.0))?;
        let current = parse_status(&current)?;

        if current == status || !current.can_transition(status) {
            if current != status {
                warn!(
                    request_id = id.0,
                    from = %current,
                    to = %status,
                    "ignoring disallowed service request status transition"
                );
            }
            tx.commit()
                .await
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            return Ok(None);
        }

        let response = response_payload
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE conflux_service_requests
            SET status = ?,
                response_payload = COALESCE(?, response_payload),
                error_message = COALESCE(?, error_message),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(response)
        .bind(error_message.map(truncate_error))
        .bind(now_text())
        .bind(id.0)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        // Rollup against the owning task within the same transaction.
        let sibling_statuses: Vec<String> =
            sqlx::query_scalar("SELECT status FROM conflux_service_requests WHERE task_id = ?")
                .bind(&task_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| StoreError::Storage(e.to_string()))?;
        let sibling_statuses = sibling_statuses
            .iter()
            .map(|s| parse_status(s))
            .collect::<Result<Vec<_>, _>>()?;

        let transitioned = match rollup(&sibling_statuses) {
            Some(next) => apply_task_status(&mut tx, &task_id, next, error_message)
                .await?
                .then_some(next),
            None => None,
        };

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(transitioned)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskDetail>, StoreError> {
        let row: Option<TaskRow> = sqlx::query_as(
            r#"
            SELECT task_id, name, description, payload, status, error_message, created_at, updated_at
            FROM conflux_tasks
            WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let task = task_from_row(row)?;

        let rows: Vec<RequestRow> = sqlx::query_as(
            r#"
            SELECT id, task_id, service_name, scenario_id, business_type_id, status,
                   request_payload, response_payload, error_message, created_at, updated_at
            FROM conflux_service_requests
            WHERE task_id = ?
            ORDER BY id
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        let service_requests = rows
            .into_iter()
            .map(request_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(TaskDetail {
            task,
            service_requests,
        }))
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT task_id, name, description, payload, status, error_message, created_at, updated_at
            FROM conflux_tasks
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        rows.into_iter().map(task_from_row).collect()
    }
}

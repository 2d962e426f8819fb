//! Event transport abstraction.
//!
//! The scheduler and service depend only on the [`EventProducer`] and
//! [`EventConsumer`] traits; the concrete transport (in-process channel,
//! HTTP long-poll, or an external log broker) is picked once at startup.

pub mod channel;
pub mod http_poll;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::PayloadItem;

pub use channel::ChannelTransport;
pub use http_poll::{HttpPollConsumer, HttpPollProducer};

/// Error type for transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect error: {0}")]
    Connect(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("receive error: {0}")]
    Receive(String),

    #[error("commit error: {0}")]
    Commit(String),
}

/// Which transport to wire up at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// In-process partitioned channel, for tests and single-node setups.
    InMemory,
    /// HTTP long-poll against a broker emulator endpoint.
    HttpPoll,
}

/// A task correlation event as carried on the wire.
///
/// `payload` may be empty: a bare correlation event refers to a task whose
/// payload is already persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub scenario_id: String,
    pub business_type_id: String,
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<PayloadItem>,
}

impl TaskEvent {
    /// The unit of deduplication and per-key serialization.
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.scenario_id, self.business_type_id)
    }
}

/// One message as delivered by a transport.
#[derive(Debug, Clone)]
pub struct EventMessage {
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub body: Vec<u8>,
    pub properties: HashMap<String, String>,
}

impl EventMessage {
    /// Decode the body as a [`TaskEvent`].
    pub fn task_event(&self) -> Result<TaskEvent, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Publishes task events. Must not block the caller past the transport
/// acknowledging the send.
#[async_trait]
pub trait EventProducer: Send + Sync {
    async fn publish(&self, event: &TaskEvent) -> Result<(), TransportError>;
}

/// Consumes task events in ordered per-partition batches with manual,
/// per-message acknowledgement. Uncommitted messages are redelivered.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Wait up to `max_wait` for messages; an empty vec means the wait
    /// elapsed. Messages within one partition arrive in offset order.
    async fn next_batch(&self, max_wait: Duration) -> Result<Vec<EventMessage>, TransportError>;

    /// Acknowledge one message so it is never redelivered.
    async fn commit(&self, message: &EventMessage) -> Result<(), TransportError>;
}

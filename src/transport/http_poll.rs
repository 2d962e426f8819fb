//! HTTP long-poll transport.
//!
//! Talks to a broker emulator over plain HTTP: the producer POSTs messages
//! to a topic endpoint, the consumer GETs from a cursor with a long-poll
//! wait. Commits are tracked client-side as an offset watermark, so
//! uncommitted messages are fetched again on the next poll.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{EventConsumer, EventMessage, EventProducer, TaskEvent, TransportError};
use crate::retry::Backoff;

#[derive(Debug, Serialize)]
struct WirePublish<'a> {
    key: String,
    properties: HashMap<String, String>,
    body: &'a TaskEvent,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    partition: u32,
    offset: u64,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    properties: HashMap<String, String>,
    body: serde_json::Value,
}

/// Client-side commit bookkeeping: the cursor is the lowest uncommitted
/// offset; offsets committed ahead of it are remembered until it catches up.
#[derive(Debug, Default)]
struct CommitTracker {
    cursor: u64,
    committed: BTreeSet<u64>,
}

impl CommitTracker {
    fn mark(&mut self, offset: u64) {
        if offset >= self.cursor {
            self.committed.insert(offset);
        }
        while self.committed.remove(&self.cursor) {
            self.cursor += 1;
        }
    }

    fn is_committed(&self, offset: u64) -> bool {
        offset < self.cursor || self.committed.contains(&offset)
    }
}

/// Publishes events to the broker's HTTP message endpoint.
pub struct HttpPollProducer {
    client: reqwest::Client,
    publish_url: String,
}

impl HttpPollProducer {
    pub fn new(base_url: &str, topic: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            publish_url: format!("{base_url}/eventhubs/{topic}/messages"),
        })
    }
}

#[async_trait]
impl EventProducer for HttpPollProducer {
    async fn publish(&self, event: &TaskEvent) -> Result<(), TransportError> {
        let mut properties = HashMap::new();
        properties.insert("task_id".to_string(), event.task_id.clone());
        properties.insert(
            "timestamp".to_string(),
            event
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        );
        let message = WirePublish {
            key: event.partition_key(),
            properties,
            body: event,
        };

        let response = self
            .client
            .post(&self.publish_url)
            .json(&message)
            .send()
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Publish(format!(
                "publish endpoint returned {}",
                response.status()
            )));
        }
        debug!(task_id = %event.task_id, "published event over http");
        Ok(())
    }
}

/// Polls the broker's HTTP consumer endpoint for message batches.
pub struct HttpPollConsumer {
    client: reqwest::Client,
    poll_url: String,
    tracker: Mutex<CommitTracker>,
}

impl HttpPollConsumer {
    /// Probe the topic endpoint with bounded backoff, then return a
    /// connected consumer. Fails with `TransportError::Connect` once the
    /// attempt cap is reached.
    pub async fn connect(
        base_url: &str,
        topic: &str,
        consumer_group: &str,
        backoff: &Backoff,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let probe_url = format!("{base_url}/eventhubs/{topic}");

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match client.get(&probe_url).send().await {
                Ok(response) if response.status().is_success() => break,
                Ok(response) => {
                    warn!(attempt, status = %response.status(), "transport probe rejected");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "transport probe failed");
                }
            }
            match backoff.delay_for_attempt(attempt) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(TransportError::Connect(format!(
                        "gave up connecting to {probe_url} after {attempt} attempts"
                    )))
                }
            }
        }

        info!(topic, consumer_group, "connected http poll consumer");
        Ok(Self {
            client,
            poll_url: format!(
                "{base_url}/eventhubs/{topic}/consumergroups/{consumer_group}/messages"
            ),
            tracker: Mutex::new(CommitTracker::default()),
        })
    }

    fn cursor(&self) -> u64 {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner()).cursor
    }
}

#[async_trait]
impl EventConsumer for HttpPollConsumer {
    async fn next_batch(&self, max_wait: Duration) -> Result<Vec<EventMessage>, TransportError> {
        let url = format!(
            "{}?from={}&max_wait_ms={}",
            self.poll_url,
            self.cursor(),
            max_wait.as_millis()
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Receive(format!(
                "poll endpoint returned {}",
                response.status()
            )));
        }

        let wire: Vec<WireMessage> = response
            .json()
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;

        let tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        let batch = wire
            .into_iter()
            .filter(|m| !tracker.is_committed(m.offset))
            .map(|m| {
                Ok(EventMessage {
                    partition: m.partition,
                    offset: m.offset,
                    key: m.key,
                    body: serde_json::to_vec(&m.body)
                        .map_err(|e| TransportError::Receive(e.to_string()))?,
                    properties: m.properties,
                })
            })
            .collect::<Result<Vec<_>, TransportError>>()?;
        Ok(batch)
    }

    async fn commit(&self, message: &EventMessage) -> Result<(), TransportError> {
        let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        tracker.mark(message.offset);
        Ok(())
    }
}

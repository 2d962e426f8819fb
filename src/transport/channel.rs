//! In-process partitioned transport.
//!
//! A small broker over a mutex-guarded queue: messages are keyed onto
//! partitions, delivered in offset order, and redelivered after a delay
//! unless committed. Backs the integration tests and single-node setups.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use tokio::time::Instant;

use super::{EventConsumer, EventMessage, EventProducer, TaskEvent, TransportError};

const POLL_STEP: Duration = Duration::from_millis(10);

struct Stored {
    partition: u32,
    offset: u64,
    key: Option<String>,
    body: Vec<u8>,
    properties: HashMap<String, String>,
    available_at: Instant,
}

#[derive(Default)]
struct BrokerState {
    messages: Vec<Stored>,
    next_offset: u64,
}

/// In-process transport implementing both the producer and consumer traits.
///
/// Clones share the same broker state.
#[derive(Clone)]
pub struct ChannelTransport {
    state: Arc<Mutex<BrokerState>>,
    partitions: u32,
    redelivery_delay: Duration,
}

impl ChannelTransport {
    pub fn new(partitions: u32, redelivery_delay: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            partitions: partitions.max(1),
            redelivery_delay,
        }
    }

    fn partition_for(&self, key: Option<&str>) -> u32 {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % u64::from(self.partitions)) as u32
            }
            None => 0,
        }
    }

    /// Enqueue an opaque body, bypassing event serialization.
    pub fn publish_raw(&self, key: Option<&str>, body: Vec<u8>) {
        let partition = self.partition_for(key);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let offset = state.next_offset;
        state.next_offset += 1;
        state.messages.push(Stored {
            partition,
            offset,
            key: key.map(str::to_string),
            body,
            properties: HashMap::new(),
            available_at: Instant::now(),
        });
    }

    /// Number of messages not yet committed, counting ones awaiting
    /// redelivery.
    pub fn uncommitted(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.messages.len()
    }

    fn take_available(&self) -> Vec<EventMessage> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let redeliver_at = now + self.redelivery_delay;
        let mut batch = Vec::new();
        for stored in state
            .messages
            .iter_mut()
            .filter(|m| m.available_at <= now)
        {
            stored.available_at = redeliver_at;
            batch.push(EventMessage {
                partition: stored.partition,
                offset: stored.offset,
                key: stored.key.clone(),
                body: stored.body.clone(),
                properties: stored.properties.clone(),
            });
        }
        batch
    }
}

#[async_trait]
impl EventProducer for ChannelTransport {
    async fn publish(&self, event: &TaskEvent) -> Result<(), TransportError> {
        let body = serde_json::to_vec(event).map_err(|e| TransportError::Publish(e.to_string()))?;
        let key = event.partition_key();
        let partition = self.partition_for(Some(&key));
        let mut properties = HashMap::new();
        properties.insert("task_id".to_string(), event.task_id.clone());
        properties.insert(
            "timestamp".to_string(),
            event
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        );

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let offset = state.next_offset;
        state.next_offset += 1;
        state.messages.push(Stored {
            partition,
            offset,
            key: Some(key),
            body,
            properties,
            available_at: Instant::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl EventConsumer for ChannelTransport {
    async fn next_batch(&self, max_wait: Duration) -> Result<Vec<EventMessage>, TransportError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let batch = self.take_available();
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn commit(&self, message: &EventMessage) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let found = state
            .messages
            .iter()
            .position(|m| m.partition == message.partition && m.offset == message.offset);
        match found {
            Some(index) => {
                state.messages.remove(index);
                Ok(())
            }
            None => Err(TransportError::Commit(format!(
                "unknown message at partition {} offset {}",
                message.partition, message.offset
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(task_id: &str, key_suffix: &str) -> TaskEvent {
        TaskEvent {
            task_id: task_id.into(),
            scenario_id: format!("s-{key_suffix}"),
            business_type_id: format!("b-{key_suffix}"),
            timestamp: Utc::now(),
            task_name: None,
            task_description: None,
            payload: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_publish_and_consume() {
        let transport = ChannelTransport::new(4, Duration::from_millis(50));
        transport.publish(&event("t-1", "a")).await.unwrap();

        let batch = transport.next_batch(Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].properties.get("task_id").unwrap(), "t-1");
        assert_eq!(batch[0].task_event().unwrap().task_id, "t-1");
    }

    #[tokio::test]
    async fn test_committed_messages_are_not_redelivered() {
        let transport = ChannelTransport::new(1, Duration::from_millis(20));
        transport.publish(&event("t-1", "a")).await.unwrap();

        let batch = transport.next_batch(Duration::from_millis(100)).await.unwrap();
        transport.commit(&batch[0]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let batch = transport.next_batch(Duration::from_millis(10)).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(transport.uncommitted(), 0);
    }

    #[tokio::test]
    async fn test_uncommitted_messages_are_redelivered() {
        let transport = ChannelTransport::new(1, Duration::from_millis(20));
        transport.publish(&event("t-1", "a")).await.unwrap();

        let first = transport.next_batch(Duration::from_millis(100)).await.unwrap();
        assert_eq!(first.len(), 1);

        // Not committed: the message comes back after the redelivery delay.
        let redelivered = transport.next_batch(Duration::from_millis(200)).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].offset, first[0].offset);
    }

    #[tokio::test]
    async fn test_same_key_lands_on_same_partition() {
        let transport = ChannelTransport::new(8, Duration::from_millis(20));
        transport.publish(&event("t-1", "a")).await.unwrap();
        transport.publish(&event("t-2", "a")).await.unwrap();

        let batch = transport.next_batch(Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].partition, batch[1].partition);
        assert!(batch[0].offset < batch[1].offset);
    }
}

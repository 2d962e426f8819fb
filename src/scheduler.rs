//! Per-key deduplicating event scheduler.
//!
//! Under partitioned delivery, updates for one logical key can arrive in any
//! order and in bursts. Only the newest update per key may dispatch, and a
//! key never has two dispatches in flight. The scheduler owns one
//! mutex-guarded key map; dispatches run outside the lock and the critical
//! sections stay O(1) with no I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::retry::Backoff;
use crate::store::StoreError;
use crate::transport::{EventConsumer, EventMessage, TaskEvent, TransportError};

/// Processes admitted task events. A returned error means the event's work
/// could not be recorded; the message is left unacknowledged for redelivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: TaskEvent) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct KeyState {
    active_task_id: Option<String>,
    latest_seen: Option<DateTime<Utc>>,
}

/// Admission decision for one message.
#[derive(Debug)]
pub enum Admission {
    /// Dispatch now. Carries the previously recorded timestamp so a failed
    /// dispatch can restore it before the message is redelivered.
    Admitted {
        previous_seen: Option<DateTime<Utc>>,
    },
    /// Equal-or-older than an update already seen for the key. Acknowledge
    /// and drop.
    Stale,
    /// The key has a dispatch in flight: a newer task, or a redelivered
    /// copy of the active one. Leave unacknowledged so the transport
    /// redelivers once the key frees up.
    Busy,
}

/// Shared dedup state, constructed once at startup and handed to the
/// consumer loop.
#[derive(Default)]
pub struct KeyedDedupScheduler {
    keys: Mutex<HashMap<String, KeyState>>,
}

impl KeyedDedupScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps 1-4 of the admission check. The newest-seen timestamp is only
    /// recorded on admission: a deferred message must stay fresh for its
    /// redelivery.
    pub fn admit(&self, key: &str, task_id: &str, timestamp: DateTime<Utc>) -> Admission {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let state = keys.entry(key.to_string()).or_default();

        if let Some(active) = state.active_task_id.as_deref() {
            // A redelivered copy of the active task must not be acknowledged
            // while its dispatch can still fail; defer it like a newer task.
            if active == task_id {
                return Admission::Busy;
            }
            let superseded = state
                .latest_seen
                .is_some_and(|seen| timestamp <= seen);
            return if superseded {
                Admission::Stale
            } else {
                Admission::Busy
            };
        }

        if let Some(seen) = state.latest_seen {
            if timestamp <= seen {
                return Admission::Stale;
            }
        }

        let previous_seen = state.latest_seen.replace(timestamp);
        state.active_task_id = Some(task_id.to_string());
        Admission::Admitted { previous_seen }
    }

    /// Clear the in-flight marker for a key. When the dispatch failed, the
    /// previously seen timestamp is restored so the unacknowledged message
    /// does not supersede itself on redelivery.
    pub fn complete(
        &self,
        key: &str,
        task_id: &str,
        previous_seen: Option<DateTime<Utc>>,
        succeeded: bool,
    ) {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = keys.get_mut(key) {
            if state.active_task_id.as_deref() == Some(task_id) {
                state.active_task_id = None;
            }
            if !succeeded {
                state.latest_seen = previous_seen;
            }
        }
    }
}

/// Consumer loop: polls for batches, applies latest-wins and busy-defer per
/// key, and spawns admitted dispatches into a supervised set.
pub struct EventLoop {
    consumer: Arc<dyn EventConsumer>,
    handler: Arc<dyn EventHandler>,
    scheduler: Arc<KeyedDedupScheduler>,
    poll_wait: Duration,
    backoff: Backoff,
}

impl EventLoop {
    pub fn new(
        consumer: Arc<dyn EventConsumer>,
        handler: Arc<dyn EventHandler>,
        scheduler: Arc<KeyedDedupScheduler>,
        poll_wait: Duration,
    ) -> Self {
        Self {
            consumer,
            handler,
            scheduler,
            poll_wait,
            backoff: Backoff::default(),
        }
    }

    /// Override the reconnect backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until cancelled. Poll errors retry with bounded backoff and then
    /// become fatal. On cancellation the loop stops polling, lets in-flight
    /// dispatches finish, and returns.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TransportError> {
        let mut dispatches: JoinSet<()> = JoinSet::new();
        let mut failed_polls = 0u32;
        let mut fatal = None;

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.consumer.next_batch(self.poll_wait) => match result {
                    Ok(batch) => {
                        failed_polls = 0;
                        batch
                    }
                    Err(e) => {
                        failed_polls += 1;
                        match self.backoff.delay_for_attempt(failed_polls) {
                            Some(delay) => {
                                warn!(attempt = failed_polls, error = %e, "poll failed; backing off");
                                tokio::select! {
                                    _ = cancel.cancelled() => break,
                                    _ = tokio::time::sleep(delay) => {}
                                }
                                continue;
                            }
                            None => {
                                error!(error = %e, "poll failed after retries; stopping consumer");
                                fatal = Some(e);
                                break;
                            }
                        }
                    }
                }
            };

            self.process_batch(batch, &mut dispatches).await;

            // Reap finished dispatches so the set stays small.
            while let Some(result) = dispatches.try_join_next() {
                if let Err(e) = result {
                    error!(error = %e, "dispatch task panicked");
                }
            }
        }

        info!("consumer loop stopping; draining in-flight dispatches");
        while let Some(result) = dispatches.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "dispatch task panicked");
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn process_batch(&self, batch: Vec<EventMessage>, dispatches: &mut JoinSet<()>) {
        let mut parsed = Vec::with_capacity(batch.len());
        for message in batch {
            match message.task_event() {
                Ok(event) => parsed.push((message, event)),
                Err(e) => {
                    // Not retryable: a message without the required fields
                    // will never become processable.
                    warn!(
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "dropping undecodable message"
                    );
                    self.commit_or_warn(&message).await;
                }
            }
        }

        // Latest wins within the batch: only the newest update per key goes
        // to the admission check, the rest are acknowledged as superseded.
        let mut newest: HashMap<String, DateTime<Utc>> = HashMap::new();
        for (_, event) in &parsed {
            newest
                .entry(event.partition_key())
                .and_modify(|ts| *ts = (*ts).max(event.timestamp))
                .or_insert(event.timestamp);
        }
        let mut taken: HashSet<String> = HashSet::new();
        for (message, event) in parsed {
            let key = event.partition_key();
            let survives = newest.get(&key) == Some(&event.timestamp) && taken.insert(key.clone());
            if !survives {
                debug!(task_id = %event.task_id, key = %key, "superseded within batch");
                self.commit_or_warn(&message).await;
                continue;
            }

            match self.scheduler.admit(&key, &event.task_id, event.timestamp) {
                Admission::Stale => {
                    debug!(task_id = %event.task_id, key = %key, "dropping stale update");
                    self.commit_or_warn(&message).await;
                }
                Admission::Busy => {
                    debug!(
                        task_id = %event.task_id,
                        key = %key,
                        "key busy; leaving message for redelivery"
                    );
                }
                Admission::Admitted { previous_seen } => {
                    let handler = Arc::clone(&self.handler);
                    let scheduler = Arc::clone(&self.scheduler);
                    let consumer = Arc::clone(&self.consumer);
                    dispatches.spawn(async move {
                        let task_id = event.task_id.clone();
                        match handler.handle(event).await {
                            Ok(()) => {
                                scheduler.complete(&key, &task_id, previous_seen, true);
                                if let Err(e) = consumer.commit(&message).await {
                                    warn!(task_id = %task_id, error = %e, "commit failed");
                                }
                            }
                            Err(e) => {
                                error!(
                                    task_id = %task_id,
                                    key = %key,
                                    error = %e,
                                    "dispatch failed; leaving message for redelivery"
                                );
                                scheduler.complete(&key, &task_id, previous_seen, false);
                            }
                        }
                    });
                }
            }
        }
    }

    async fn commit_or_warn(&self, message: &EventMessage) {
        if let Err(e) = self.consumer.commit(message).await {
            warn!(
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "commit failed"
            );
        }
    }
}

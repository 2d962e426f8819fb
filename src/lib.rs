//! # Conflux
//!
//! Fan-out task orchestrator with per-key event deduplication.
//!
//! Conflux accepts orchestration requests, splits each payload across the
//! downstream compute services, calls them concurrently, and tracks
//! completion per service call and per task. Requests arrive directly or
//! through an event transport with latest-wins, one-dispatch-per-key
//! semantics.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conflux::{
//!     ChannelTransport, Config, DispatchEngine, EventLoop, HttpDownstreamClient,
//!     KeyedDedupScheduler, Orchestrator, SqliteStatusStore,
//! };
//!
//! let config = Config::from_env();
//! let pool = sqlx::SqlitePool::connect(&config.database_url).await?;
//! let store = Arc::new(SqliteStatusStore::new(pool));
//! store.run_migrations().await?;
//!
//! let client = Arc::new(HttpDownstreamClient::new(
//!     config.endpoints.clone(),
//!     config.downstream_timeout,
//! )?);
//! let engine = Arc::new(DispatchEngine::new(store.clone(), client));
//! let transport = ChannelTransport::new(config.partitions, config.redelivery_delay);
//! let orchestrator = Arc::new(Orchestrator::new(
//!     store,
//!     engine,
//!     Some(Arc::new(transport.clone())),
//! ));
//!
//! let scheduler = Arc::new(KeyedDedupScheduler::new());
//! let consumer_loop = EventLoop::new(
//!     Arc::new(transport),
//!     orchestrator.clone(),
//!     scheduler,
//!     config.poll_wait,
//! );
//! tokio::spawn(async move { consumer_loop.run(shutdown_token).await });
//!
//! let receipt = orchestrator.submit(request).await?;
//! ```
//!
//! ## Guarantees
//!
//! - Task and service-request statuses move monotonically from `Pending`
//!   toward `Completed` or `Failed`; terminal states are sticky.
//! - Partial success is a first-class dispatch outcome: one failing service
//!   never aborts its siblings.
//! - Per partition key, only the newest event dispatches and at most one
//!   dispatch is in flight; unrelated keys proceed independently.

pub mod config;
pub mod dispatch;
pub mod downstream;
pub mod model;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transport;

pub use config::Config;
pub use dispatch::{DispatchEngine, DispatchOutcome, DispatchStatus};
pub use downstream::{
    DownstreamClient, DownstreamError, HttpDownstreamClient, ServiceEndpoints,
};
pub use model::{PayloadItem, ServiceName, TaskRequest, ValidationError};
pub use retry::Backoff;
pub use scheduler::{Admission, EventHandler, EventLoop, KeyedDedupScheduler};
pub use service::{Accepted, Orchestrator};
pub use store::{
    NewServiceRequest, NewTask, RequestId, ServiceRequestRecord, SqliteStatusStore, Status,
    StatusStore, StoreError, TaskDetail, TaskRecord,
};
pub use transport::{
    ChannelTransport, EventConsumer, EventMessage, EventProducer, HttpPollConsumer,
    HttpPollProducer, TaskEvent, TransportError, TransportKind,
};

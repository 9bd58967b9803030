//! dispatch-q: a Redis-backed work-queue dispatcher
//!
//! Jobs are JSON payloads pushed to durable Redis lists, one list per
//! (topic, group) pair. The dispatcher provides:
//! - One poller per registered (topic, group) moving jobs off its list
//! - A fixed pool of workers fed through unbuffered fast and fallback lanes
//! - Bounded retries through the fallback lane
//! - Dead-letter lists for exhausted, unroutable, poisoned and faulting jobs
//! - Panic capture with a recovery listener receiving the stack trace
//! - Graceful shutdown returning undelivered jobs to their lists
//!
//! # Example
//!
//! ```rust,no_run
//! use dispatch_q::{Dispatcher, DispatcherConfig, QueueHandler, QueuePayload, QueueResult};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! pub struct ResizeImage;
//!
//! #[async_trait]
//! impl QueueHandler for ResizeImage {
//!     async fn execute(&self, payload: &QueuePayload) -> QueueResult {
//!         match payload.body["url"].as_str() {
//!             Some(url) => QueueResult::ok(format!("resized {url}")),
//!             None => QueueResult::fail("missing url"),
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DispatcherConfig::load()?;
//!     let mut dispatcher = Dispatcher::builder().config(config).build().await?;
//!
//!     dispatcher.register_handler("images", "thumbnails", Arc::new(ResizeImage))?;
//!     dispatcher.register_on_recovery(|trace| eprintln!("handler panicked:\n{trace}"));
//!
//!     let mut job = dispatcher
//!         .payload("images", serde_json::json!({"url": "https://example.com/a.png"}))
//!         .group("thumbnails");
//!     dispatcher.enqueue(&mut job).await?;
//!
//!     // Runs until Ctrl+C or SIGTERM
//!     dispatcher.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod job;
pub mod queue;
pub mod runner;

// Re-export main types for easy access
pub use crate::config::DispatcherConfig;
pub use crate::job::handler::{HandlerRegistry, QueueHandler, RecoveryListener};
pub use crate::job::job::{QueueKey, QueuePayload, QueueResult, DEFAULT_MAX_RETRY};
pub use crate::queue::queue::{DeadLetterEntry, DeadLetterReason, JobQueue};
pub use crate::queue::redis::{RedisConfig, RedisStore};
pub use crate::queue::store::{MemoryStore, QueueStore};
pub use crate::runner::error::QueueError;
pub use crate::runner::handoff::Handoff;
pub use crate::runner::recovery::ExecutionFault;
pub use crate::runner::runner::{
    Dispatcher, DispatcherBuilder, DispatcherHandle, MetricsSink, NoopMetrics,
};

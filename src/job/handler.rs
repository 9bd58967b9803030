use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::job::{QueueKey, QueuePayload, QueueResult};
use crate::runner::error::QueueError;

/// Trait that all job handlers must implement.
///
/// A failed run is reported through [`QueueResult::success`] and sends the job
/// down the retry path. Panics are caught by the worker and reported to the
/// recovery listener.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn execute(&self, payload: &QueuePayload) -> QueueResult;
}

/// Callback receiving the captured stack trace of a handler panic.
pub type RecoveryListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Maps a (topic, group) pair to the handler executing its jobs.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn QueueHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for the pair, replacing any previous one.
    pub fn register(
        &mut self,
        topic: &str,
        group: &str,
        handler: Arc<dyn QueueHandler>,
    ) -> Result<Option<Arc<dyn QueueHandler>>, QueueError> {
        QueueKey::validate(topic)?;
        Ok(self
            .handlers
            .insert((topic.to_string(), group.to_string()), handler))
    }

    pub fn get(&self, topic: &str, group: &str) -> Option<Arc<dyn QueueHandler>> {
        self.handlers
            .get(&(topic.to_string(), group.to_string()))
            .cloned()
    }

    /// Registered (topic, group) pairs, sorted.
    pub fn keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

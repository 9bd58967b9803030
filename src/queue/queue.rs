use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::store::QueueStore;
use crate::job::job::{QueueKey, QueuePayload};
use crate::runner::error::QueueError;

/// Why a job ended up on a dead-letter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Failed on every attempt the retry budget allowed.
    RetriesExhausted,
    /// No handler registered for its (topic, group).
    Unroutable,
    /// The handler panicked on the job twice.
    Fault,
    /// Stored bytes did not parse as a payload.
    Poisoned,
}

/// Record written to `DeadLetter_<queue key>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub key: String,
    pub reason: DeadLetterReason,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<QueuePayload>,
    /// Original entry when it could not be parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

/// Job-level operations over a [`QueueStore`], addressed by (topic, group).
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn QueueStore>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Depth of the (topic, group) list.
    ///
    /// A store failure is returned as an error rather than a zero depth so
    /// callers can tell "empty" from "unknown".
    pub async fn length(&self, topic: &str, group: &str) -> Result<u64, QueueError> {
        self.store.len(QueueKey::new(topic, group).as_str()).await
    }

    /// Removes and returns the head job.
    ///
    /// Fails with `NotFound` when the list is empty and `Deserialize` when the
    /// head entry is not a valid payload. The poisoned entry is already removed
    /// from the list in that case and travels inside the error.
    pub async fn pop(&self, topic: &str, group: &str) -> Result<QueuePayload, QueueError> {
        let key = QueueKey::new(topic, group);
        let entry = self
            .store
            .pop_front(key.as_str())
            .await?
            .ok_or_else(|| QueueError::NotFound(key.to_string()))?;

        serde_json::from_str(&entry).map_err(|source| QueueError::Deserialize {
            key: key.to_string(),
            entry,
            source,
        })
    }

    /// Assigns a fresh id to `payload` and appends it to the tail of its list.
    ///
    /// Rejects an invalid topic without touching the store or the payload.
    pub async fn push(&self, payload: &mut QueuePayload) -> Result<(), QueueError> {
        QueueKey::validate(&payload.topic)?;
        payload.assign_id();

        let key = payload.key();
        let entry = serde_json::to_string(payload)?;
        self.store.push_back(key.as_str(), entry).await?;

        debug!(job_id = %payload.id, key = %key, "Job enqueued");
        Ok(())
    }

    /// Returns a job to the head of its list, keeping its id and retry count.
    pub async fn restore(&self, payload: &QueuePayload) -> Result<(), QueueError> {
        self.restore_to(&payload.key(), payload).await
    }

    /// Returns a job to the head of `key`, the list it was popped from.
    pub async fn restore_to(&self, key: &QueueKey, payload: &QueuePayload) -> Result<(), QueueError> {
        let entry = serde_json::to_string(payload)?;
        self.store.push_front(key.as_str(), entry).await?;

        info!(job_id = %payload.id, key = %key, retry = payload.retry, "Job returned to queue");
        Ok(())
    }

    /// Records a job that will not be executed again.
    pub async fn dead_letter(
        &self,
        payload: &QueuePayload,
        reason: DeadLetterReason,
        message: impl Into<String>,
    ) -> Result<(), QueueError> {
        self.dead_letter_to(&payload.key(), payload, reason, message)
            .await
    }

    /// Records a job on the dead-letter list paired with `key`, which may
    /// differ from the payload's own key when the job sat on the wrong list.
    pub async fn dead_letter_to(
        &self,
        key: &QueueKey,
        payload: &QueuePayload,
        reason: DeadLetterReason,
        message: impl Into<String>,
    ) -> Result<(), QueueError> {
        let entry = DeadLetterEntry {
            key: key.to_string(),
            reason,
            message: message.into(),
            payload: Some(payload.clone()),
            raw: None,
            failed_at: chrono::Utc::now(),
        };
        self.store
            .push_back(&key.dead_letter(), serde_json::to_string(&entry)?)
            .await?;

        error!(job_id = %payload.id, key = %key, ?reason, retry = payload.retry, "Job moved to dead letter queue");
        Ok(())
    }

    /// Records a stored entry that could not be parsed.
    pub async fn dead_letter_raw(
        &self,
        topic: &str,
        group: &str,
        raw: String,
        message: impl Into<String>,
    ) -> Result<(), QueueError> {
        let key = QueueKey::new(topic, group);
        let entry = DeadLetterEntry {
            key: key.to_string(),
            reason: DeadLetterReason::Poisoned,
            message: message.into(),
            payload: None,
            raw: Some(raw),
            failed_at: chrono::Utc::now(),
        };
        self.store
            .push_back(&key.dead_letter(), serde_json::to_string(&entry)?)
            .await?;

        error!(key = %key, "Poisoned entry moved to dead letter queue");
        Ok(())
    }

    pub async fn dead_letter_len(&self, topic: &str, group: &str) -> Result<u64, QueueError> {
        self.store
            .len(&QueueKey::new(topic, group).dead_letter())
            .await
    }

    /// Removes and returns the oldest dead-letter entry, if any.
    pub async fn pop_dead_letter(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Option<DeadLetterEntry>, QueueError> {
        let key = QueueKey::new(topic, group).dead_letter();
        match self.store.pop_front(&key).await? {
            Some(entry) => Ok(Some(serde_json::from_str(&entry)?)),
            None => Ok(None),
        }
    }
}

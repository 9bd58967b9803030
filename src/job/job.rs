use crate::runner::error::QueueError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Retry budget given to payloads built with [`QueuePayload::new`].
pub const DEFAULT_MAX_RETRY: u32 = 3;

const KEY_PREFIX: &str = "Queue_";
const KEY_SEPARATOR: &str = "::";
const DEAD_LETTER_PREFIX: &str = "DeadLetter_";

/// Name of the durable list backing a (topic, group) pair.
///
/// `Queue_<topic>::<group>`, or `Queue_<topic>` when the group is empty. Topics
/// containing `:` are refused by [`QueueKey::validate`], so the first `::` in a
/// key always marks the end of the topic and two pairs never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey(String);

impl QueueKey {
    pub fn new(topic: &str, group: &str) -> Self {
        if group.is_empty() {
            Self(format!("{KEY_PREFIX}{topic}"))
        } else {
            Self(format!("{KEY_PREFIX}{topic}{KEY_SEPARATOR}{group}"))
        }
    }

    /// Checks that `topic` can be used to build a key.
    pub fn validate(topic: &str) -> Result<(), QueueError> {
        if topic.is_empty() {
            return Err(QueueError::Validation("topic can not be empty".to_string()));
        }
        if topic.contains(':') {
            return Err(QueueError::Validation(format!(
                "topic {topic:?} can not contain ':'"
            )));
        }
        Ok(())
    }

    /// Key of the dead-letter list paired with this queue.
    pub fn dead_letter(&self) -> String {
        format!("{DEAD_LETTER_PREFIX}{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueueKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The unit of work moved through the dispatcher.
///
/// Serialized as a JSON object when stored in the durable queue. `id` is empty
/// until the payload is pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub is_fast: bool,
    pub topic: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub max_retry: u32,
    #[serde(default)]
    pub retry: u32,
}

impl QueuePayload {
    pub fn new(topic: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: String::new(),
            is_fast: true,
            topic: topic.into(),
            group: String::new(),
            body,
            max_retry: DEFAULT_MAX_RETRY,
            retry: 0,
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn key(&self) -> QueueKey {
        QueueKey::new(&self.topic, &self.group)
    }

    /// Assigns a fresh identifier, replacing any previous one.
    pub(crate) fn assign_id(&mut self) {
        self.id = Uuid::new_v4().to_string();
    }

    /// True while another fallback attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry < self.max_retry
    }
}

/// Outcome of one handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl QueueResult {
    pub fn new(success: bool, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success,
            message: message.into(),
            data,
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(true, message, serde_json::Value::Null)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(false, message, serde_json::Value::Null)
    }
}

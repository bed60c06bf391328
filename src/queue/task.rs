//! Task payloads and their wire format.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KvflowError, Result};

/// A unit of work.
///
/// Encoded as JSON: `{"id": "task-...", "work": "..."}`. A `payload` field
/// is accepted in place of `work` when decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "work", alias = "payload")]
    pub payload: String,
}

impl Task {
    /// Create a task with a fresh unique id.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            id: format!("task-{}", Uuid::new_v4()),
            payload: payload.into(),
        }
    }

    pub fn with_id(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| KvflowError::MalformedTask {
            raw: self.id.clone(),
            reason: e.to_string(),
        })
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| KvflowError::MalformedTask {
            raw: raw.to_string(),
            reason: e.to_string(),
        })
    }
}

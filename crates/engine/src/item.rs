//! Items and per-item outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Field the worker contract uses to identify an item inside its payload
pub const ITEM_ID_FIELD: &str = "itemId";

/// A single unit of work submitted as part of a batch
///
/// Items are immutable once submitted. The payload is handed to the worker
/// as-is; the engine only looks at `item_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub item_id: String,
    pub payload: serde_json::Value,
}

impl Item {
    /// Create an item with an explicit id
    pub fn new(item_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            item_id: item_id.into(),
            payload,
        }
    }

    /// Create an item from a raw JSON payload
    ///
    /// Uses the payload's `itemId` field when it is a string or number,
    /// otherwise generates a UUID v7 id.
    pub fn from_json(payload: serde_json::Value) -> Self {
        let item_id = match payload.get(ITEM_ID_FIELD) {
            Some(serde_json::Value::String(id)) => id.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => Uuid::now_v7().to_string(),
        };
        Self { item_id, payload }
    }
}

/// Build items from a JSON document
///
/// Accepts either a bare array or an object with an `items` array.
/// Returns `None` when neither shape is present.
pub fn items_from_json(document: &serde_json::Value) -> Option<Vec<Item>> {
    let array = match document {
        serde_json::Value::Array(values) => values,
        serde_json::Value::Object(map) => map.get("items")?.as_array()?,
        _ => return None,
    };
    Some(array.iter().cloned().map(Item::from_json).collect())
}

/// Classification of an item failure
///
/// `ServiceException` and `TooManyRequests` are the transient kinds the
/// default retry policy retries; `WorkerError` covers business and runtime
/// failures reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    WorkerError,
    ServiceException,
    TooManyRequests,
    Timeout,
}

impl ErrorKind {
    /// Whether this kind represents a transient service-side condition
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ServiceException | Self::TooManyRequests)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkerError => write!(f, "worker_error"),
            Self::ServiceException => write!(f, "service_exception"),
            Self::TooManyRequests => write!(f, "too_many_requests"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Outcome of processing one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemResult {
    #[serde(rename_all = "camelCase")]
    Success {
        item_id: String,
        payload: serde_json::Value,
        processing_time_ms: u64,
        processed_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Failure {
        item_id: String,
        error_kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
        occurred_at: DateTime<Utc>,
    },
}

impl ItemResult {
    pub fn success(
        item_id: impl Into<String>,
        payload: serde_json::Value,
        processing_time_ms: u64,
    ) -> Self {
        Self::Success {
            item_id: item_id.into(),
            payload,
            processing_time_ms,
            processed_at: Utc::now(),
        }
    }

    pub fn failure(
        item_id: impl Into<String>,
        error_kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::failure_with_details(item_id, error_kind, message, None)
    }

    /// Failure carrying the worker's structured error details
    pub fn failure_with_details(
        item_id: impl Into<String>,
        error_kind: ErrorKind,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self::Failure {
            item_id: item_id.into(),
            error_kind,
            message: message.into(),
            details,
            occurred_at: Utc::now(),
        }
    }

    pub fn item_id(&self) -> &str {
        match self {
            Self::Success { item_id, .. } | Self::Failure { item_id, .. } => item_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    /// Error kind of a failure, `None` for successes
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Failure { error_kind, .. } => Some(*error_kind),
            Self::Success { .. } => None,
        }
    }

    /// Worker-supplied details of a failure
    pub fn details(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Failure { details, .. } => details.as_ref(),
            Self::Success { .. } => None,
        }
    }
}

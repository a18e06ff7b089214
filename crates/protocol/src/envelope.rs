//! Message envelopes for the worker channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id for one call on a channel.
///
/// Ids are allocated from a monotonically increasing per-farm counter for
/// task calls, and from a per-channel counter for bidirectional calls. An id
/// must not be reused while a call with that id is outstanding on the same
/// channel; the two directions have independent namespaces, so the same
/// numeric id may legitimately be in flight in both at once.
pub type CallId = u64;

/// Broad classification of a failure carried across the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The executed side (task module or coordinator handler) reported a failure.
    Task,
    /// A bidirectional request named an unregistered handler.
    HandlerNotFound,
    /// The message stream violated the protocol contract.
    Protocol,
}

/// Failure payload carried inside a response envelope when the executing side
/// failed instead of returning a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorPayload {
    /// Create a task-failure payload.
    pub fn task(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Task,
            message: message.into(),
        }
    }

    /// Create a handler-not-found payload. The message is the handler name.
    pub fn handler_not_found(handler: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::HandlerNotFound,
            message: handler.into(),
        }
    }
}

/// One message on a worker channel.
///
/// The variant doubles as the protocol's direction discriminant: requests
/// carry arguments, responses carry either a result or an error payload,
/// never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Coordinator -> worker bootstrap: which task module to load and the
    /// farm's initialization payload, sent exactly once before any call.
    Init { module: String, payload: Value },

    /// Worker -> coordinator: module loaded and initialized, calls may flow.
    Ready { pid: u32 },

    /// Coordinator -> worker task dispatch.
    TaskRequest { id: CallId, args: Value },

    /// Worker -> coordinator task completion.
    TaskResponse {
        id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },

    /// Worker -> coordinator bidirectional call against a registered handler.
    CallRequest {
        id: CallId,
        handler: String,
        args: Value,
    },

    /// Coordinator -> worker bidirectional call completion, answered on the
    /// same channel the request arrived on.
    CallResponse {
        id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },

    /// Coordinator -> worker: finish up and exit.
    Shutdown,
}

impl Envelope {
    /// Build a successful task response.
    pub fn task_ok(id: CallId, result: Value) -> Self {
        Envelope::TaskResponse {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build a failed task response.
    pub fn task_err(id: CallId, error: ErrorPayload) -> Self {
        Envelope::TaskResponse {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Build a successful bidirectional response.
    pub fn call_ok(id: CallId, result: Value) -> Self {
        Envelope::CallResponse {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build a failed bidirectional response.
    pub fn call_err(id: CallId, error: ErrorPayload) -> Self {
        Envelope::CallResponse {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Collapse a response's `result`/`error` pair into a `Result`.
///
/// A response carrying neither field is treated as a null result; one
/// carrying both resolves in favor of the error.
pub fn response_outcome(
    result: Option<Value>,
    error: Option<ErrorPayload>,
) -> Result<Value, ErrorPayload> {
    match error {
        Some(err) => Err(err),
        None => Ok(result.unwrap_or(Value::Null)),
    }
}

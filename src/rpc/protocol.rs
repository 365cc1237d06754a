//! JSON-RPC 2.0 message types.
//!
//! See: https://www.jsonrpc.org/specification

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::FlashError;

const VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;

/// Unknown job id.
pub const JOB_NOT_FOUND: i32 = -32000;
/// A job or device operation failed; `data.kind` carries the error kind.
pub const OPERATION_FAILED: i32 = -32001;

/// Method of the notifications pushed on a `jobs.subscribe` connection.
pub const JOB_UPDATE: &str = "jobs.update";

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Absent on notifications, which get no response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl Request {
    pub fn new(method: &str, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.to_string(),
            params,
            id: Some(id.into()),
        }
    }

    /// Reject requests the dispatcher must not see.
    pub fn check(&self) -> Result<(), RpcError> {
        let reason = if self.jsonrpc != VERSION {
            "jsonrpc must be \"2.0\""
        } else if self.method.is_empty() {
            "method must not be empty"
        } else {
            return Ok(());
        };
        Err(RpcError::new(INVALID_REQUEST, format!("Invalid request: {reason}")))
    }

    pub fn expects_reply(&self) -> bool {
        self.id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = Some(to_value(data));
        self
    }
}

impl From<&FlashError> for RpcError {
    fn from(err: &FlashError) -> Self {
        RpcError::new(OPERATION_FAILED, err.to_string()).with_data(json!({ "kind": err.kind() }))
    }
}

/// Exactly one of `result` or `error` is present on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub id: Value,
}

impl Response {
    fn new(id: Value, outcome: Outcome) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            outcome,
            id,
        }
    }

    pub fn success(id: Value, result: impl Serialize) -> Self {
        Self::new(id, Outcome::Result(to_value(result)))
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self::new(id, Outcome::Error(error))
    }

    /// The request could not be read, so its id is unknown.
    pub fn parse_error(details: impl std::fmt::Display) -> Self {
        Self::failure(
            Value::Null,
            RpcError::new(PARSE_ERROR, format!("Parse error: {details}")),
        )
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::failure(
            id,
            RpcError::new(METHOD_NOT_FOUND, format!("Unknown method {method}")),
        )
    }

    pub fn invalid_params(id: Value, details: impl Into<String>) -> Self {
        Self::failure(id, RpcError::new(INVALID_PARAMS, details))
    }

    pub fn job_not_found(id: Value, job_id: &str) -> Self {
        Self::failure(id, RpcError::new(JOB_NOT_FOUND, format!("No job {job_id}")))
    }

    pub fn flash_error(id: Value, err: &FlashError) -> Self {
        Self::failure(id, err.into())
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(error) => Err(error),
        }
    }
}

/// Server-initiated message, e.g. a job update on a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn new(method: &str, params: impl Serialize) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.to_string(),
            params: to_value(params),
        }
    }
}

/// A line from the server: either a response or a notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(Response),
    Notification(Notification),
}

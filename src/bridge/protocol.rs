//! Wire schema of cross-boundary calls.
//!
//! Every message has the shape
//! `{"type": string, "args": {"id": number, "args"?: [...], "data"?: any, "error"?: {"message": string}}}`.
//! Replies carry at most one of `data` or `error`, and a `null` result may
//! arrive with neither. Requests carry `args.args`, which may be omitted when
//! there are no arguments.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One message on the bridge channel, request or reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeMessage {
    /// Operation name, shared by a request and its reply.
    #[serde(rename = "type")]
    pub kind: String,
    pub args: Envelope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlates a reply with its request.
    pub id: u64,
    /// Positional arguments of a request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    /// Result of a successful call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure of a call. Only the message crosses the boundary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
}

impl BridgeMessage {
    pub fn request(kind: impl Into<String>, id: u64, args: Vec<Value>) -> Self {
        Self {
            kind: kind.into(),
            args: Envelope {
                id,
                args: Some(args),
                data: None,
                error: None,
            },
        }
    }

    pub fn success(kind: impl Into<String>, id: u64, data: Value) -> Self {
        Self {
            kind: kind.into(),
            args: Envelope {
                id,
                args: None,
                data: Some(data),
                error: None,
            },
        }
    }

    pub fn failure(kind: impl Into<String>, id: u64, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            args: Envelope {
                id,
                args: None,
                data: None,
                error: Some(RemoteError {
                    message: message.into(),
                }),
            },
        }
    }

    pub fn id(&self) -> u64 {
        self.args.id
    }

    /// Whether this message carries arguments and no result, i.e. could only
    /// be a request.
    pub fn is_request(&self) -> bool {
        self.args.args.is_some() && !self.is_reply()
    }

    /// Whether this message carries a result branch.
    pub fn is_reply(&self) -> bool {
        self.args.data.is_some() || self.args.error.is_some()
    }

    /// Interpret a reply. A reply with neither branch resolves to `null`.
    pub fn into_outcome(self) -> Result<Value, String> {
        match self.args.error {
            Some(error) => Err(error.message),
            None => Ok(self.args.data.unwrap_or(Value::Null)),
        }
    }
}

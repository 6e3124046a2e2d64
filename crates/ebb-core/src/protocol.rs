//! Wire envelopes exchanged with the remote node.
//!
//! Every frame is a JSON text message. Requests carry `methodname`, optional
//! `args` and an optional `mirror` that the remote echoes back verbatim as
//! `reflection` on the matching response.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{
    ENVELOPE_VERSION, FAULT_TYPE, REQUEST_ID_KEY, REQUEST_TYPE, RESPONSE_TYPE, SEQUENCE_KEY,
    SERVICE_NAME,
};
use crate::error::ClientError;

/// An outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub servicename: String,
    pub methodname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<Value>,
}

impl Request {
    pub fn new(method: &str) -> Self {
        Self {
            kind: REQUEST_TYPE.to_string(),
            version: ENVELOPE_VERSION.to_string(),
            servicename: SERVICE_NAME.to_string(),
            methodname: method.to_string(),
            args: None,
            mirror: None,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_mirror(mut self, mirror: Value) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Parse a request frame (used by test doubles playing the remote side).
    pub fn parse(text: &str) -> Result<Self, ClientError> {
        serde_json::from_str(text).map_err(|e| ClientError::Protocol(format!("bad request frame: {e}")))
    }

    pub fn to_json(&self) -> Result<String, ClientError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Fault payload of a `jsonwsp/fault` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub string: String,
}

/// An inbound response or fault envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub servicename: String,
    pub methodname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<Value>,
}

impl Response {
    /// A successful response envelope.
    pub fn success(method: &str, result: Value) -> Self {
        Self {
            kind: RESPONSE_TYPE.to_string(),
            version: ENVELOPE_VERSION.to_string(),
            servicename: SERVICE_NAME.to_string(),
            methodname: method.to_string(),
            result: Some(result),
            fault: None,
            reflection: None,
        }
    }

    /// A fault envelope.
    pub fn fault(method: &str, code: &str, message: &str) -> Self {
        Self {
            kind: FAULT_TYPE.to_string(),
            result: None,
            fault: Some(Fault {
                code: code.to_string(),
                string: message.to_string(),
            }),
            ..Self::success(method, Value::Null)
        }
    }

    pub fn with_reflection(mut self, reflection: Option<Value>) -> Self {
        self.reflection = reflection;
        self
    }

    /// Decode an inbound frame. Anything that is not a JSON envelope with a
    /// `methodname` is a protocol error.
    pub fn parse(text: &str) -> Result<Self, ClientError> {
        serde_json::from_str(text).map_err(|e| ClientError::Protocol(format!("bad response frame: {e}")))
    }

    pub fn to_json(&self) -> Result<String, ClientError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_fault(&self) -> bool {
        self.kind == FAULT_TYPE || self.fault.is_some()
    }

    /// Request id echoed from the request's `mirror`.
    pub fn request_id(&self) -> Option<&str> {
        self.reflection.as_ref()?.get(REQUEST_ID_KEY)?.as_str()
    }

    /// Sequence number echoed from a `RequestNext` mirror.
    pub fn sequence(&self) -> Option<u64> {
        self.reflection.as_ref()?.get(SEQUENCE_KEY)?.as_u64()
    }

    /// Unwrap the result, turning faults and missing results into errors.
    pub fn into_result(self) -> Result<Value, ClientError> {
        if let Some(fault) = self.fault {
            return Err(ClientError::Fault {
                code: fault.code,
                message: fault.string,
            });
        }
        if self.kind == FAULT_TYPE {
            return Err(ClientError::Fault {
                code: String::new(),
                message: "fault without payload".to_string(),
            });
        }
        self.result
            .ok_or_else(|| ClientError::Protocol(format!("{} response without result", self.methodname)))
    }
}

/// Mirror object tagging a one-shot request.
pub fn request_id_mirror(id: &str) -> Value {
    let mut map = Map::new();
    map.insert(REQUEST_ID_KEY.to_string(), Value::String(id.to_string()));
    Value::Object(map)
}

/// Mirror object tagging a pipelined `RequestNext`.
pub fn sequence_mirror(sequence: u64) -> Value {
    let mut map = Map::new();
    map.insert(SEQUENCE_KEY.to_string(), Value::from(sequence));
    Value::Object(map)
}

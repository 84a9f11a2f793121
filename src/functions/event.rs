//! Lambda-compatible invocation payloads exchanged with function runtimes.

use crate::http::Body;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// The event a function is invoked with.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvocationEvent {
    pub path: String,
    pub http_method: String,
    pub query_string_parameters: BTreeMap<String, String>,
    pub multi_value_query_string_parameters: BTreeMap<String, Vec<String>>,
    pub headers: BTreeMap<String, String>,
    pub multi_value_headers: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub is_base64_encoded: bool,
    pub raw_url: String,
    pub raw_query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// Base64 JSON `{url, token}` for the blobs store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blobs: Option<String>,
}

/// Caller identity handed to the function next to the event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

impl ClientContext {
    pub fn is_empty(&self) -> bool {
        self.identity.is_none() && self.user.is_none() && self.custom.is_none()
    }
}

/// Error raised while building or invoking a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationError {
    pub error_type: String,
    pub error_message: String,
    #[serde(default)]
    pub stack_trace: Vec<String>,
}

impl InvocationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_type("Error", message)
    }

    pub fn with_type(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: message.into(),
            stack_trace: Vec::new(),
        }
    }

    /// Attach stack frames.
    pub fn stack(mut self, frames: Vec<String>) -> Self {
        self.stack_trace = frames;
        self
    }
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error_message)
    }
}

impl std::error::Error for InvocationError {}

impl From<std::io::Error> for InvocationError {
    fn from(err: std::io::Error) -> Self {
        InvocationError::with_type("IOError", err.to_string())
    }
}

impl From<serde_json::Error> for InvocationError {
    fn from(err: serde_json::Error) -> Self {
        InvocationError::with_type("SyntaxError", err.to_string())
    }
}

/// Body of a function response.
pub enum LambdaBody {
    Text(String),
    Stream(Body),
    /// Anything else a runtime returned; rejected when the response is validated.
    Other(Value),
}

impl fmt::Debug for LambdaBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LambdaBody::Text(text) => f.debug_tuple("Text").field(text).finish(),
            LambdaBody::Stream(_) => f.write_str("Stream(..)"),
            LambdaBody::Other(value) => f.debug_tuple("Other").field(value).finish(),
        }
    }
}

/// What a function returned.
#[derive(Debug, Default)]
pub struct LambdaResponse {
    /// Raw status code, validated before use.
    pub status_code: Value,
    pub headers: BTreeMap<String, Value>,
    pub multi_value_headers: BTreeMap<String, Value>,
    pub body: Option<LambdaBody>,
    pub is_base64_encoded: bool,
    pub metadata: Option<Value>,
}

impl LambdaResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status_code: Value::from(status),
            ..Default::default()
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(LambdaBody::Text(body.into()));
        self
    }

    pub fn stream(mut self, body: Body) -> Self {
        self.body = Some(LambdaBody::Stream(body));
        self
    }

    /// Read a response from the JSON object a runtime produced.
    pub fn from_value(value: Value) -> Result<Self, InvocationError> {
        let Value::Object(mut object) = value else {
            return Err(InvocationError::new(format!(
                "Your function response must be an object. You gave: {}",
                value
            )));
        };

        let mut take_map = |key: &str| -> BTreeMap<String, Value> {
            match object.remove(key) {
                Some(Value::Object(map)) => map.into_iter().collect(),
                _ => BTreeMap::new(),
            }
        };
        let headers = take_map("headers");
        let multi_value_headers = take_map("multiValueHeaders");

        let body = match object.remove("body") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(LambdaBody::Text(text)),
            Some(other) => Some(LambdaBody::Other(other)),
        };

        Ok(Self {
            status_code: object.remove("statusCode").unwrap_or(Value::Null),
            headers,
            multi_value_headers,
            body,
            is_base64_encoded: object
                .remove("isBase64Encoded")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            metadata: object.remove("metadata").filter(|v| !v.is_null()),
        })
    }

    /// The status code if it is a usable number.
    pub fn status(&self) -> Option<u16> {
        match &self.status_code {
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .filter(|code| *code != 0)
    }

    /// Whether the function flagged itself as an on-demand builder.
    pub fn is_builder(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("builder_function"))
            .map_or(false, |flag| match flag {
                Value::Bool(b) => *b,
                Value::Null => false,
                _ => true,
            })
    }

    /// Keys of the response besides `statusCode` that were actually set.
    pub fn extra_keys(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if !self.headers.is_empty() {
            keys.push("headers");
        }
        if !self.multi_value_headers.is_empty() {
            keys.push("multiValueHeaders");
        }
        if self.body.is_some() {
            keys.push("body");
        }
        if self.is_base64_encoded {
            keys.push("isBase64Encoded");
        }
        if self.metadata.is_some() {
            keys.push("metadata");
        }
        keys
    }
}

/// Collapse multi-valued entries into the single-value map, joining with `", "`.
pub fn join_values(multi: &BTreeMap<String, Vec<String>>) -> BTreeMap<String, String> {
    multi
        .iter()
        .map(|(key, values)| (key.clone(), values.join(", ")))
        .collect()
}

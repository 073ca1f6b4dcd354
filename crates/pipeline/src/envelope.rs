//! Success-path envelope decoding
//!
//! The backend answers successful calls in three shapes, decoded once here:
//! - `{"data": X, "message"?: M}`: unwrap to X, keep M on the side
//! - `{"data": null, "message": M, "error": CODE}`: a business error in a 2xx
//! - anything else: the raw payload, passed through untouched

use std::ops::Deref;

use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::ApiError;

/// A decoded success body.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Data { data: Value, message: Option<String> },
    Business { code: String, message: Option<String> },
    Raw(Value),
}

impl Envelope {
    pub fn decode(value: Value) -> Self {
        let mut map = match value {
            Value::Object(map) => map,
            other => return Envelope::Raw(other),
        };

        if let Some(error) = map.get("error").filter(|e| !e.is_null()) {
            let code = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Envelope::Business {
                code,
                message: string_field(&map, "message"),
            };
        }

        if let Some(data) = map.remove("data") {
            return Envelope::Data {
                data,
                message: string_field(&map, "message"),
            };
        }

        Envelope::Raw(Value::Object(map))
    }

    /// Turn the envelope into the caller-facing result.
    pub fn into_response(self, status: u16, request_path: &str) -> Result<ApiResponse<Value>, ApiError> {
        match self {
            Envelope::Data { data, message } => Ok(ApiResponse { data, message }),
            Envelope::Raw(data) => Ok(ApiResponse {
                data,
                message: None,
            }),
            Envelope::Business { code, message } => {
                Err(ApiError::business(code, message, status, request_path))
            }
        }
    }
}

fn string_field(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// An unwrapped payload plus the backend's optional success message.
///
/// Derefs to the payload and serializes as exactly the payload: the message
/// is a side channel for toasts and never leaks into re-serialized data.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    data: T,
    message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T, message: Option<String>) -> Self {
        Self { data, message }
    }

    /// Success message that accompanied the payload, if any.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn into_inner(self) -> T {
        self.data
    }
}

impl ApiResponse<Value> {
    /// Deserialize the payload into a caller type, keeping the message.
    pub fn deserialize<T: DeserializeOwned>(self) -> Result<ApiResponse<T>, ApiError> {
        let data = serde_json::from_value(self.data).map_err(|e| ApiError::decode(e, None))?;
        Ok(ApiResponse {
            data,
            message: self.message,
        })
    }
}

impl<T> Deref for ApiResponse<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T: Serialize> Serialize for ApiResponse<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}

//! The response envelope shared by both transports:
//! `{code, message, data?, trace_id?}`.
//!
//! `code` is `0` on success and mirrors the HTTP status for failures, on
//! RPC as well: equivalent failure conditions produce identical
//! `{code, message}` pairs on both transports.

use serde::{Deserialize, Serialize};
use trellis_core::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Envelope {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            code: 0,
            message: "OK".to_string(),
            data: Some(data),
            trace_id: None,
        }
    }

    pub fn failure(error: &Error, trace_id: Option<&str>) -> Self {
        Self {
            code: error.kind().http_status() as i64,
            message: error.message().to_string(),
            data: None,
            trace_id: trace_id.map(str::to_string),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

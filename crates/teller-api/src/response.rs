//! Response envelope shared by the HTTP surfaces and their clients

use serde::{Deserialize, Serialize};
use teller_common::{ErrorCode, TellerError, error::SUCCESS};

/// REST API result envelope: `{ code, message, data }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestResult<T> {
    pub code: i32,
    pub message: Option<String>,
    pub data: Option<T>,
}

impl<T> RestResult<T> {
    /// Create a successful result with data
    pub fn ok(data: T) -> Self {
        RestResult {
            code: SUCCESS.code,
            message: Some(SUCCESS.message.to_string()),
            data: Some(data),
        }
    }

    /// Create an error result
    pub fn err(code: ErrorCode<'_>, message: impl Into<String>) -> Self {
        RestResult {
            code: code.code,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn from_error(error: &TellerError) -> Self {
        Self::err(error.error_code(), error.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS.code
    }
}

//! Client error types

use teller_common::TellerError;
use teller_common::error::{NO_HEALTHY_INSTANCE, RESOURCE_NOT_FOUND, UNKNOWN_INSTANCE};

/// Error type for discovery and config client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned error: code={code}, message={message}")]
    ServerError { code: i32, message: String },

    #[error("registry error: {0}")]
    Registry(#[from] TellerError),

    #[error("request timeout")]
    Timeout,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// The registry no longer knows the instance; the caller must re-register.
    pub fn is_unknown_instance(&self) -> bool {
        match self {
            ClientError::Registry(TellerError::UnknownInstance(_)) => true,
            ClientError::ServerError { code, .. } => *code == UNKNOWN_INSTANCE.code,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::Registry(TellerError::NotFound(_)) => true,
            ClientError::ServerError { code, .. } => *code == RESOURCE_NOT_FOUND.code,
            _ => false,
        }
    }

    /// Timeouts and connection-level failures; worth another attempt later.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Timeout => true,
            ClientError::Http(e) => e.is_connect() || e.is_timeout(),
            ClientError::Registry(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<ClientError> for TellerError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Registry(e) => e,
            ClientError::Timeout => TellerError::Timeout("registry request timed out".to_string()),
            ClientError::ServerError { code, message } if code == NO_HEALTHY_INSTANCE.code => {
                TellerError::NoHealthyInstance(message)
            }
            ClientError::ServerError { code, message } if code == UNKNOWN_INSTANCE.code => {
                TellerError::UnknownInstance(message)
            }
            ClientError::ServerError { code, message } if code == RESOURCE_NOT_FOUND.code => {
                TellerError::NotFound(message)
            }
            other => TellerError::Transport(other.to_string()),
        }
    }
}

//! Error types and error codes for Teller
//!
//! This module defines:
//! - `TellerError`: domain error enum shared by every component
//! - `ErrorCode`: structured error codes for API responses

use serde::{Deserialize, Serialize};

/// Domain errors raised by the registry, config provider and gateway.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TellerError {
    #[error("instance {host}:{port} of service '{service}' is already registered and UP")]
    DuplicateInstance {
        service: String,
        host: String,
        port: u16,
    },

    #[error("instance '{0}' is not registered")]
    UnknownInstance(String),

    #[error("no healthy instance of service '{0}'")]
    NoHealthyInstance(String),

    #[error("circuit for route '{0}' is open")]
    CircuitOpen(String),

    #[error("service '{service}' unavailable after {attempts} attempt(s): {reason}")]
    UpstreamUnavailable {
        service: String,
        attempts: u32,
        reason: String,
    },

    #[error("version {version} of {service}/{profile} is not newer than current version {current}")]
    StaleVersion {
        service: String,
        profile: String,
        version: u64,
        current: u64,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("no route matches path '{0}'")]
    RouteNotFound(String),

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("rate limit exceeded for '{0}'")]
    RateLimited(String),

    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TellerError>;

impl TellerError {
    /// Whether a caller may retry the operation within its local budget.
    ///
    /// Structural errors and fail-fast signals are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TellerError::Timeout(_) | TellerError::Transport(_))
    }

    /// HTTP status used when the error crosses an HTTP surface.
    pub fn status_code(&self) -> u16 {
        match self {
            TellerError::DuplicateInstance { .. } => 409,
            TellerError::StaleVersion { .. } => 409,
            TellerError::UnknownInstance(_) => 404,
            TellerError::NotFound(_) => 404,
            TellerError::RouteNotFound(_) => 404,
            TellerError::NoHealthyInstance(_) => 503,
            TellerError::CircuitOpen(_) => 503,
            TellerError::UpstreamUnavailable { .. } => 502,
            TellerError::Unauthorized(_) => 401,
            TellerError::AccessDenied(_) => 403,
            TellerError::RateLimited(_) => 429,
            TellerError::IllegalArgument(_) => 400,
            TellerError::Timeout(_) => 504,
            TellerError::Storage(_) => 500,
            TellerError::Transport(_) => 502,
            TellerError::Internal(_) => 500,
        }
    }

    /// Stable error code for response envelopes.
    pub fn error_code(&self) -> ErrorCode<'static> {
        match self {
            TellerError::DuplicateInstance { .. } => DUPLICATE_INSTANCE,
            TellerError::UnknownInstance(_) => UNKNOWN_INSTANCE,
            TellerError::NoHealthyInstance(_) => NO_HEALTHY_INSTANCE,
            TellerError::CircuitOpen(_) => CIRCUIT_OPEN,
            TellerError::UpstreamUnavailable { .. } => UPSTREAM_UNAVAILABLE,
            TellerError::StaleVersion { .. } => STALE_VERSION,
            TellerError::NotFound(_) => RESOURCE_NOT_FOUND,
            TellerError::RouteNotFound(_) => ROUTE_NOT_FOUND,
            TellerError::Unauthorized(_) => AUTHENTICATION_FAILED,
            TellerError::AccessDenied(_) => ACCESS_DENIED,
            TellerError::RateLimited(_) => RATE_LIMITED,
            TellerError::IllegalArgument(_) => PARAMETER_VALIDATE_ERROR,
            TellerError::Timeout(_) => REQUEST_TIMEOUT,
            TellerError::Storage(_) => DATA_ACCESS_ERROR,
            TellerError::Transport(_) => SERVER_ERROR,
            TellerError::Internal(_) => SERVER_ERROR,
        }
    }
}

/// Error code structure for API responses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub name: &'a str,
    pub message: &'a str,
}

pub const SUCCESS: ErrorCode<'static> = ErrorCode {
    code: 0,
    name: "SUCCESS",
    message: "success",
};

pub const PARAMETER_VALIDATE_ERROR: ErrorCode<'static> = ErrorCode {
    code: 10001,
    name: "PARAMETER_VALIDATE_ERROR",
    message: "parameter validate error",
};

pub const RESOURCE_NOT_FOUND: ErrorCode<'static> = ErrorCode {
    code: 10002,
    name: "NOT_FOUND",
    message: "resource not found",
};

pub const DATA_ACCESS_ERROR: ErrorCode<'static> = ErrorCode {
    code: 10003,
    name: "DATA_ACCESS_ERROR",
    message: "data access error",
};

pub const SERVER_ERROR: ErrorCode<'static> = ErrorCode {
    code: 10004,
    name: "SERVER_ERROR",
    message: "server error",
};

pub const REQUEST_TIMEOUT: ErrorCode<'static> = ErrorCode {
    code: 10005,
    name: "REQUEST_TIMEOUT",
    message: "request timeout",
};

// Registry errors
pub const DUPLICATE_INSTANCE: ErrorCode<'static> = ErrorCode {
    code: 20001,
    name: "DUPLICATE_INSTANCE",
    message: "instance already registered",
};

pub const UNKNOWN_INSTANCE: ErrorCode<'static> = ErrorCode {
    code: 20002,
    name: "UNKNOWN_INSTANCE",
    message: "instance not registered",
};

// Config errors
pub const STALE_VERSION: ErrorCode<'static> = ErrorCode {
    code: 21001,
    name: "STALE_VERSION",
    message: "config version is stale",
};

// Gateway errors
pub const NO_HEALTHY_INSTANCE: ErrorCode<'static> = ErrorCode {
    code: 22001,
    name: "NO_HEALTHY_INSTANCE",
    message: "no healthy instance",
};

pub const CIRCUIT_OPEN: ErrorCode<'static> = ErrorCode {
    code: 22002,
    name: "CIRCUIT_OPEN",
    message: "circuit open",
};

pub const UPSTREAM_UNAVAILABLE: ErrorCode<'static> = ErrorCode {
    code: 22003,
    name: "UPSTREAM_UNAVAILABLE",
    message: "upstream unavailable",
};

pub const ROUTE_NOT_FOUND: ErrorCode<'static> = ErrorCode {
    code: 22004,
    name: "ROUTE_NOT_FOUND",
    message: "route not found",
};

pub const AUTHENTICATION_FAILED: ErrorCode<'static> = ErrorCode {
    code: 23001,
    name: "AUTHENTICATION_FAILED",
    message: "authentication failed",
};

pub const ACCESS_DENIED: ErrorCode<'static> = ErrorCode {
    code: 23002,
    name: "ACCESS_DENIED",
    message: "access denied",
};

pub const RATE_LIMITED: ErrorCode<'static> = ErrorCode {
    code: 23003,
    name: "RATE_LIMITED",
    message: "rate limit exceeded",
};

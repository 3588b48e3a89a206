//! Application startup utilities shared by both binaries.

mod gateway;
mod http;
mod logging;

pub use gateway::{build_authorizer, gateway_server, run_rate_limit_cleanup};
pub use http::main_server;
pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};

// Teller server library: REST surface, configuration and startup helpers
// shared by the `teller-server` and `teller-gateway` binaries.

pub mod api; // REST handlers
pub mod error; // HTTP error mapping
pub mod model; // App state and configuration
pub mod service; // Background maintenance tasks
pub mod startup; // Logging and HTTP server setup

pub use error::AppError;
pub use model::common::AppState;
pub use model::config::{Cli, Configuration};

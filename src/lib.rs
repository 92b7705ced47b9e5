// Re-export modules for the CLI and the integration tests
pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod models;
pub mod sync;
pub mod timeline;
pub mod transport;
pub mod utils;

// Re-export main types for convenience
pub use api::{ApiError, HttpApi, RestApi};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use models::*;
pub use sync::{Command, Notice, SessionView, SyncSession};
pub use transport::{Connector, SocketIoConnector};

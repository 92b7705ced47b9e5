// Error taxonomy for the sync engine

use thiserror::Error;

use crate::api::ApiError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Identity fetch or channel authentication rejected; ends the session
    #[error("session expired: {0}")]
    AuthExpired(String),
    #[error("{operation} failed: {source}")]
    Network {
        operation: &'static str,
        #[source]
        source: ApiError,
    },
    #[error("channel error: {0}")]
    Channel(String),
    #[error("channel is not connected")]
    NotConnected,
    #[error("unknown peer {0}")]
    UnknownPeer(String),
}

impl SyncError {
    pub fn network(operation: &'static str, source: ApiError) -> Self {
        SyncError::Network { operation, source }
    }

    /// Whether this error ends the session
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::AuthExpired(_))
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

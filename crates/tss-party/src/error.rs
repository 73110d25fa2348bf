//! Error types for party engine operations

use crate::types::{PartyId, SessionKind};
use thiserror::Error;

/// Result type alias for party engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running a protocol session
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Invalid party set, threshold or missing setup step
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A session is already running on this engine
    #[error("Session already active: {0} in progress")]
    SessionConflict(SessionKind),

    /// The round processor reported a cryptographic or protocol failure
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The caller cancelled the session or its deadline expired
    #[error("Session cancelled: {0}")]
    Cancelled(String),

    /// A message referenced a party outside the configured set
    #[error("Unknown party: {0}")]
    Routing(PartyId),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error came from cancellation or a timeout
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<frost_secp256k1_tr::Error> for Error {
    fn from(e: frost_secp256k1_tr::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

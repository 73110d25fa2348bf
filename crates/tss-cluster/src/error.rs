//! Cluster harness errors

use thiserror::Error;
use tss_party::PartyId;

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// A party's engine call failed
    #[error("Party {party} failed: {source}")]
    Party {
        party: PartyId,
        #[source]
        source: tss_party::Error,
    },

    /// The cluster has no party with this id
    #[error("Unknown party: {0}")]
    UnknownParty(PartyId),

    /// A party task panicked or was aborted
    #[error("Party task failed: {0}")]
    Join(String),
}

impl ClusterError {
    /// Id of the failing party, when the failure came from an engine
    pub fn party(&self) -> Option<PartyId> {
        match self {
            ClusterError::Party { party, .. } => Some(*party),
            _ => None,
        }
    }

    /// Engine error behind the failure
    pub fn engine_error(&self) -> Option<&tss_party::Error> {
        match self {
            ClusterError::Party { source, .. } => Some(source),
            _ => None,
        }
    }
}

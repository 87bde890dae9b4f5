//! Error types for peerlock

use thiserror::Error;

use crate::message::PeerId;

/// Result type alias using peerlock's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Peerlock error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Config errors (E100-E199)
    #[error("Invalid configuration: '{field}' {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Membership errors (E200-E299)
    #[error("Peer id 0 is reserved for system messages and broadcast")]
    InvalidPeerId,

    #[error("Peer {0} is already registered")]
    DuplicatePeer(PeerId),

    #[error("Peer {0} not found. Run `stats` to see live peers.")]
    PeerNotFound(PeerId),

    #[error("Peer {id} task failed: {reason}")]
    PeerTaskFailed { id: PeerId, reason: String },
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "E100",
            Self::ConfigError(_) => "E101",
            Self::InvalidPeerId => "E200",
            Self::DuplicatePeer(_) => "E201",
            Self::PeerNotFound(_) => "E202",
            Self::PeerTaskFailed { .. } => "E203",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::InvalidConfig { field, .. } => {
                Some(format!("use a value of '{}' below {}", field, u32::MAX))
            }
            Self::PeerNotFound(_) => Some("stats".to_string()),
            _ => None,
        }
    }
}

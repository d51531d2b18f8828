//! Error types for bfdsyncd

use sonic_sai::SaiError;
use sonic_shm_arena::ArenaError;
use thiserror::Error;

use crate::packet::PacketError;

/// BFD daemon errors
#[derive(Error, Debug)]
pub enum BfdError {
    /// Another live session already uses the local discriminator
    #[error("BFD session already exists: {0}")]
    SessionExists(String),

    #[error("Invalid BFD config: {0}")]
    InvalidConfig(String),

    /// Session store failure, including stale handles and corrupted slots
    #[error("Session store error: {0}")]
    Arena(#[from] ArenaError),

    /// Hardware offload call failed
    #[error("Offload adapter failure: {0}")]
    AdapterFailure(#[from] SaiError),

    #[error("Malformed BFD packet: {0}")]
    Packet(#[from] PacketError),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The event intake loop has stopped and dropped its receivers
    #[error("Event intake channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BfdError {
    /// Returns true if the daemon cannot continue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BfdError::Arena(e) if e.is_terminal())
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, BfdError::Arena(e) if e.is_corruption())
    }

    /// Stale handle, unknown session or double remove.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BfdError::Arena(ArenaError::NotFound(_)) | BfdError::Arena(ArenaError::NotInUse(_))
        )
    }
}

/// Result type for bfdsyncd operations
pub type Result<T> = std::result::Result<T, BfdError>;

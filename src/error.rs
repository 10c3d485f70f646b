use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("network error talking to {endpoint}: {source}")]
    Network {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out talking to {0}")]
    Timeout(String),

    #[error("chunk {name} failed verification: expected {expected}, got {actual}")]
    Integrity {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("{endpoint} does not have {name}")]
    NotFound { endpoint: String, name: String },

    #[error("tracker at {addr} unavailable: {reason}")]
    TrackerUnavailable { addr: String, reason: String },

    #[error("tracker knows no peers other than this node")]
    NoPeers,

    #[error("no discovered peer could provide the manifest")]
    NoManifestSource,

    #[error("acquisition incomplete, missing chunk indices {missing:?}")]
    PartialAcquisition { missing: Vec<u32> },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SwarmError {
    pub fn network(endpoint: &str, source: io::Error) -> Self {
        SwarmError::Network {
            endpoint: endpoint.to_owned(),
            source,
        }
    }

    /// Errors that say something about the health of the remote peer.
    ///
    /// `NotFound` and `Integrity` are not: the peer answered, and what it
    /// lacks or holds corrupted is one chunk, not every chunk it offers.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            SwarmError::Network { .. } | SwarmError::Timeout(_) | SwarmError::Protocol(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;

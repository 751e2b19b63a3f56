//! Error types shared across the master's components.

use crate::config::ConfigError;
use shared::CodecError;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("unable to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Why a liveness probe did not confirm a server.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// The probe socket could not be set up; nothing was sent.
    #[error("local socket error: {0}")]
    Local(#[source] io::Error),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Failure talking to one federated master. Collected, never fatal to a poll.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("{peer}: unable to resolve address")]
    Unresolved { peer: String },
    #[error("{peer}: socket error: {source}")]
    Io {
        peer: String,
        #[source]
        source: io::Error,
    },
    #[error("{peer}: no response within {timeout:?}")]
    Timeout { peer: String, timeout: Duration },
    #[error("{peer}: {source}")]
    Codec {
        peer: String,
        #[source]
        source: CodecError,
    },
}

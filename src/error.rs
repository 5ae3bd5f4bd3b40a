//! # Error Taxonomy
//!
//! Typed errors for every failure class the client distinguishes, plus the
//! mapping from a terminal error to the process exit code.
//!
//! ## Propagation Rules
//!
//! - **Metainfo** errors abort before any peer activity (exit 1)
//! - **Tracker** errors abort only when no peers were obtained (exit 2)
//! - **Wire**, **PeerTimeout** and per-session **Io** errors terminate one
//!   session and are counted; the download continues
//! - Verification failures never surface here: the scheduler recovers them
//!   internally by resetting the piece, and only a counter records them
//! - **Io** errors on the output sink are fatal (exit 4)

use thiserror::Error;

/// Violations of the peer wire protocol, each terminating the session.
#[derive(Debug, Error)]
pub enum WireError {
    /// Remote handshake had a foreign protocol string or info hash.
    #[error("handshake mismatch")]
    HandshakeMismatch,

    /// A message frame was malformed (truncated payload, bad field size).
    #[error("framing violation: {0}")]
    FramingViolation(String),

    /// Declared frame length exceeds the protocol bound.
    #[error("oversize message: {0} bytes")]
    OversizeMessage(u32),

    /// A legal message arrived at an illegal point in the exchange.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Top-level error classes, mirroring the failure counters in the summary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("metainfo error: {0}")]
    Metainfo(String),

    #[error("tracker error: {0}")]
    Tracker(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    /// A peer stopped responding (request or idle timeout).
    #[error("peer timed out")]
    PeerTimeout,

    /// Every known peer failed or disconnected with pieces still missing.
    #[error("all peers exhausted before completion")]
    PeersExhausted,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Process exit code for a terminal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Metainfo(_) => 1,
            Error::Tracker(_) => 2,
            Error::Wire(_) | Error::PeerTimeout | Error::PeersExhausted => 3,
            Error::Io(_) => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_cli_contract() {
        assert_eq!(Error::Metainfo("bad".into()).exit_code(), 1);
        assert_eq!(Error::Tracker("down".into()).exit_code(), 2);
        assert_eq!(Error::Wire(WireError::HandshakeMismatch).exit_code(), 3);
        assert_eq!(Error::PeerTimeout.exit_code(), 3);
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.exit_code(), 4);
    }
}

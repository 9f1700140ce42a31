use std::io;

use crate::protocol::Packet;

/// Shorthand for results carrying a punchdrop [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can end a rendezvous, connection or transfer.
///
/// Every variant is terminal for the operation that produced it; the only
/// retry in the system is the bounded dial loop of the peer connector.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A payload or frame could not be decoded (or a value could not be
    /// encoded without breaking the wire format).
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A packet arrived that is not valid in the current protocol state.
    #[error("unexpected packet {0:?} (0x{code:02X})", code = u8::from(*.0))]
    UnexpectedPacket(Packet),

    /// The rendezvous service has no peer registered under this identifier.
    #[error("peer \"{0}\" not found")]
    PeerNotFound(String),

    /// The peer speaks a protocol version this build cannot talk to.
    #[error("incompatible peer: local protocol v{local}, peer protocol v{remote}")]
    IncompatiblePeer { local: u8, remote: u8 },

    /// The connection ended while a receive was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// The receiver's digest of the received bytes does not match the
    /// announced file hash.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// The receiver declined the transfer after reading the file info.
    #[error("transfer rejected by peer: {0}")]
    RejectedByPeer(String),

    /// The peer reported that we violated the protocol.
    #[error("peer reported a protocol error: {0}")]
    RemoteProtocol(String),

    /// The peer hit a local fault (disk, hashing, …) and aborted.
    #[error("peer reported an internal error: {0}")]
    RemoteInternal(String),

    /// The dial loop ran out of attempts.
    #[error("could not reach {addr} after {attempts} attempts: {last_error}")]
    ConnectExhausted {
        addr: String,
        attempts: u32,
        last_error: String,
    },

    /// The caller cancelled a pending wait.
    #[error("cancelled")]
    Cancelled,

    /// The underlying transport failed for a reason other than a clean close.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A local I/O or hashing failure.
    #[error("internal error: {0}")]
    Internal(#[from] io::Error),
}

impl Error {
    /// Wraps an `anyhow` transport error.
    pub fn transport(err: anyhow::Error) -> Self {
        Self::Transport(err.into())
    }

    /// Whether the peer should hear about this failure as an
    /// [`Packet::InternalError`] rather than a [`Packet::ProtocolError`].
    #[must_use]
    pub fn is_local_fault(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

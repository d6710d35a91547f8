use std::fmt;

use super::codec::MessageId;
use crate::BlockInfo;

pub use std::io::Error as IoError;

pub(crate) type Result<T, E = PeerError> = std::result::Result<T, E>;

/// A violation of the wire protocol by the remote peer, detected while
/// decoding or validating one of its messages.
///
/// These are always fatal to the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// The handshake's protocol string or its length prefix is not that of
    /// the BitTorrent protocol.
    InvalidHandshake,
    /// A message's payload length does not match the length its type
    /// requires.
    InvalidPayloadSize,
    /// The bitfield has set bits past the last piece or its length is not
    /// that of the torrent's piece count.
    InvalidBitfield,
    /// The message id is not one we know.
    UnknownMessageId(u8),
    /// The payload was expected to be of a specific message type but its id
    /// byte says otherwise.
    MessageIdMismatch { expected: MessageId, actual: u8 },
    /// The declared message length exceeds the largest message we are
    /// willing to buffer.
    PayloadTooLarge(usize),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use ProtocolError::*;
        match self {
            InvalidHandshake => write!(fmt, "invalid handshake"),
            InvalidPayloadSize => write!(fmt, "invalid payload size"),
            InvalidBitfield => write!(fmt, "invalid bitfield"),
            UnknownMessageId(id) => write!(fmt, "unknown message id {}", id),
            MessageIdMismatch { expected, actual } => write!(
                fmt,
                "expected message id {} ({:?}), got {}",
                *expected as u8, expected, actual
            ),
            PayloadTooLarge(len) => {
                write!(fmt, "message length {} too large", len)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Error type returned on failed peer sessions.
///
/// This error is non-fatal to the download so it should not be grouped with
/// the global `Error` type: only the connection to this peer is severed.
#[derive(Debug)]
#[non_exhaustive]
pub enum PeerError {
    /// The peer violated the wire protocol.
    Protocol(ProtocolError),
    /// Peer's torrent info hash did not match ours.
    InvalidInfoHash,
    /// We connected to ourselves.
    SelfConnection,
    /// The peer sent a message of the Fast extension even though it wasn't
    /// negotiated in the handshake.
    FastExtensionDisabled(MessageId),
    /// The piece index the peer sent is invalid.
    InvalidPieceIndex,
    /// The peer requested a block that is not within its piece or that is
    /// longer than we serve.
    InvalidBlock(BlockInfo),
    /// The peer sent an abusive number of choke/unchoke or keep alive
    /// messages.
    Flooding,
    /// Neither side sent or requested any pieces for too long.
    InactivityTimeout,
    /// Neither side was interested in the other for too long.
    NotMutuallyInterested,
    /// The peer closed the connection.
    ConnectionClosed,
    /// An IO error ocurred.
    Io(IoError),
    /// Reading or writing the torrent's data failed.
    Storage(IoError),
}

impl PeerError {
    /// Whether the error was caused by the transport rather than by the peer
    /// misbehaving.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ConnectionClosed)
    }
}

impl fmt::Display for PeerError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use PeerError::*;
        match self {
            Protocol(e) => write!(fmt, "protocol error: {}", e),
            InvalidInfoHash => write!(fmt, "invalid info hash"),
            SelfConnection => write!(fmt, "connected to self"),
            FastExtensionDisabled(id) => write!(
                fmt,
                "received {:?} without the fast extension enabled",
                id
            ),
            InvalidPieceIndex => write!(fmt, "invalid piece index"),
            InvalidBlock(block) => write!(fmt, "invalid block {:?}", block),
            Flooding => write!(fmt, "flooding detected"),
            InactivityTimeout => write!(fmt, "inactivity timeout"),
            NotMutuallyInterested => {
                write!(fmt, "not interested in each other")
            }
            ConnectionClosed => write!(fmt, "connection closed by peer"),
            Io(e) => write!(fmt, "{}", e),
            Storage(e) => write!(fmt, "storage error: {}", e),
        }
    }
}

impl std::error::Error for PeerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            Self::Io(e) | Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for PeerError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<IoError> for PeerError {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

pub use crate::peer::error::PeerError;
pub use tokio::io::Error as IoError;

use std::convert::From;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// The error returned by the public swarm API.
#[derive(Debug)]
pub enum Error {
    /// A peer with the address is already part of the swarm.
    DuplicatePeer,
    /// The peer failed too many times to be connected again.
    PeerBanned,
    /// The swarm task is no longer running.
    SwarmStopped,
    Peer(PeerError),
    Io(IoError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            Peer(e) => write!(f, "{}", e),
            Io(e) => write!(f, "{}", e),
            _ => write!(f, "{:?}", *self),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use Error::*;
        match self {
            Peer(e) => Some(e),
            Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl From<PeerError> for Error {
    fn from(e: PeerError) -> Self {
        Self::Peer(e)
    }
}

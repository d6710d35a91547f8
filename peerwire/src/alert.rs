//! This module defines the alerts the API user may receive from the swarm.
//!
//! Alerts are sent over an unbounded [tokio mpsc
//! channel](tokio::sync::mpsc), so the embedding application may react to
//! them from its own task.

use std::net::SocketAddr;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{peer::error::PeerError, PieceIndex};

/// The sending half of the alert channel.
pub type AlertSender = UnboundedSender<Alert>;
/// The channel on which alerts from the swarm can be received. See [`Alert`]
/// for the type of messages that can be received.
pub type AlertReceiver = UnboundedReceiver<Alert>;

/// The alerts that the swarm may send the library user.
#[derive(Debug)]
pub enum Alert {
    /// A peer announced the port of its DHT node. The DHT is not part of this
    /// library, this is only a hint for one.
    DhtPort { addr: SocketAddr, port: u16 },
    /// A piece was downloaded and its hash verified.
    PieceComplete(PieceIndex),
    /// All pieces were downloaded.
    DownloadComplete,
    /// A peer session was closed with an error.
    PeerDisconnected { addr: SocketAddr, error: PeerError },
}

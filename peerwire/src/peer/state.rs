use std::{collections::HashSet, time::Instant};

use crate::{Bitfield, PeerId, PieceIndex};

/// The per-connection state of a peer session, which holds the flags and
/// counters mutated by the message handlers.
#[derive(Debug)]
pub struct PeerSessionState {
    /// The current state of the connection.
    pub connection: ConnectionState,
    /// Peer's 20 byte BitTorrent id, set after a successful handshake.
    pub peer_id: Option<PeerId>,

    /// If we're choking, we don't allow the peer to download pieces from us.
    pub am_choking: bool,
    /// If we're interested, the peer has pieces that we don't have.
    pub am_interested: bool,
    /// If the peer is choking us, it doesn't allow us to download pieces from
    /// it.
    pub peer_choking: bool,
    /// If the peer is interested, it means to download pieces that we have.
    pub peer_interested: bool,

    /// Whether both sides support the Fast extension.
    pub fast_extension: bool,
    /// All pieces the peer has, updated when it announces a new piece.
    pub bitfield: Bitfield,
    /// Whether we have received any piece availability message from the peer,
    /// to detect late bitfields.
    pub received_availability: bool,
    /// The pieces the peer allows us to download even while it chokes us.
    pub peer_allowed_fast: HashSet<PieceIndex>,
    /// The pieces we allow the peer to download even while we choke it.
    pub am_allowed_fast: HashSet<PieceIndex>,

    /// Set when a request of ours timed out. Cleared when the peer chokes
    /// us.
    pub snubbing: bool,

    /// The payload bytes sent in piece messages.
    pub uploaded: u64,
    /// The payload bytes received in piece messages.
    pub downloaded: u64,
    /// All bytes written to the socket.
    pub uploaded_protocol: u64,
    /// All bytes read from the socket.
    pub downloaded_protocol: u64,

    /// The last time a piece or a request was exchanged in either direction.
    pub last_activity: Instant,
    /// The last time either side was interested in the other.
    pub last_interest: Instant,
}

impl PeerSessionState {
    /// By default, both sides of the connection start off as choked and not
    /// interested in the other.
    pub fn new(piece_count: usize, now: Instant) -> Self {
        Self {
            connection: ConnectionState::default(),
            peer_id: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            fast_extension: false,
            bitfield: Bitfield::repeat(false, piece_count),
            received_availability: false,
            peer_allowed_fast: HashSet::new(),
            am_allowed_fast: HashSet::new(),
            snubbing: false,
            uploaded: 0,
            downloaded: 0,
            uploaded_protocol: 0,
            downloaded_protocol: 0,
            last_activity: now,
            last_interest: now,
        }
    }

    /// Returns whether the peer has all pieces.
    pub fn is_peer_seed(&self) -> bool {
        !self.bitfield.is_empty() && self.bitfield.all()
    }
}

/// At any given time, a connection with a peer is in one of the below states.
///
/// An outbound connection goes through all of them in order, an inbound one
/// starts in `AwaitHandshake`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConnectionState {
    /// The TCP connection is being established.
    Connecting,
    /// Our handshake is being written.
    SendHandshake,
    /// We're waiting for the peer's handshake.
    AwaitHandshake,
    /// The handshakes were exchanged, any message but the handshake may be
    /// exchanged.
    Wired,
    /// The connection is torn down. This state is terminal.
    Closed,
}

/// The default (and initial) state of an outbound peer session is
/// `Connecting`.
impl Default for ConnectionState {
    fn default() -> Self {
        Self::Connecting
    }
}

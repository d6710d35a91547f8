//! A BitTorrent peer wire protocol engine.
//!
//! The crate implements the per-connection side of a BitTorrent client: the
//! message codec, the handshake and steady state session machinery, the
//! outbound message queue with upload throttling, and the request pipeline
//! that decides which blocks to request from which peer. Piece storage and the
//! global piece availability bookkeeping are consumed through the [`Storage`]
//! and [`PieceSet`] traits, for which in-memory implementations are provided.

pub mod alert;
pub mod conf;
mod download;
pub mod error;
pub mod peer;
pub mod piece_picker;
pub mod storage;
pub mod storage_info;
pub mod swarm;
pub mod throttle;

pub use {
    piece_picker::{PiecePicker, PieceSet},
    storage::{MemoryStorage, Storage},
    storage_info::StorageInfo,
};

use bitvec::prelude::{BitVec, Msb0};

pub type PeerId = [u8; 20];
pub type Sha1Hash = [u8; 20];

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, so this is
/// the widest index the protocol can express.
pub type PieceIndex = u32;

/// The bitfield represents the piece availability of a peer. It is a compact
/// bool vector of most significant bits to least significants bits, that is,
/// where the first highest bit represents the first piece, the second highest
/// element the second piece, and so on (e.g. `0b1100_0001` would mean that we
/// have pieces 0, 1, and 7). A truthy boolean value of a piece's position in
/// this vector means that the peer has the piece, while a falsy value means it
/// doesn't have the piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// The torrent wide information every peer session of a torrent needs.
#[derive(Clone, Debug)]
pub struct TorrentInfo {
    /// The SHA-1 hash of the torrent's info dictionary, which identifies the
    /// torrent in the handshake.
    pub info_hash: Sha1Hash,
    /// Our id, advertised in the handshake.
    pub client_id: PeerId,
    pub storage: StorageInfo,
}

/// This is the only block length we're requesting. It is the widely used and
/// accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happen at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes) or less, for
    /// now.
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece, assuming the default
    /// block length.
    pub fn index_in_piece(&self) -> usize {
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as usize
    }
}

/// Returns the length of the block at the index in piece.
///
/// If the piece is not a multiple of the default block length, the returned
/// value is smaller.
///
/// # Panics
///
/// Panics if the index multiplied by the default block length would exceed the
/// piece length.
pub(crate) fn block_len(piece_len: u32, block_index: usize) -> u32 {
    let block_index = block_index as u32;
    let block_offset = block_index * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter so we need to account for this by rounding
    // up before dividing to get the number of blocks in piece
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

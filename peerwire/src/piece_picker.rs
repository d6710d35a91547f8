use std::collections::HashSet;

use crate::{Bitfield, PieceIndex};

/// The torrent wide record of which pieces we have, which are being
/// downloaded, and how available the rest are in the swarm.
///
/// A single instance is shared by all peer sessions of a torrent. Sessions
/// only ever borrow it for the duration of a single pass, so implementations
/// need no internal synchronization as long as all sessions are driven from
/// the same task.
pub trait PieceSet {
    /// The number of pieces in torrent.
    fn piece_count(&self) -> usize;

    /// The length of the piece at the index, which is only shorter than the
    /// nominal piece length for the last piece.
    fn piece_len(&self, index: PieceIndex) -> u32;

    /// Returns whether we have the piece (downloaded and hash verified).
    fn has(&self, index: PieceIndex) -> bool;

    /// The pieces we have.
    fn own_pieces(&self) -> &Bitfield;

    /// Returns whether we have all pieces.
    fn is_complete(&self) -> bool {
        self.own_pieces().all()
    }

    /// Returns whether we have no pieces at all.
    fn is_empty(&self) -> bool {
        self.own_pieces().not_any()
    }

    /// Returns whether so few pieces are missing that the same blocks may be
    /// requested from several peers.
    fn is_end_game(&self) -> bool;

    /// Returns whether the peer has at least one piece we don't.
    fn has_missing_for(&self, peer_pieces: &Bitfield) -> bool {
        (0..self.piece_count()).any(|index| {
            peer_pieces.get(index).map(|b| *b).unwrap_or(false)
                && !self.own_pieces()[index]
        })
    }

    /// Picks a piece that the peer has and that we are missing, and marks it
    /// as pending so that other sessions don't pick it as well (unless we're
    /// in the end game).
    ///
    /// If `allowed` is given, only pieces in that set are considered. This is
    /// used to pick from a peer's allowed fast set while we are choked.
    fn missing_for(
        &mut self,
        peer_pieces: &Bitfield,
        allowed: Option<&HashSet<PieceIndex>>,
    ) -> Option<PieceIndex>;

    /// Relinquishes a pending piece that the session will not finish.
    fn cancel(&mut self, index: PieceIndex);

    /// Registers a downloaded and hash verified piece.
    fn mark_complete(&mut self, index: PieceIndex);

    /// Registers the pieces a peer has.
    fn register_bitfield(&mut self, pieces: &Bitfield);

    /// Unregisters the pieces of a peer whose bitfield was replaced or who
    /// disconnected.
    fn unregister_bitfield(&mut self, pieces: &Bitfield);

    /// Registers a single new piece a peer has.
    fn register_have(&mut self, index: PieceIndex);

    /// The indices of the pieces completed during the download, in the order
    /// they were completed. Sessions keep a cursor into this log to learn
    /// which pieces they still need to advertise.
    fn completion_log(&self) -> &[PieceIndex];
}

/// An in-memory [`PieceSet`] that picks the rarest pieces first.
pub struct PiecePicker {
    /// Represents the pieces that we have downloaded.
    ///
    /// The bitfield is pre-allocated to the number of pieces in the torrent and
    /// each field that we have is set to true.
    own_pieces: Bitfield,
    /// We collect metadata about pieces in the torrent swarm in this vector.
    ///
    /// The vector is pre-allocated to the number of pieces in the torrent.
    pieces: Vec<Piece>,
    /// The nominal length of a piece.
    piece_len: u32,
    /// The length of the last piece, which may be shorter than the rest.
    last_piece_len: u32,
    /// The end game begins once at most this many pieces are missing.
    end_game_threshold: usize,
    /// See [`PieceSet::completion_log`].
    completed: Vec<PieceIndex>,
}

/// Metadata about a piece relevant for the piece picker.
#[derive(Clone, Copy, Debug, Default)]
struct Piece {
    /// The frequency of this piece in the torrent swarm.
    frequency: usize,
    /// The number of sessions downloading this piece. Outside the end game it
    /// is never more than one.
    pending: usize,
}

impl PiecePicker {
    /// The default number of missing pieces at and below which the end game
    /// begins.
    pub const END_GAME_THRESHOLD: usize = 20;

    /// Creates a new empty piece picker for the given number of pieces.
    ///
    /// Empty means that we don't have any of the pieces yet, so piece picker
    /// will pick all of them, if available from our peers.
    pub fn new(piece_count: usize, piece_len: u32, last_piece_len: u32) -> Self {
        let mut pieces = Vec::new();
        pieces.resize_with(piece_count, Piece::default);
        Self {
            own_pieces: Bitfield::repeat(false, piece_count),
            pieces,
            piece_len,
            last_piece_len,
            end_game_threshold: Self::END_GAME_THRESHOLD,
            completed: Vec::new(),
        }
    }

    /// Creates a piece picker that starts out with the given pieces, e.g.
    /// when resuming a download or seeding.
    pub fn with_own_pieces(
        own_pieces: Bitfield,
        piece_len: u32,
        last_piece_len: u32,
    ) -> Self {
        let mut picker = Self::new(own_pieces.len(), piece_len, last_piece_len);
        picker.own_pieces = own_pieces;
        picker
    }

    pub fn set_end_game_threshold(&mut self, threshold: usize) {
        self.end_game_threshold = threshold;
    }

    /// Returns the number of missing pieces that are needed to complete the
    /// download.
    pub fn count_missing_pieces(&self) -> usize {
        self.own_pieces.count_zeros()
    }

    /// Returns the number of sessions downloading the piece.
    pub fn pending_count(&self, index: PieceIndex) -> usize {
        self.pieces
            .get(index as usize)
            .map(|p| p.pending)
            .unwrap_or_default()
    }

    /// Returns how many of our peers have the piece.
    pub fn frequency(&self, index: PieceIndex) -> usize {
        self.pieces
            .get(index as usize)
            .map(|p| p.frequency)
            .unwrap_or_default()
    }

    /// Returns the rarest piece that the peer has and we are missing,
    /// considering only pieces accepted by the filter.
    fn pick_rarest(
        &self,
        peer_pieces: &Bitfield,
        allowed: Option<&HashSet<PieceIndex>>,
        filter: impl Fn(&Piece) -> bool,
    ) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for index in 0..self.pieces.len() {
            if self.own_pieces[index]
                || !peer_pieces.get(index).map(|b| *b).unwrap_or(false)
            {
                continue;
            }
            if let Some(allowed) = allowed {
                if !allowed.contains(&(index as PieceIndex)) {
                    continue;
                }
            }
            let piece = &self.pieces[index];
            if !filter(piece) {
                continue;
            }
            match best {
                Some((_, frequency)) if frequency <= piece.frequency => {}
                _ => best = Some((index, piece.frequency)),
            }
        }
        best.map(|(index, _)| index)
    }
}

impl PieceSet for PiecePicker {
    fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    fn piece_len(&self, index: PieceIndex) -> u32 {
        debug_assert!((index as usize) < self.pieces.len());
        if index as usize + 1 == self.pieces.len() {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    fn has(&self, index: PieceIndex) -> bool {
        self.own_pieces
            .get(index as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    fn is_end_game(&self) -> bool {
        self.count_missing_pieces() <= self.end_game_threshold
    }

    fn missing_for(
        &mut self,
        peer_pieces: &Bitfield,
        allowed: Option<&HashSet<PieceIndex>>,
    ) -> Option<PieceIndex> {
        log::trace!("Picking next piece");

        // only consider a piece if we don't have it and if no other session is
        // already downloading it, unless we're in the end game, in which case
        // pending pieces are picked too
        let mut index = self.pick_rarest(peer_pieces, allowed, |p| p.pending == 0);
        if index.is_none() && self.is_end_game() {
            index = self.pick_rarest(peer_pieces, allowed, |_| true);
            if let Some(index) = index {
                log::debug!("Picked pending piece {} in end game", index);
            }
        }

        match index {
            Some(index) => {
                self.pieces[index].pending += 1;
                log::trace!("Picked piece {}", index);
                Some(index as PieceIndex)
            }
            None => {
                log::trace!("Could not pick piece");
                None
            }
        }
    }

    fn cancel(&mut self, index: PieceIndex) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            piece.pending = piece.pending.saturating_sub(1);
        }
    }

    fn mark_complete(&mut self, index: PieceIndex) {
        log::trace!("Registering received piece {}", index);
        let index = index as usize;
        if index >= self.pieces.len() || self.own_pieces[index] {
            return;
        }
        self.own_pieces.set(index, true);
        self.pieces[index].pending = 0;
        self.completed.push(index as PieceIndex);
    }

    fn register_bitfield(&mut self, pieces: &Bitfield) {
        log::trace!("Registering piece availability: {}", pieces);
        for index in 0..self.pieces.len().min(pieces.len()) {
            // increase frequency count for this piece if peer has it
            if pieces[index] {
                self.pieces[index].frequency += 1;
            }
        }
    }

    fn unregister_bitfield(&mut self, pieces: &Bitfield) {
        for index in 0..self.pieces.len().min(pieces.len()) {
            if pieces[index] {
                let piece = &mut self.pieces[index];
                piece.frequency = piece.frequency.saturating_sub(1);
            }
        }
    }

    fn register_have(&mut self, index: PieceIndex) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            piece.frequency += 1;
        }
    }

    fn completion_log(&self) -> &[PieceIndex] {
        &self.completed
    }
}

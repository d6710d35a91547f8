use std::time::{Duration, Instant};

use crate::{BlockInfo, PieceIndex};

/// Bookkeeping of a single block request sent to the peer and not yet
/// answered.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RequestSlot {
    pub piece_index: PieceIndex,
    pub begin: u32,
    pub length: u32,
    /// The block's index within its piece.
    pub block_index: u32,
    /// When the request was queued.
    pub dispatched_at: Instant,
}

impl RequestSlot {
    pub fn new(block: BlockInfo, dispatched_at: Instant) -> Self {
        Self {
            piece_index: block.piece_index,
            begin: block.offset,
            length: block.len,
            block_index: block.index_in_piece() as u32,
            dispatched_at,
        }
    }

    pub fn block_info(&self) -> BlockInfo {
        BlockInfo {
            piece_index: self.piece_index,
            offset: self.begin,
            len: self.length,
        }
    }

    fn matches(&self, piece_index: PieceIndex, begin: u32, length: u32) -> bool {
        self.piece_index == piece_index
            && self.begin == begin
            && self.length == length
    }
}

/// The outstanding requests of a session, in the order they were sent.
///
/// No operation fails: a slot that is not found is a normal outcome, as peers
/// may send blocks or rejects for requests we already gave up on.
#[derive(Debug, Default)]
pub struct RequestSlotTable {
    slots: Vec<RequestSlot>,
}

impl RequestSlotTable {
    /// Adds a slot. The caller must make sure no slot for the same block is in
    /// the table.
    pub fn add(&mut self, slot: RequestSlot) {
        debug_assert!(!self
            .slots
            .iter()
            .any(|s| s.matches(slot.piece_index, slot.begin, slot.length)));
        self.slots.push(slot);
    }

    /// Removes and returns the slot of the given block, if any.
    pub fn remove_matching(
        &mut self,
        piece_index: PieceIndex,
        begin: u32,
        length: u32,
    ) -> Option<RequestSlot> {
        let pos = self
            .slots
            .iter()
            .position(|s| s.matches(piece_index, begin, length))?;
        Some(self.slots.remove(pos))
    }

    /// Removes and returns every slot dispatched more than `timeout` before
    /// `now`.
    pub fn expire(&mut self, timeout: Duration, now: Instant) -> Vec<RequestSlot> {
        self.remove_where(|s| {
            now.saturating_duration_since(s.dispatched_at) > timeout
        })
    }

    /// Removes and returns every slot matching the predicate, e.g. those whose
    /// piece another peer completed.
    pub fn remove_acquired(
        &mut self,
        is_acquired: impl Fn(&RequestSlot) -> bool,
    ) -> Vec<RequestSlot> {
        self.remove_where(is_acquired)
    }

    fn remove_where(
        &mut self,
        pred: impl Fn(&RequestSlot) -> bool,
    ) -> Vec<RequestSlot> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.slots.len() {
            if pred(&self.slots[i]) {
                removed.push(self.slots.remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Removes and returns all slots.
    pub fn drain(&mut self) -> Vec<RequestSlot> {
        std::mem::take(&mut self.slots)
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns whether a request for the block is outstanding.
    pub fn contains_block(&self, piece_index: PieceIndex, block_index: u32) -> bool {
        self.slots
            .iter()
            .any(|s| s.piece_index == piece_index && s.block_index == block_index)
    }
}

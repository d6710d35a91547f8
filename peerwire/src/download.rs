use rand::seq::SliceRandom;

use crate::{block_count, block_len, BlockInfo, PieceIndex, BLOCK_LEN};

#[derive(Clone, Copy, Debug, PartialEq)]
enum Block {
    Free,
    Requested,
    Received,
}

impl Default for Block {
    fn default() -> Self {
        Self::Free
    }
}

/// The piece a session is currently downloading from its peer, and the state
/// of each of its blocks from the point of view of that session.
///
/// In the end game several sessions may download the same piece, each with its
/// own `PieceDownload`, so a block requested here may well be requested from
/// another peer too. It is never requested twice from the same peer.
#[derive(Debug)]
pub(crate) struct PieceDownload {
    /// The piece's index.
    index: PieceIndex,
    /// The piece's length in bytes.
    len: u32,
    /// The blocks in this piece, tracking which are free, requested, or
    /// received. The vec is preallocated to the number of blocks in piece.
    blocks: Vec<Block>,
}

impl PieceDownload {
    /// Creates a new piece download instance for the given piece.
    pub fn new(index: PieceIndex, len: u32) -> Self {
        let block_count = block_count(len);
        let mut blocks = Vec::new();
        blocks.resize_with(block_count, Default::default);
        Self { index, len, blocks }
    }

    /// Returns the index of the piece that is downloaded.
    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Returns the piece's length in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Picks at most `count` free blocks in ascending order and marks them
    /// requested.
    pub fn pick_blocks(&mut self, count: usize, blocks: &mut Vec<BlockInfo>) {
        let free: Vec<usize> = self.free_blocks().collect();
        self.pick_from(free, count, blocks);
    }

    /// Like [`Self::pick_blocks`] but picks the free blocks in random order,
    /// so that the sessions racing for the same piece in the end game are
    /// likely to request different blocks first.
    pub fn pick_end_game_blocks(
        &mut self,
        count: usize,
        blocks: &mut Vec<BlockInfo>,
    ) {
        let mut free: Vec<usize> = self.free_blocks().collect();
        free.shuffle(&mut rand::rng());
        self.pick_from(free, count, blocks);
    }

    fn free_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == Block::Free)
            .map(|(i, _)| i)
    }

    fn pick_from(
        &mut self,
        candidates: Vec<usize>,
        count: usize,
        blocks: &mut Vec<BlockInfo>,
    ) {
        log::trace!(
            "Picking {} block(s) in piece {} (length: {}, blocks: {})",
            count,
            self.index,
            self.len,
            self.blocks.len(),
        );

        let start = blocks.len();
        for i in candidates.into_iter().take(count) {
            blocks.push(self.block_info(i));
            self.blocks[i] = Block::Requested;
        }

        if blocks.len() > start {
            log::debug!(
                "Picked {} block(s) for piece {}: {:?}",
                blocks.len() - start,
                self.index,
                &blocks[start..]
            );
        } else {
            log::debug!("Cannot pick any blocks in piece {}", self.index);
        }
    }

    fn block_info(&self, block_index: usize) -> BlockInfo {
        BlockInfo {
            piece_index: self.index,
            offset: block_index as u32 * BLOCK_LEN,
            len: block_len(self.len, block_index),
        }
    }

    /// Returns whether the block is a valid block of this piece.
    pub fn is_valid_block(&self, block: &BlockInfo) -> bool {
        block.piece_index == self.index
            && block.offset % BLOCK_LEN == 0
            && block.len > 0
            && (block.offset / BLOCK_LEN) < self.blocks.len() as u32
            && block.len == block_len(self.len, (block.offset / BLOCK_LEN) as usize)
    }

    /// Marks the given block as received so that it is not picked again.
    ///
    /// Returns false if the block was already received, in which case
    /// nothing changes.
    pub fn received_block(&mut self, block: &BlockInfo) -> bool {
        log::trace!("Received piece {} block {:?}", self.index, block);
        debug_assert!(self.is_valid_block(block));

        let state = &mut self.blocks[block.index_in_piece()];
        if *state == Block::Received {
            return false;
        }
        *state = Block::Received;
        true
    }

    /// Marks a previously requested block free to request again.
    pub fn cancel_request(&mut self, block: &BlockInfo) {
        log::trace!(
            "Canceling request for piece {} block {:?}",
            self.index,
            block
        );
        debug_assert!(self.is_valid_block(block));

        let state = &mut self.blocks[block.index_in_piece()];
        if *state == Block::Requested {
            *state = Block::Free;
        }
    }

    /// Discards all received blocks, e.g. after the piece failed its hash
    /// check, so that the whole piece is downloaded again.
    pub fn reset(&mut self) {
        for block in self.blocks.iter_mut() {
            *block = Block::Free;
        }
    }

    /// Returns true if the piece has all blocks downloaded.
    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| *b == Block::Received)
    }

    /// Returns the number of blocks not yet received.
    pub fn count_missing_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| **b != Block::Received).count()
    }

    /// Returns the number of blocks that may still be requested.
    pub fn count_free_blocks(&self) -> usize {
        self.free_blocks().count()
    }
}

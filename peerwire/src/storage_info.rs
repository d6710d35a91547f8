use crate::{BlockInfo, PieceIndex};

/// Information about a torrent's storage details, such as the piece count and
/// length, download length, etc.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of the
    /// piece length.
    pub last_piece_len: u32,
    /// The length of the whole torrent in bytes.
    pub download_len: u64,
}

impl StorageInfo {
    /// # Panics
    ///
    /// Panics if either length is zero.
    pub fn new(download_len: u64, piece_len: u32) -> Self {
        assert!(download_len > 0);
        assert!(piece_len > 0);
        let piece_count =
            ((download_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        Self {
            piece_count,
            piece_len,
            last_piece_len: last_piece_len as u32,
            download_len,
        }
    }

    /// Returns the length of the piece at the given index, or `None` if the
    /// index is invalid.
    pub fn piece_len(&self, index: PieceIndex) -> Option<u32> {
        let index = index as usize;
        if index + 1 == self.piece_count {
            Some(self.last_piece_len)
        } else if index + 1 < self.piece_count {
            Some(self.piece_len)
        } else {
            None
        }
    }

    /// Returns whether the block lies within its piece.
    pub fn is_valid_block(&self, block: &BlockInfo) -> bool {
        match self.piece_len(block.piece_index) {
            Some(piece_len) => {
                block.len > 0
                    && block.offset < piece_len
                    && block.len <= piece_len - block.offset
            }
            None => false,
        }
    }

    /// Returns the offset of the block in the torrent, when all pieces are
    /// viewed as a single contiguous byte array.
    pub fn torrent_offset(&self, block: &BlockInfo) -> u64 {
        block.piece_index as u64 * self.piece_len as u64 + block.offset as u64
    }
}

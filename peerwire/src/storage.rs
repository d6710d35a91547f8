use std::io;

use sha1::{Digest, Sha1};

use crate::{PieceIndex, Sha1Hash};

/// The torrent's data, addressed as one contiguous byte range, together with
/// the expected piece hashes.
///
/// Like [`crate::PieceSet`], a single instance is shared by all sessions of a
/// torrent and lent to them for the duration of a pass.
pub trait Storage {
    /// Writes the data at the absolute offset in torrent.
    fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Reads `len` bytes at the absolute offset in torrent.
    fn read(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Hashes the piece's stored data and returns whether it matches the
    /// expected hash.
    fn verify_hash(&mut self, index: PieceIndex) -> bool;
}

/// A [`Storage`] that keeps the whole torrent in memory.
#[derive(Debug)]
pub struct MemoryStorage {
    data: Vec<u8>,
    piece_len: u32,
    piece_hashes: Vec<Sha1Hash>,
}

impl MemoryStorage {
    /// Creates a zeroed storage of the given length to be downloaded into.
    ///
    /// # Panics
    ///
    /// Panics if the number of hashes is not that of the pieces.
    pub fn new(len: u64, piece_len: u32, piece_hashes: Vec<Sha1Hash>) -> Self {
        let piece_count = (len + piece_len as u64 - 1) / piece_len as u64;
        assert_eq!(piece_hashes.len() as u64, piece_count);
        Self {
            data: vec![0; len as usize],
            piece_len,
            piece_hashes,
        }
    }

    /// Creates a storage with complete data, e.g. to seed from, computing the
    /// piece hashes from the data.
    pub fn with_data(data: Vec<u8>, piece_len: u32) -> Self {
        let piece_hashes = data
            .chunks(piece_len as usize)
            .map(hash_piece)
            .collect();
        Self {
            data,
            piece_len,
            piece_hashes,
        }
    }

    /// The expected hashes of the pieces, in order.
    pub fn piece_hashes(&self) -> &[Sha1Hash] {
        &self.piece_hashes
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// The length of the last piece, which may be shorter than the rest.
    pub fn last_piece_len(&self) -> u32 {
        let rem = (self.data.len() % self.piece_len as usize) as u32;
        if rem == 0 {
            self.piece_len
        } else {
            rem
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range {}+{} out of bounds of {} bytes",
                    offset,
                    len,
                    self.data.len()
                ),
            )),
        }
    }
}

impl Storage for MemoryStorage {
    fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let range = self.range(offset, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let range = self.range(offset, len)?;
        Ok(self.data[range].to_vec())
    }

    fn verify_hash(&mut self, index: PieceIndex) -> bool {
        let expected = match self.piece_hashes.get(index as usize) {
            Some(hash) => *hash,
            None => return false,
        };
        let start = index as usize * self.piece_len as usize;
        let end = std::cmp::min(start + self.piece_len as usize, self.data.len());
        let hash = hash_piece(&self.data[start..end]);
        log::trace!(
            "Piece {} hash {} (expected {})",
            index,
            hex::encode(&hash),
            hex::encode(&expected)
        );
        hash == expected
    }
}

fn hash_piece(data: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let mut hash = [0; 20];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

use std::net::IpAddr;

use sha1::{Digest, Sha1};

use crate::{PieceIndex, Sha1Hash};

/// Computes the canonical allowed fast set of a peer: the pieces the peer may
/// download from us even while choked.
///
/// The set is derived from the peer's IP (masked to its /24 network for IPv4,
/// the first four bytes for IPv6) and the torrent's info hash, so every client
/// computes the same set for the same peer. The result has
/// `min(set_len, piece_count)` distinct indices.
pub(crate) fn allowed_fast_set(
    info_hash: &Sha1Hash,
    ip: IpAddr,
    piece_count: usize,
    set_len: usize,
) -> Vec<PieceIndex> {
    let set_len = set_len.min(piece_count);
    let mut set = Vec::with_capacity(set_len);
    if set_len == 0 {
        return set;
    }

    let ip = match ip {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], 0]
        }
        IpAddr::V6(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], o[3]]
        }
    };

    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&ip);
    x.extend_from_slice(info_hash);

    while set.len() < set_len {
        let mut hasher = Sha1::new();
        hasher.update(&x);
        let digest = hasher.finalize();

        for word in digest.chunks_exact(4) {
            if set.len() == set_len {
                break;
            }
            let n = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
            let index = n % piece_count as u32;
            if !set.contains(&index) {
                set.push(index);
            }
        }

        x = digest.to_vec();
    }

    set
}

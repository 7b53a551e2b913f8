// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Canonical allowed-fast set derivation (BEP 6).
//!
//! Deterministic in (peer address, infohash, piece count), so both ends of a
//! connection can compute the same grant. Stateless: a hasher is allocated
//! per call instead of sharing a locked process-wide instance.

use std::net::IpAddr;

use sha1::{Digest, Sha1};

use crate::hashes::InfoHash;

pub const ALLOWED_FAST_SET_SIZE: usize = 10;

/// Piece indices the given peer may request from us even while choked.
///
/// IPv4 addresses are masked to /24 per the BEP; the first four bytes stand
/// in for IPv6. Returned in derivation order.
pub fn allowed_fast_set(info_hash: &InfoHash, peer_ip: IpAddr, piece_count: u32) -> Vec<u32> {
    allowed_fast_set_sized(info_hash, peer_ip, piece_count, ALLOWED_FAST_SET_SIZE)
}

pub fn allowed_fast_set_sized(
    info_hash: &InfoHash,
    peer_ip: IpAddr,
    piece_count: u32,
    set_size: usize,
) -> Vec<u32> {
    if piece_count == 0 {
        return Vec::new();
    }
    let set_size = set_size.min(piece_count as usize);

    let ip_bytes = match peer_ip {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], octets[2], 0]
        }
        IpAddr::V6(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], octets[2], octets[3]]
        }
    };

    let mut seed = Vec::with_capacity(24);
    seed.extend_from_slice(&ip_bytes);
    seed.extend_from_slice(&info_hash.wire_bytes());

    let mut allowed = Vec::with_capacity(set_size);
    while allowed.len() < set_size {
        let mut hasher = Sha1::new();
        hasher.update(&seed);
        let digest = hasher.finalize();

        for chunk in digest.chunks(4) {
            if allowed.len() >= set_size {
                break;
            }
            let index =
                u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % piece_count;
            if !allowed.contains(&index) {
                allowed.push(index);
            }
        }

        seed = digest.to_vec();
    }

    allowed
}

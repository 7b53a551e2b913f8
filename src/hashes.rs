// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Torrent identity and piece digests for both hash families: v1 (SHA-1)
//! and v2 (SHA-256). Hybrid torrents carry both.

use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Content-addressed identifier of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoHash {
    pub v1: Option<[u8; 20]>,
    pub v2: Option<[u8; 32]>,
}

impl InfoHash {
    pub fn v1(hash: [u8; 20]) -> Self {
        Self {
            v1: Some(hash),
            v2: None,
        }
    }

    pub fn v2(hash: [u8; 32]) -> Self {
        Self {
            v1: None,
            v2: Some(hash),
        }
    }

    pub fn hybrid(v1: [u8; 20], v2: [u8; 32]) -> Self {
        Self {
            v1: Some(v1),
            v2: Some(v2),
        }
    }

    /// Does a 20-byte wire infohash refer to this torrent? v2-only torrents
    /// are addressed by the truncated SHA-256 on the v1 wire.
    pub fn matches_wire(&self, wire: &[u8; 20]) -> bool {
        if self.v1.as_ref() == Some(wire) {
            return true;
        }
        matches!(self.v2, Some(full) if &full[..20] == wire)
    }

    /// The 20 bytes this torrent uses on the v1 handshake.
    pub fn wire_bytes(&self) -> [u8; 20] {
        if let Some(v1) = self.v1 {
            return v1;
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&self.v2.expect("infohash with neither family")[..20]);
        out
    }
}

/// A piece digest in whichever family the torrent uses for verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceHash {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl PieceHash {
    pub fn digest_v1(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self::Sha1(hasher.finalize().into())
    }

    pub fn digest_v2(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::Sha256(hasher.finalize().into())
    }
}

/// The authoritative per-piece digests from the metainfo.
///
/// v2 entries are the per-piece roots of the file merkle trees; when both
/// families are present the v2 digest is preferred for verification.
#[derive(Debug, Clone, Default)]
pub struct PieceHashStore {
    pub v1: Option<Vec<[u8; 20]>>,
    pub v2: Option<Vec<[u8; 32]>>,
}

impl PieceHashStore {
    pub fn from_v1(hashes: Vec<[u8; 20]>) -> Self {
        Self {
            v1: Some(hashes),
            v2: None,
        }
    }

    pub fn len(&self) -> usize {
        self.v2
            .as_ref()
            .map(Vec::len)
            .or_else(|| self.v1.as_ref().map(Vec::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compares a computed digest against the stored one for `index`.
    pub fn verify(&self, index: u32, computed: &PieceHash) -> bool {
        match computed {
            PieceHash::Sha256(hash) => self
                .v2
                .as_ref()
                .and_then(|hashes| hashes.get(index as usize))
                .is_some_and(|expected| expected == hash),
            PieceHash::Sha1(hash) => self
                .v1
                .as_ref()
                .and_then(|hashes| hashes.get(index as usize))
                .is_some_and(|expected| expected == hash),
        }
    }

    /// Which family the disk layer should hash pieces with.
    pub fn family(&self) -> HashFamily {
        if self.v2.is_some() {
            HashFamily::Sha256
        } else {
            HashFamily::Sha1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFamily {
    Sha1,
    Sha256,
}

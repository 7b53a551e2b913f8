// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

/// Peer-level failures. All of these disconnect the offending peer and leave
/// the torrent running.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Handshake named an infohash this engine does not track.
    #[error("unknown info hash")]
    UnknownInfoHash,

    #[error("unsupported message id {0}")]
    UnsupportedMessage(u8),

    #[error("malformed message: {0}")]
    InvalidMessage(&'static str),

    #[error("invalid handshake")]
    InvalidHandshake,
}

/// Disk-side failures surfaced by the storage actor.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block out of bounds: piece {piece} offset {offset}")]
    OutOfBounds { piece: u32, offset: u32 },
}

/// Faults that put the whole torrent into the error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentFault {
    /// A block write failed inside the piece pipeline.
    WriteFailure,
    /// A piece hash could not be read back for verification.
    ReadFailure,
}

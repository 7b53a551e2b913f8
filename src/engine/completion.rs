// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Piece persistence and verification tasks.
//!
//! These run detached from the engine loop: the block write and the hash
//! fetch are awaited off to the side, while all bookkeeping happens inside
//! the torrent's exclusive section. Every awaited resumption re-checks the
//! spawning Mode's cancellation and aborts silently if it fired.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::buffer::BufferLease;
use crate::errors::TorrentFault;
use crate::events::TorrentEvent;
use crate::wire::BlockInfo;

use super::mode::{Mode, Phase};
use super::EngineShared;

/// How many verification failures a peer may be credited with before it is
/// disconnected.
pub const MAX_HASH_FAILURES: u32 = 5;

/// One accepted block on its way to disk.
#[derive(Debug)]
pub struct BlockJob {
    pub from: SocketAddr,
    pub block: BlockInfo,
    /// Non-empty only when the picker saw the piece's final block arrive.
    pub contributing: Option<Vec<SocketAddr>>,
}

/// Persists one block and, on the piece's final block, verifies the piece
/// and attributes the outcome.
pub async fn write_and_account(
    shared: Arc<EngineShared>,
    cancel: CancellationToken,
    job: BlockJob,
    data: Bytes,
    lease: BufferLease,
) {
    let write_result = shared.disk.write(job.block, data).await;
    // The receive buffer is owned by the write path; release it now that the
    // write has completed, pass or fail.
    drop(lease);

    if cancel.is_cancelled() {
        return;
    }
    if write_result.is_err() {
        let mut state = shared.state.enter().await;
        if cancel.is_cancelled() {
            return;
        }
        state.fail(TorrentFault::WriteFailure);
        return;
    }

    let mut state = shared.state.enter().await;
    if cancel.is_cancelled() {
        return;
    }

    let piece = job.block.piece_index;
    let blocks_in_piece = state.layout.blocks_in_piece(piece);
    let progress = state.write_progress.entry(piece).or_default();
    progress.blocks_written += 1;
    if progress.contributors.is_none() {
        progress.contributors = job.contributing;
    }
    if progress.blocks_written < blocks_in_piece {
        return;
    }
    let progress = state
        .write_progress
        .remove(&piece)
        .expect("progress entry vanished");

    // Final block: fetch the piece hash while still inside the critical
    // section so no sibling can interleave its own bookkeeping for this
    // piece.
    let computed = match shared.disk.piece_hash(piece).await {
        Ok(hash) => hash,
        Err(_) => {
            if cancel.is_cancelled() {
                return;
            }
            state.fail(TorrentFault::ReadFailure);
            return;
        }
    };
    if cancel.is_cancelled() {
        return;
    }

    let passed = state.hashes.verify(piece, &computed);
    state.picker.piece_hashed(piece, passed);
    if passed {
        state.have.set(piece as usize);
    } else {
        state.hash_failures += 1;
        state.sink.emit(TorrentEvent::PieceFailed { piece });
        event!(Level::WARN, piece, "piece failed verification");
    }

    for contributor in progress.contributors.unwrap_or_default() {
        let mut disconnect = false;
        if let Some(peer) = state.peers.get_mut(&contributor) {
            if !passed {
                peer.hash_failures += 1;
            }
            disconnect = peer.hash_failures >= MAX_HASH_FAILURES;
        }
        if disconnect {
            state.cleanup_peer(contributor, "too many hash failures");
        }
    }

    if passed {
        state.queue_finished_piece(piece);
        if state.picker.is_complete() && state.mode.phase == Phase::Downloading {
            state.set_mode(Mode::seeding());
            state
                .discovery
                .announce(crate::announce::AnnounceKind::Completed, state.mode.cancel.clone());
        }
    }
}

/// Initial hash check over every piece not excluded by file priorities.
/// Ends by posting `HashCheckComplete` back to the engine loop.
pub async fn initial_hash_check(
    shared: Arc<EngineShared>,
    cancel: CancellationToken,
    pieces: Vec<u32>,
) {
    for piece in pieces {
        if cancel.is_cancelled() {
            return;
        }
        let verdict = shared.disk.piece_hash(piece).await;
        let mut state = shared.state.enter().await;
        if cancel.is_cancelled() {
            return;
        }
        if let Ok(hash) = verdict {
            if state.hashes.verify(piece, &hash) {
                state.picker.set_piece_done(piece);
                state.have.set(piece as usize);
            }
        }
        // Unreadable or mismatching pieces stay wanted and get downloaded.
    }
    let _ = shared
        .events_tx
        .send(super::EngineEvent::HashCheckComplete)
        .await;
}

/// Opportunistic pass over pieces skipped by the initial check whose files
/// have since been promoted to a downloadable priority. Guarded by the
/// `hashing_pending_files` latch, which this task clears when done.
pub async fn hash_pending_files(
    shared: Arc<EngineShared>,
    cancel: CancellationToken,
    pieces: Vec<u32>,
) {
    for piece in pieces {
        if cancel.is_cancelled() {
            break;
        }
        let verdict = shared.disk.piece_hash(piece).await;
        let mut state = shared.state.enter().await;
        if cancel.is_cancelled() {
            break;
        }
        match verdict {
            Ok(hash) => {
                state.unhashed_pieces.remove(&piece);
                if state.hashes.verify(piece, &hash) {
                    state.picker.set_piece_done(piece);
                    state.have.set(piece as usize);
                    state.queue_finished_piece(piece);
                } else {
                    state.picker.reset_piece(piece);
                }
            }
            Err(error) => {
                event!(Level::WARN, piece, %error, "pending-file hash read failed");
                break;
            }
        }
    }
    let mut state = shared.state.enter().await;
    state.hashing_pending_files = false;
}

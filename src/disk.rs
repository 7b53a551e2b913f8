// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Disk collaborator contract and a file-backed implementation.
//!
//! The engine never touches files itself; it sends [`DiskCommand`]s over a
//! channel and awaits the oneshot reply. Tests substitute the actor with a
//! scripted task on the same channel.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{event, Level};

use crate::errors::StorageError;
use crate::hashes::{HashFamily, PieceHash};
use crate::layout::PieceLayout;
use crate::storage::{self, FileMap};
use crate::wire::BlockInfo;

#[derive(Debug)]
pub enum DiskCommand {
    /// Persist one block. The ack fires when the write has completed.
    WriteBlock {
        block: BlockInfo,
        data: Bytes,
        ack: oneshot::Sender<Result<(), StorageError>>,
    },
    /// Read a block back for an upload.
    ReadBlock {
        block: BlockInfo,
        reply: oneshot::Sender<Result<Vec<u8>, StorageError>>,
    },
    /// Hash a fully written piece. An error means the data is unreadable.
    PieceHash {
        piece: u32,
        reply: oneshot::Sender<Result<PieceHash, StorageError>>,
    },
}

fn closed() -> StorageError {
    StorageError::Io(std::io::Error::other("disk channel closed"))
}

/// Cloneable sending side of the disk actor.
#[derive(Clone)]
pub struct DiskHandle {
    tx: mpsc::Sender<DiskCommand>,
}

impl DiskHandle {
    pub fn new(tx: mpsc::Sender<DiskCommand>) -> Self {
        Self { tx }
    }

    pub async fn write(&self, block: BlockInfo, data: Bytes) -> Result<(), StorageError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(DiskCommand::WriteBlock { block, data, ack })
            .await
            .map_err(|_| closed())?;
        done.await.map_err(|_| closed())?
    }

    pub async fn read(&self, block: BlockInfo) -> Result<Vec<u8>, StorageError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(DiskCommand::ReadBlock { block, reply })
            .await
            .map_err(|_| closed())?;
        done.await.map_err(|_| closed())?
    }

    pub async fn piece_hash(&self, piece: u32) -> Result<PieceHash, StorageError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(DiskCommand::PieceHash { piece, reply })
            .await
            .map_err(|_| closed())?;
        done.await.map_err(|_| closed())?
    }
}

/// File-backed disk actor serving one torrent.
pub struct DiskManager {
    rx: mpsc::Receiver<DiskCommand>,
    map: FileMap,
    layout: PieceLayout,
    family: HashFamily,
}

impl DiskManager {
    /// Spawns the actor and returns the handle the engine talks through.
    pub fn spawn(map: FileMap, layout: PieceLayout, family: HashFamily) -> DiskHandle {
        let (tx, rx) = mpsc::channel(256);
        let actor = Self {
            rx,
            map,
            layout,
            family,
        };
        tokio::spawn(actor.run());
        DiskHandle::new(tx)
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                DiskCommand::WriteBlock { block, data, ack } => {
                    let result = self.write_block(block, &data).await;
                    if let Err(ref error) = result {
                        event!(Level::WARN, piece = block.piece_index, %error, "block write failed");
                    }
                    let _ = ack.send(result);
                }
                DiskCommand::ReadBlock { block, reply } => {
                    let offset = self.layout.global_offset(block.piece_index, block.offset);
                    let result = storage::read_span(&self.map, offset, block.length as usize).await;
                    let _ = reply.send(result);
                }
                DiskCommand::PieceHash { piece, reply } => {
                    let _ = reply.send(self.hash_piece(piece).await);
                }
            }
        }
    }

    async fn write_block(&self, block: BlockInfo, data: &[u8]) -> Result<(), StorageError> {
        if !self
            .layout
            .block_in_bounds(block.piece_index, block.offset, data.len() as u32)
        {
            return Err(StorageError::OutOfBounds {
                piece: block.piece_index,
                offset: block.offset,
            });
        }
        let offset = self.layout.global_offset(block.piece_index, block.offset);
        storage::write_span(&self.map, offset, data).await
    }

    async fn hash_piece(&self, piece: u32) -> Result<PieceHash, StorageError> {
        let offset = self.layout.global_offset(piece, 0);
        let size = self.layout.piece_size(piece) as usize;
        let data = storage::read_span(&self.map, offset, size).await?;
        let family = self.family;
        // Hashing a multi-megabyte piece is CPU work; keep it off the runtime.
        let hash = tokio::task::spawn_blocking(move || match family {
            HashFamily::Sha1 => PieceHash::digest_v1(&data),
            HashFamily::Sha256 => PieceHash::digest_v2(&data),
        })
        .await
        .map_err(|_| StorageError::Io(std::io::Error::other("hash task aborted")))?;
        Ok(hash)
    }
}

// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use tracing::{event, Level};

use crate::bitfield::Bitfield;
use crate::layout::{PieceLayout, BLOCK_SIZE};
use crate::wire::BlockInfo;

#[derive(PartialEq, Clone, Copy, Debug, Default)]
pub enum PieceStatus {
    #[default]
    Need,
    Done,
}

/// Verdict for one delivered block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReceipt {
    pub accepted: bool,
    /// Whether this block had been assigned to the delivering peer; an
    /// unsolicited block is still stored but settles no request.
    pub requested: bool,
    /// Peers credited with blocks of this piece. Present only when the
    /// delivered block was the last one outstanding for the piece.
    pub contributing: Option<Vec<SocketAddr>>,
}

impl BlockReceipt {
    fn rejected() -> Self {
        Self {
            accepted: false,
            requested: false,
            contributing: None,
        }
    }
}

/// Per-piece download bookkeeping while blocks are in flight.
#[derive(Debug, Default)]
struct PieceDownload {
    /// Block offsets requested per peer and not yet answered.
    assigned: HashMap<SocketAddr, HashSet<u32>>,
    /// Block offsets received so far.
    received: HashSet<u32>,
    /// Peers that delivered at least one block, in first-delivery order.
    contributors: Vec<SocketAddr>,
}

impl PieceDownload {
    fn is_untouched(&self) -> bool {
        self.received.is_empty() && self.assigned.values().all(|blocks| blocks.is_empty())
    }
}

/// Rarest-first block scheduler.
///
/// Pieces move `need` -> in-flight (`downloads`) -> `Done`; a failed hash
/// sends the piece back to `need` with its download state discarded.
pub struct PiecePicker {
    layout: PieceLayout,
    status: Vec<PieceStatus>,
    need: Vec<u32>,
    rarity: HashMap<u32, usize>,
    downloads: HashMap<u32, PieceDownload>,
}

impl PiecePicker {
    pub fn new(layout: PieceLayout) -> Self {
        let piece_count = layout.piece_count() as usize;
        Self {
            layout,
            status: vec![PieceStatus::Need; piece_count],
            need: (0..piece_count as u32).collect(),
            rarity: HashMap::new(),
            downloads: HashMap::new(),
        }
    }

    pub fn layout(&self) -> PieceLayout {
        self.layout
    }

    /// Marks a piece we already hold (initial hash check, pending-file pass).
    pub fn set_piece_done(&mut self, piece: u32) {
        if let Some(slot) = self.status.get_mut(piece as usize) {
            *slot = PieceStatus::Done;
        }
        self.need.retain(|&p| p != piece);
        self.downloads.remove(&piece);
    }

    pub fn is_piece_done(&self, piece: u32) -> bool {
        self.status.get(piece as usize) == Some(&PieceStatus::Done)
    }

    pub fn pieces_remaining(&self) -> usize {
        self.status
            .iter()
            .filter(|s| **s == PieceStatus::Need)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.pieces_remaining() == 0
    }

    /// Whether the peer advertises anything we still need.
    pub fn is_interesting(&self, peer_bitfield: &Bitfield) -> bool {
        self.status
            .iter()
            .enumerate()
            .any(|(i, s)| *s == PieceStatus::Need && peer_bitfield.get(i))
    }

    pub fn update_rarity<'a, I>(&mut self, peer_bitfields: I)
    where
        I: Iterator<Item = &'a Bitfield> + Clone,
    {
        self.rarity.clear();
        for (piece, status) in self.status.iter().enumerate() {
            if *status == PieceStatus::Done {
                continue;
            }
            let count = peer_bitfields
                .clone()
                .filter(|bitfield| bitfield.get(piece))
                .count();
            self.rarity.insert(piece as u32, count);
        }
    }

    /// Picks up to `limit` blocks for `peer` and records them as assigned.
    ///
    /// In-flight pieces are continued before new ones are started; new pieces
    /// are chosen rarest-first among those the peer advertises.
    pub fn take_requests(
        &mut self,
        peer: SocketAddr,
        peer_bitfield: &Bitfield,
        limit: usize,
    ) -> Vec<BlockInfo> {
        let mut picked = Vec::new();
        if limit == 0 {
            return picked;
        }

        // Continue partially downloaded pieces the peer can serve.
        let mut active: Vec<u32> = self.downloads.keys().copied().collect();
        active.sort_unstable();
        for piece in active {
            if picked.len() >= limit {
                break;
            }
            if !peer_bitfield.get(piece as usize) {
                continue;
            }
            self.fill_from_piece(piece, peer, limit, &mut picked);
        }

        // Start fresh pieces, rarest first.
        while picked.len() < limit {
            let candidate = self
                .need
                .iter()
                .filter(|&&piece| peer_bitfield.get(piece as usize))
                .min_by_key(|&&piece| {
                    (
                        self.rarity.get(&piece).copied().unwrap_or(usize::MAX),
                        piece,
                    )
                })
                .copied();
            let Some(piece) = candidate else { break };
            self.need.retain(|&p| p != piece);
            self.downloads.entry(piece).or_default();
            self.fill_from_piece(piece, peer, limit, &mut picked);
        }

        picked
    }

    fn fill_from_piece(
        &mut self,
        piece: u32,
        peer: SocketAddr,
        limit: usize,
        picked: &mut Vec<BlockInfo>,
    ) {
        let piece_size = self.layout.piece_size(piece);
        let Some(download) = self.downloads.get_mut(&piece) else {
            return;
        };
        let busy: HashSet<u32> = download
            .assigned
            .values()
            .flatten()
            .copied()
            .chain(download.received.iter().copied())
            .collect();

        let mut offset = 0;
        while offset < piece_size && picked.len() < limit {
            let length = (piece_size - offset).min(BLOCK_SIZE);
            if !busy.contains(&offset) {
                download.assigned.entry(peer).or_default().insert(offset);
                picked.push(BlockInfo {
                    piece_index: piece,
                    offset,
                    length,
                });
            }
            offset += length;
        }
    }

    /// Accepts or rejects one delivered block (§contract: the contributing
    /// list is only returned with the piece's final block).
    pub fn piece_data_received(&mut self, peer: SocketAddr, block: BlockInfo) -> BlockReceipt {
        if self.is_piece_done(block.piece_index)
            || !self
                .layout
                .block_in_bounds(block.piece_index, block.offset, block.length)
        {
            return BlockReceipt::rejected();
        }

        let download = self.downloads.entry(block.piece_index).or_default();
        if download.received.contains(&block.offset) {
            return BlockReceipt::rejected();
        }

        // Unrequested-but-valid blocks are kept; some peers push allowed-fast
        // data without being asked.
        self.need.retain(|&p| p != block.piece_index);
        download.received.insert(block.offset);
        let requested = download
            .assigned
            .get_mut(&peer)
            .is_some_and(|assigned| assigned.remove(&block.offset));
        if !download.contributors.contains(&peer) {
            download.contributors.push(peer);
        }

        let complete =
            download.received.len() as u32 == self.layout.blocks_in_piece(block.piece_index);
        BlockReceipt {
            accepted: true,
            requested,
            contributing: complete.then(|| download.contributors.clone()),
        }
    }

    /// Drops every assignment to `peer`, returning how many were freed.
    pub fn cancel_requests(&mut self, peer: SocketAddr) -> usize {
        let mut freed = 0;
        let mut requeue = Vec::new();
        for (&piece, download) in self.downloads.iter_mut() {
            if let Some(blocks) = download.assigned.remove(&peer) {
                freed += blocks.len();
            }
            if download.is_untouched() {
                requeue.push(piece);
            }
        }
        for piece in requeue {
            self.downloads.remove(&piece);
            if self.status[piece as usize] == PieceStatus::Need {
                self.need.push(piece);
            }
        }
        freed
    }

    /// The peer refused one request (fast extension RejectRequest).
    pub fn request_rejected(&mut self, peer: SocketAddr, block: BlockInfo) {
        let Some(download) = self.downloads.get_mut(&block.piece_index) else {
            return;
        };
        if let Some(assigned) = download.assigned.get_mut(&peer) {
            assigned.remove(&block.offset);
        }
        if download.is_untouched() {
            self.downloads.remove(&block.piece_index);
            if self.status[block.piece_index as usize] == PieceStatus::Need {
                self.need.push(block.piece_index);
            }
        }
    }

    /// Makes a piece downloadable again after its file was promoted out of
    /// `Skip` priority and the stored data failed (or never had) a hash.
    pub fn reset_piece(&mut self, piece: u32) {
        if let Some(slot) = self.status.get_mut(piece as usize) {
            *slot = PieceStatus::Need;
        }
        if !self.need.contains(&piece) && !self.downloads.contains_key(&piece) {
            self.need.push(piece);
        }
    }

    /// Verification verdict for a fully written piece.
    pub fn piece_hashed(&mut self, piece: u32, passed: bool) {
        if passed {
            self.set_piece_done(piece);
        } else {
            event!(Level::DEBUG, piece, "discarding failed piece download");
            self.downloads.remove(&piece);
            if self.status[piece as usize] == PieceStatus::Need && !self.need.contains(&piece) {
                self.need.push(piece);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{n}:6881").parse().unwrap()
    }

    fn full_bitfield(pieces: usize) -> Bitfield {
        let mut bf = Bitfield::new(pieces);
        bf.set_all();
        bf
    }

    fn picker() -> PiecePicker {
        // 4 pieces of 32 KiB (2 blocks each), last piece 1 block.
        PiecePicker::new(PieceLayout::new(32_768, 3 * 32_768 + 10_000))
    }

    #[test]
    fn requests_respect_limit_and_do_not_repeat() {
        let mut picker = picker();
        let peer = addr(1);
        let bitfield = full_bitfield(4);

        let first = picker.take_requests(peer, &bitfield, 3);
        assert_eq!(first.len(), 3);
        let second = picker.take_requests(peer, &bitfield, 10);
        assert_eq!(second.len(), 4);

        let all: Vec<_> = first.into_iter().chain(second).collect();
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
    }

    #[test]
    fn rarest_piece_is_started_first() {
        let mut picker = picker();
        let mut common = full_bitfield(4);
        common.clear(2);
        let mut rare_holder = Bitfield::new(4);
        rare_holder.set(2);

        let holders = vec![common.clone(), common.clone(), rare_holder.clone()];
        picker.update_rarity(holders.iter());

        let picked = picker.take_requests(addr(3), &rare_holder, 1);
        assert_eq!(picked[0].piece_index, 2);
    }

    #[test]
    fn final_block_reports_contributors_in_order() {
        let mut picker = picker();
        let bitfield = full_bitfield(4);
        let a = addr(1);
        let b = addr(2);
        let blocks = picker.take_requests(a, &bitfield, 2);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].piece_index, blocks[1].piece_index);

        let first = picker.piece_data_received(b, blocks[0]);
        assert!(first.accepted);
        assert_eq!(first.contributing, None);

        let last = picker.piece_data_received(a, blocks[1]);
        assert!(last.accepted);
        assert_eq!(last.contributing, Some(vec![b, a]));
    }

    #[test]
    fn duplicate_and_out_of_bounds_blocks_are_rejected() {
        let mut picker = picker();
        let peer = addr(1);
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            length: 16_384,
        };
        assert!(picker.piece_data_received(peer, block).accepted);
        assert!(!picker.piece_data_received(peer, block).accepted);

        let bogus = BlockInfo {
            piece_index: 0,
            offset: 30_000,
            length: 16_384,
        };
        assert!(!picker.piece_data_received(peer, bogus).accepted);
    }

    #[test]
    fn cancel_requeues_untouched_pieces() {
        let mut picker = picker();
        let peer = addr(1);
        let bitfield = full_bitfield(4);
        let picked = picker.take_requests(peer, &bitfield, 2);
        assert_eq!(picker.cancel_requests(peer), picked.len());

        // Freed blocks are offered again.
        let again = picker.take_requests(addr(2), &bitfield, 2);
        assert_eq!(again, picked);
    }

    #[test]
    fn failed_hash_makes_piece_downloadable_again() {
        let mut picker = picker();
        let peer = addr(1);
        let bitfield = full_bitfield(4);
        let blocks = picker.take_requests(peer, &bitfield, 2);
        let piece = blocks[0].piece_index;
        for block in &blocks {
            picker.piece_data_received(peer, *block);
        }

        picker.piece_hashed(piece, false);
        assert!(!picker.is_piece_done(piece));
        let again = picker.take_requests(peer, &bitfield, 2);
        assert!(again.iter().all(|b| b.piece_index == piece));

        picker.piece_hashed(piece, true);
        assert!(picker.is_piece_done(piece));
        assert!(!picker.is_interesting(&{
            let mut only = Bitfield::new(4);
            only.set(piece as usize);
            only
        }));
    }
}

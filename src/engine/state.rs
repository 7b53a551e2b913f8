// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{event, Level};

use crate::announce::Discovery;
use crate::bitfield::Bitfield;
use crate::choker::Unchoker;
use crate::config::Settings;
use crate::errors::TorrentFault;
use crate::events::{EventSink, TorrentEvent};
use crate::hashes::{InfoHash, PieceHashStore};
use crate::layout::PieceLayout;
use crate::picker::PiecePicker;
use crate::wire::Message;

use super::mode::{Mode, Phase};
use super::peer::PeerSession;

/// Download priority of one file. `Skip` files are not fetched and their
/// pieces are left unhashed by the initial check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilePriority {
    Skip,
    #[default]
    Normal,
    High,
}

/// A file's piece span and current priority.
#[derive(Debug, Clone)]
pub struct FileSlot {
    pub first_piece: u32,
    pub last_piece: u32,
    pub priority: FilePriority,
}

/// Progress of one piece between "first block written" and "all blocks
/// written". An entry exists iff at least one but not all blocks are on disk.
#[derive(Debug, Default)]
pub struct PieceProgress {
    pub blocks_written: u32,
    /// Captured from the first non-empty contributing list the picker hands
    /// back (it only does so with the piece's final block).
    pub contributors: Option<Vec<SocketAddr>>,
}

/// Everything the engine knows about one torrent. Owned by the engine task
/// behind the exclusive section; piece-completion tasks enter the same
/// section for their bookkeeping.
pub struct TorrentState {
    pub info_hash: InfoHash,
    pub hashes: PieceHashStore,
    pub layout: PieceLayout,
    pub private: bool,
    pub settings: Arc<Settings>,

    /// Authoritative bitfield of verified pieces.
    pub have: Bitfield,
    pub picker: PiecePicker,
    pub peers: HashMap<SocketAddr, PeerSession>,
    /// Known-but-unconnected candidates (tracker, PEX); counts against the
    /// connection cap when ingesting PEX.
    pub available: HashSet<SocketAddr>,

    pub mode: Mode,
    pub write_progress: HashMap<u32, PieceProgress>,
    /// Pieces verified but not yet announced with Have.
    pub finished_pieces: Vec<u32>,
    pub hash_failures: u32,

    pub unchoker: Unchoker,
    pub discovery: Discovery,
    pub sink: EventSink,

    /// Bencoded info dictionary when we have metadata (serving BEP 9).
    pub metadata: Option<Bytes>,
    pub files: Vec<FileSlot>,
    /// Latch preventing concurrent pending-file hash passes.
    pub hashing_pending_files: bool,
    /// Pieces the initial hash check skipped because every covering file was
    /// at `Skip` priority.
    pub unhashed_pieces: HashSet<u32>,

    pub web_seeds: Vec<String>,
    pub attempted_web_seeds: HashSet<String>,

    pub download_rate: crate::rate::RateCounter,
    pub upload_rate: crate::rate::RateCounter,
    /// Enforced by the connection layer; kept refilled from the tick.
    pub download_limiter: crate::rate::TokenBucket,
    pub upload_limiter: crate::rate::TokenBucket,
    pub started_at: Instant,
    pub last_inactive_sweep: Option<Instant>,
    pub connected_peers: usize,
    pub connected_seeds: usize,
}

impl TorrentState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info_hash: InfoHash,
        hashes: PieceHashStore,
        layout: PieceLayout,
        private: bool,
        settings: Arc<Settings>,
        discovery: Discovery,
        sink: EventSink,
        metadata: Option<Bytes>,
        files: Vec<FileSlot>,
        web_seeds: Vec<String>,
    ) -> Self {
        let piece_count = layout.piece_count() as usize;
        let download_limiter = crate::rate::TokenBucket::new(settings.download_limit_bps);
        let upload_limiter = crate::rate::TokenBucket::new(settings.upload_limit_bps);
        Self {
            info_hash,
            hashes,
            layout,
            private,
            settings,
            have: Bitfield::new(piece_count),
            picker: PiecePicker::new(layout),
            peers: HashMap::new(),
            available: HashSet::new(),
            mode: Mode::stopped(),
            write_progress: HashMap::new(),
            finished_pieces: Vec::new(),
            hash_failures: 0,
            unchoker: Unchoker::new(),
            discovery,
            sink,
            metadata,
            files,
            hashing_pending_files: false,
            unhashed_pieces: HashSet::new(),
            web_seeds,
            attempted_web_seeds: HashSet::new(),
            download_rate: crate::rate::RateCounter::default(),
            upload_rate: crate::rate::RateCounter::default(),
            download_limiter,
            upload_limiter,
            started_at: Instant::now(),
            last_inactive_sweep: None,
            connected_peers: 0,
            connected_seeds: 0,
        }
    }

    /// Swaps in a new Mode, cancelling everything the old one spawned.
    /// In-flight tasks observe the old token and abort without side effects.
    pub fn set_mode(&mut self, mode: Mode) {
        let old = std::mem::replace(&mut self.mode, mode);
        old.cancel.cancel();
        event!(Level::DEBUG, from = ?old.phase, to = ?self.mode.phase, "mode switch");
        self.sink.emit(TorrentEvent::StateChanged {
            state: self.mode.phase,
        });
    }

    /// Drops into the error state with `fault` as the reason.
    pub fn fail(&mut self, fault: TorrentFault) {
        event!(Level::WARN, ?fault, "torrent entering error state");
        self.set_mode(Mode::error(fault));
        self.sink.emit(TorrentEvent::TorrentError { fault });
    }

    /// Seeding once every piece is verified.
    pub fn phase_for_completion(&self) -> Phase {
        if self.picker.is_complete() {
            Phase::Seeding
        } else {
            Phase::Downloading
        }
    }

    /// Tears one peer down: socket close, picker bookkeeping, counters.
    pub fn cleanup_peer(&mut self, addr: SocketAddr, reason: &'static str) {
        let Some(peer) = self.peers.remove(&addr) else {
            return;
        };
        event!(Level::DEBUG, %addr, reason, "disconnecting peer");
        peer.link.close();
        self.picker.cancel_requests(addr);
        self.unchoker.forget_peer(&addr);
        self.sink.emit(TorrentEvent::PeerDisconnected { addr });
    }

    /// Tops up the request pipeline toward one peer. While choked, only
    /// allowed-fast pieces may be requested, and only from fast peers.
    pub fn fill_requests_for(&mut self, addr: SocketAddr) {
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        if !peer.am_interested {
            return;
        }
        let capacity = peer.request_capacity();
        if capacity == 0 {
            return;
        }
        let is_choking = peer.is_choking;
        let requestable = if is_choking {
            if !peer.supports_fast || peer.allowed_fast_in.is_empty() {
                return;
            }
            // Restrict the view to pieces the peer granted us while choked.
            let mut granted = Bitfield::new(peer.bitfield.len());
            for &piece in &peer.allowed_fast_in {
                if peer.bitfield.get(piece as usize) {
                    granted.set(piece as usize);
                }
            }
            granted
        } else {
            peer.bitfield.clone()
        };

        let blocks = self.picker.take_requests(addr, &requestable, capacity);
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        for block in blocks {
            peer.outstanding_requests += 1;
            peer.enqueue(Message::Request(block));
        }
    }

    /// Re-evaluates `am_interested` toward one peer from the picker's view.
    pub fn refresh_interest(&mut self, addr: SocketAddr) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        let interesting = self.picker.is_interesting(&peer.bitfield);
        peer.set_am_interested(interesting);
    }

    /// Sends the queued `finished_pieces` as Have bundles and clears the
    /// queue. With have-suppression on, peers that already hold a piece are
    /// skipped; peers with nothing to learn get no messages at all.
    pub fn broadcast_finished_pieces(&mut self) {
        if self.finished_pieces.is_empty() {
            return;
        }
        let finished = std::mem::take(&mut self.finished_pieces);
        let suppress = self.settings.allow_have_suppression;

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in &addrs {
            let peer = self.peers.get_mut(addr).expect("peer listed but missing");
            let bundle: Vec<u32> = finished
                .iter()
                .copied()
                .filter(|&piece| !(suppress && peer.bitfield.get(piece as usize)))
                .collect();
            if bundle.is_empty() {
                continue;
            }
            for piece in bundle {
                peer.enqueue(Message::Have { piece });
            }
            peer.try_process_queue();
        }

        // Owning new pieces may change who is still worth talking to.
        for addr in addrs {
            self.refresh_interest(addr);
        }
    }

    /// Records a verified piece exactly once for the next Have broadcast.
    pub fn queue_finished_piece(&mut self, piece: u32) {
        if !self.finished_pieces.contains(&piece) {
            self.finished_pieces.push(piece);
            self.sink.emit(TorrentEvent::PieceFinished { piece });
        }
    }

    /// Connected / seed counters shown to embedders and used by PEX caps.
    pub fn refresh_peer_summary(&mut self) {
        self.connected_peers = self.peers.len();
        self.connected_seeds = self.peers.values().filter(|p| p.is_seeder).count();
    }

    /// Bare state over channel-backed collaborators, for unit tests.
    #[cfg(test)]
    pub fn for_tests(
        layout: PieceLayout,
        hashes: PieceHashStore,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<TorrentEvent>) {
        let (tracker_tx, _tracker_rx) = tokio::sync::mpsc::channel(16);
        let (discovery_tx, _discovery_rx) = tokio::sync::mpsc::channel(16);
        let discovery = Discovery::new(
            tracker_tx,
            discovery_tx,
            std::time::Duration::from_secs(300),
            std::time::Duration::from_secs(900),
        );
        let (sink, events) = EventSink::channel();
        let state = Self::new(
            InfoHash::v1([0xAB; 20]),
            hashes,
            layout,
            false,
            Arc::new(crate::config::Settings::default()),
            discovery,
            sink,
            None,
            Vec::new(),
            Vec::new(),
        );
        (state, events)
    }

    /// Non-synthetic peers, as dialable addresses, for PEX gossip.
    pub fn swarm_view(&self) -> HashSet<SocketAddr> {
        self.peers
            .values()
            .filter(|peer| !peer.synthetic && peer.handshaked)
            .map(|peer| peer.listen_addr())
            .collect()
    }
}

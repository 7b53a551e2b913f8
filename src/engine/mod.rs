// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The per-torrent engine: one task owning all per-peer state, driven by a
//! channel of connection-layer events and a periodic tick.
//!
//! The connection layer handles sockets, handshakes framing and parsing; the
//! engine handles everything above that. They meet at [`EngineEvent`] going
//! in and [`LinkCommand`] going out.

pub mod completion;
pub mod dispatch;
pub mod mode;
pub mod peer;
pub mod state;
pub mod tick;


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{event, Level};

use crate::announce::AnnounceKind;
use crate::buffer::BufferLease;
use crate::disk::DiskHandle;
use crate::sync::Exclusive;
use crate::wire::{BlockInfo, Message};

pub use mode::{Mode, ModeCaps, Phase};
pub use peer::{LinkCommand, PeerLink, PeerSession};
pub use state::{FilePriority, FileSlot, PieceProgress, TorrentState};

/// Everything a connection or lifecycle event can tell the engine.
#[derive(Debug)]
pub enum EngineEvent {
    /// A socket finished connecting (either direction); the wire handshake
    /// follows as a regular frame.
    PeerConnected {
        addr: SocketAddr,
        link: PeerLink,
        /// Peer id the tracker promised, when dialing out.
        expected_id: Option<[u8; 20]>,
        /// Web seeds and other non-wire peers.
        synthetic: bool,
    },
    /// One parsed inbound frame plus its receive-buffer lease.
    Frame {
        addr: SocketAddr,
        message: Message,
        lease: BufferLease,
    },
    PeerClosed {
        addr: SocketAddr,
    },
    /// A disk read for an upload finished (`None` = unreadable).
    UploadComplete {
        addr: SocketAddr,
        block: BlockInfo,
        data: Option<Bytes>,
    },
    HashCheckComplete,
    Start,
    Stop,
    SetFilePriority {
        file: usize,
        priority: FilePriority,
    },
    Shutdown,
}

/// State and collaborators shared with detached tasks.
pub struct EngineShared {
    pub state: Exclusive<TorrentState>,
    pub disk: DiskHandle,
    pub(crate) events_tx: mpsc::Sender<EngineEvent>,
}

/// Cloneable entry point for the connection layer and embedders.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineEvent>,
}

impl EngineHandle {
    pub async fn send(&self, event: EngineEvent) {
        let _ = self.tx.send(event).await;
    }

    pub async fn start(&self) {
        self.send(EngineEvent::Start).await;
    }

    pub async fn stop(&self) {
        self.send(EngineEvent::Stop).await;
    }

    pub async fn shutdown(&self) {
        self.send(EngineEvent::Shutdown).await;
    }
}

/// The engine task. Construct with [`Engine::new`], then `tokio::spawn` the
/// future returned by [`Engine::run`].
pub struct Engine {
    shared: Arc<EngineShared>,
    events_rx: mpsc::Receiver<EngineEvent>,
    tick_interval: Duration,
    ticks_per_second: u64,
}

impl Engine {
    pub fn new(state: TorrentState, disk: DiskHandle) -> (Self, EngineHandle) {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let tick_interval = Duration::from_millis(state.settings.tick_interval_ms);
        let ticks_per_second = state.settings.ticks_per_second();
        let shared = Arc::new(EngineShared {
            state: Exclusive::new(state),
            disk,
            events_tx: events_tx.clone(),
        });
        (
            Self {
                shared,
                events_rx,
                tick_interval,
                ticks_per_second,
            },
            EngineHandle { tx: events_tx },
        )
    }

    pub fn shared(&self) -> Arc<EngineShared> {
        self.shared.clone()
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut counter: u64 = 0;

        loop {
            tokio::select! {
                maybe_event = self.events_rx.recv() => {
                    match maybe_event {
                        Some(EngineEvent::Shutdown) | None => {
                            self.on_stop().await;
                            break;
                        }
                        Some(event) => self.on_event(event).await,
                    }
                }
                _ = ticker.tick() => {
                    counter += 1;
                    self.tick(counter).await;
                }
            }
        }
        event!(Level::DEBUG, "engine loop ended");
    }

    async fn on_event(&mut self, incoming: EngineEvent) {
        match incoming {
            EngineEvent::PeerConnected {
                addr,
                link,
                expected_id,
                synthetic,
            } => {
                let mut state = self.shared.state.enter().await;
                if !state.mode.caps.can_accept_connections {
                    link.close();
                    return;
                }
                if state.peers.contains_key(&addr) {
                    event!(Level::DEBUG, %addr, "duplicate connection dropped");
                    link.close();
                    return;
                }
                let piece_count = state.layout.piece_count() as usize;
                let mut session = PeerSession::new(addr, link, piece_count);
                session.id = expected_id;
                session.synthetic = synthetic;
                state.peers.insert(addr, session);
                state.available.remove(&addr);
            }
            EngineEvent::Frame {
                addr,
                message,
                lease,
            } => self.on_frame(addr, message, lease).await,
            EngineEvent::PeerClosed { addr } => {
                let mut state = self.shared.state.enter().await;
                state.cleanup_peer(addr, "socket closed");
            }
            EngineEvent::UploadComplete { addr, block, data } => {
                let mut state = self.shared.state.enter().await;
                let Some(peer) = state.peers.get_mut(&addr) else {
                    return;
                };
                if !peer.pending_uploads.remove(&block) {
                    // Canceled while the read was in flight; drop the data.
                    return;
                }
                peer.requests_from_peer = peer.requests_from_peer.saturating_sub(1);
                match data {
                    Some(data) => {
                        let len = data.len() as u64;
                        peer.upload.add(len);
                        peer.enqueue(Message::Piece {
                            index: block.piece_index,
                            begin: block.offset,
                            data,
                        });
                        peer.try_process_queue();
                        state.upload_rate.add(len);
                    }
                    None => {
                        if peer.supports_fast {
                            peer.enqueue(Message::Reject(block));
                            peer.try_process_queue();
                        }
                    }
                }
            }
            EngineEvent::Start => self.on_start().await,
            EngineEvent::HashCheckComplete => {
                let mut state = self.shared.state.enter().await;
                if state.mode.phase != Phase::Hashing {
                    return;
                }
                state.set_mode(Mode::starting());
                state
                    .discovery
                    .announce(AnnounceKind::Started, state.mode.cancel.clone());
                let next = state.phase_for_completion();
                state.set_mode(match next {
                    Phase::Seeding => Mode::seeding(),
                    _ => Mode::downloading(),
                });
            }
            EngineEvent::Stop => self.on_stop().await,
            EngineEvent::SetFilePriority { file, priority } => {
                let mut state = self.shared.state.enter().await;
                if let Some(slot) = state.files.get_mut(file) {
                    slot.priority = priority;
                }
            }
            EngineEvent::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    /// One inbound frame. Piece frames fork into the async write path; all
    /// others dispatch synchronously.
    async fn on_frame(&mut self, addr: SocketAddr, message: Message, lease: BufferLease) {
        event!(Level::TRACE, %addr, frame = ?crate::wire::MessageSummary(&message));
        let mut state = self.shared.state.enter().await;
        if !state.mode.caps.can_handle_messages {
            // Silent no-op; dropping the lease runs the buffer release.
            return;
        }

        if let Message::Piece { index, begin, data } = message {
            self.on_piece(&mut state, addr, index, begin, data, lease);
            return;
        }

        match state.handle_frame_sync(addr, message) {
            Ok(dispatch::Followup::None) => {}
            Ok(dispatch::Followup::StartUpload(block)) => {
                let disk = self.shared.disk.clone();
                let events_tx = self.shared.events_tx.clone();
                let cancel = state.mode.cancel.clone();
                tokio::spawn(async move {
                    let data = disk.read(block).await.ok().map(Bytes::from);
                    if cancel.is_cancelled() {
                        return;
                    }
                    let _ = events_tx
                        .send(EngineEvent::UploadComplete { addr, block, data })
                        .await;
                });
            }
            Err(violation) => {
                event!(Level::DEBUG, %addr, %violation, "peer misbehaved");
                state.cleanup_peer(addr, "protocol violation");
                return;
            }
        }

        if let Some(peer) = state.peers.get_mut(&addr) {
            peer.try_process_queue();
        }
    }

    /// Steps 1-2 of the completion pipeline, then hands off to the detached
    /// write task which carries the buffer lease.
    fn on_piece(
        &self,
        state: &mut TorrentState,
        addr: SocketAddr,
        index: u32,
        begin: u32,
        data: Bytes,
        lease: BufferLease,
    ) {
        let block = BlockInfo {
            piece_index: index,
            offset: begin,
            length: data.len() as u32,
        };
        let Some(peer) = state.peers.get_mut(&addr) else {
            return;
        };
        if !peer.handshaked {
            state.cleanup_peer(addr, "piece before handshake");
            return;
        }
        let now = Instant::now();
        let peer = state.peers.get_mut(&addr).expect("session checked above");
        peer.pieces_received += 1;
        peer.last_message_received = now;
        peer.last_block_received = now;
        peer.download.add(data.len() as u64);
        state.download_rate.add(data.len() as u64);

        let receipt = state.picker.piece_data_received(addr, block);
        if receipt.requested {
            if let Some(peer) = state.peers.get_mut(&addr) {
                peer.outstanding_requests = peer.outstanding_requests.saturating_sub(1);
            }
        }
        if !receipt.accepted {
            // Rejected block: release the buffer immediately.
            drop(lease);
            return;
        }

        let job = completion::BlockJob {
            from: addr,
            block,
            contributing: receipt.contributing,
        };
        let cancel = state.mode.cancel.clone();
        tokio::spawn(completion::write_and_account(
            self.shared.clone(),
            cancel,
            job,
            data,
            lease,
        ));

        // Keep the pipeline full toward this peer.
        state.fill_requests_for(addr);
        if let Some(peer) = state.peers.get_mut(&addr) {
            peer.try_process_queue();
        }
    }

    async fn on_start(&mut self) {
        let mut state = self.shared.state.enter().await;
        if !matches!(state.mode.phase, Phase::Stopped | Phase::Error) {
            return;
        }
        state.set_mode(Mode::hashing());
        state.started_at = Instant::now();

        // Pieces covered exclusively by do-not-download files are skipped
        // now and picked up by the pending-file pass if promoted later.
        let piece_count = state.layout.piece_count();
        let mut to_check = Vec::new();
        state.unhashed_pieces.clear();
        for piece in 0..piece_count {
            if piece_wanted(&state.files, piece) {
                to_check.push(piece);
            } else {
                state.unhashed_pieces.insert(piece);
                state.picker.set_piece_done(piece);
            }
        }

        let cancel = state.mode.cancel.clone();
        tokio::spawn(completion::initial_hash_check(
            self.shared.clone(),
            cancel,
            to_check,
        ));
    }

    async fn on_stop(&mut self) {
        let mut state = self.shared.state.enter().await;
        if state.mode.phase == Phase::Stopped {
            return;
        }
        state
            .discovery
            .announce(AnnounceKind::Stopped, state.mode.cancel.clone());
        let addrs: Vec<SocketAddr> = state.peers.keys().copied().collect();
        for addr in addrs {
            state.cleanup_peer(addr, "torrent stopped");
        }
        state.set_mode(Mode::stopped());
    }
}

/// A piece is wanted unless every file covering it is at `Skip` priority.
/// Torrents without a file table want everything.
fn piece_wanted(files: &[FileSlot], piece: u32) -> bool {
    if files.is_empty() {
        return true;
    }
    files
        .iter()
        .any(|f| f.priority != FilePriority::Skip && f.first_piece <= piece && piece <= f.last_piece)
}

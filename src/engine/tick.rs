// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The periodic tick: pre-logic, mode-logic, post-logic, in that order.
//! All timeouts compare monotonic timer deltas here; nothing is scheduled by
//! wall clock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{event, Level};

use crate::announce::AnnounceKind;
use crate::choker::ChokeView;
use crate::pex::{PexFlags, PexPayload, PexPeer};
use crate::wire::{ClientExtendedId, Message};

use super::mode::Phase;
use super::peer::{DEFAULT_PEER_REQQ, MIN_PENDING_REQUESTS};
use super::state::{FilePriority, TorrentState};
use super::{completion, Engine};

/// Enqueue a KeepAlive after this much outbound silence.
pub const KEEPALIVE_AFTER: Duration = Duration::from_secs(90);
/// Disconnect after this much inbound silence.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(180);
/// Disconnect when requests are outstanding but no block arrives for this
/// long.
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(15);
/// Inactive-peer sweeps run at most this often.
const INACTIVE_SWEEP_EVERY: Duration = Duration::from_secs(5);
/// Mutually disinterested peers older than this are swept.
const INACTIVE_PEER_AGE: Duration = Duration::from_secs(60);

impl Engine {
    pub(crate) async fn tick(&mut self, counter: u64) {
        let mut state = self.shared.state.enter().await;
        if !state.mode.is_transferring() {
            return;
        }
        let now = Instant::now();

        // ---- pre-logic ----
        if state.mode.caps.can_hash_check && !state.hashing_pending_files {
            let pending = state.pending_hash_candidates();
            if !pending.is_empty() {
                state.hashing_pending_files = true;
                tokio::spawn(completion::hash_pending_files(
                    self.shared.clone(),
                    state.mode.cancel.clone(),
                    pending,
                ));
            }
        }
        state.pre_logic(counter, self.ticks_per_second, now);

        // ---- mode-logic ----
        if state.mode.phase == Phase::Downloading {
            for url in state.due_web_seeds(now) {
                crate::webseed::spawn_worker(
                    self.shared.clone(),
                    url,
                    state.info_hash.wire_bytes(),
                    state.layout,
                    state.mode.cancel.clone(),
                );
            }
        }
        state.mode_logic(now);

        // ---- post-logic ----
        state.post_logic(now);
    }
}

impl TorrentState {
    /// Announce cadences, rate bookkeeping, Have broadcast, per-peer
    /// housekeeping. Runs before any mode-dependent policy.
    pub(crate) fn pre_logic(&mut self, counter: u64, ticks_per_second: u64, now: Instant) {
        self.discovery.run_periodic(now);

        if counter % ticks_per_second.max(1) == 0 {
            self.download_rate.tick();
            self.upload_rate.tick();
            self.download_limiter.refill(now);
            self.upload_limiter.refill(now);
            for peer in self.peers.values_mut() {
                peer.download.tick();
                peer.upload.tick();
            }
        }

        self.refresh_peer_summary();
        self.broadcast_finished_pieces();
        self.drive_pex(now);
        self.recompute_request_allowances();
    }

    /// Downloading/seeding policy differences plus the choke review.
    pub(crate) fn mode_logic(&mut self, now: Instant) {
        if self.mode.phase == Phase::Downloading {
            self.sweep_inactive_peers(now);
        }

        let seeding = self.mode.phase == Phase::Seeding;
        let views: Vec<ChokeView> = self
            .peers
            .values()
            .filter(|peer| peer.handshaked && !peer.synthetic)
            .map(|peer| ChokeView {
                addr: peer.addr,
                interested: peer.is_interested,
                am_choking: peer.am_choking,
                download_rate: peer.download.rate(),
                upload_rate: peer.upload.rate(),
            })
            .collect();
        for (addr, unchoke) in self.unchoker.unchoke_review(&views, seeding) {
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.set_am_choking(!unchoke);
                peer.try_process_queue();
            }
        }
    }

    /// Queue drains, keep-alives, inactivity disconnects, request top-up and
    /// the periodic tracker ping.
    pub(crate) fn post_logic(&mut self, now: Instant) {
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            let (sent_silence, recv_silence, block_silence, outstanding) = {
                let Some(peer) = self.peers.get_mut(&addr) else {
                    continue;
                };
                peer.try_process_queue();
                (
                    now.saturating_duration_since(peer.last_message_sent),
                    now.saturating_duration_since(peer.last_message_received),
                    now.saturating_duration_since(peer.last_block_received),
                    peer.outstanding_requests,
                )
            };

            if sent_silence > KEEPALIVE_AFTER {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.enqueue(Message::KeepAlive);
                    peer.try_process_queue();
                }
            }
            if recv_silence > RECEIVE_TIMEOUT {
                self.cleanup_peer(addr, "inbound silence");
                continue;
            }
            if outstanding > 0 && block_silence > BLOCK_TIMEOUT {
                self.cleanup_peer(addr, "requests starved");
            }
        }

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.fill_requests_for(addr);
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.try_process_queue();
            }
        }

        if self.mode.is_transferring() {
            // The tracker transport applies its own announce intervals; this
            // is only the trigger.
            self.discovery
                .announce(AnnounceKind::None, self.mode.cancel.clone());
        }
    }

    /// Runs each peer's PEX sub-agent that is due, sending added/dropped
    /// deltas of the current swarm view.
    fn drive_pex(&mut self, now: Instant) {
        let swarm = self.swarm_view();
        let seed_flags: HashMap<SocketAddr, bool> = self
            .peers
            .values()
            .filter(|peer| !peer.synthetic && peer.handshaked)
            .map(|peer| (peer.listen_addr(), peer.is_seeder))
            .collect();

        for peer in self.peers.values_mut() {
            let own_addr = peer.listen_addr();
            let Some(their_pex_id) = peer
                .extended
                .as_ref()
                .and_then(|ext| ext.peer_id_for(ClientExtendedId::UtPex))
            else {
                continue;
            };
            let Some(agent) = peer.pex.as_mut() else {
                continue;
            };
            if !agent.due(now) {
                continue;
            }

            let mut view = swarm.clone();
            view.remove(&own_addr);
            let (added, dropped) = agent.delta(&view, now);
            if added.is_empty() && dropped.is_empty() {
                continue;
            }
            let added: Vec<PexPeer> = added
                .into_iter()
                .map(|addr| PexPeer {
                    addr,
                    flags: PexFlags {
                        seed: seed_flags.get(&addr).copied().unwrap_or(false),
                        ..Default::default()
                    },
                })
                .collect();
            let payload = PexPayload::from_deltas(&added, &dropped);
            let Ok(raw) = serde_bencode::to_bytes(&payload) else {
                continue;
            };
            peer.enqueue(Message::Extended {
                id: their_pex_id,
                payload: Bytes::from(raw),
            });
        }
    }

    /// `clamp(2, base + rate_kB / bonus_per_kB, advertised)` per peer.
    fn recompute_request_allowances(&mut self) {
        let base = self.settings.base_request_queue;
        let bonus_per_kb = self.settings.request_bonus_per_kb.max(1);
        for peer in self.peers.values_mut() {
            let rate_kb = (peer.download.rate() / 1024) as u32;
            let computed = base.saturating_add(rate_kb / bonus_per_kb);
            let cap = peer.peer_reqq.unwrap_or(DEFAULT_PEER_REQQ);
            peer.max_pending_requests =
                computed.clamp(MIN_PENDING_REQUESTS, cap.max(MIN_PENDING_REQUESTS));
        }
    }

    /// Disconnects mutually disinterested peers that have hung around with
    /// no traffic; runs at most every five seconds.
    fn sweep_inactive_peers(&mut self, now: Instant) {
        if let Some(last) = self.last_inactive_sweep {
            if now.saturating_duration_since(last) < INACTIVE_SWEEP_EVERY {
                return;
            }
        }
        self.last_inactive_sweep = Some(now);

        let stale: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|peer| {
                peer.handshaked
                    && !peer.synthetic
                    && !peer.am_interested
                    && !peer.is_interested
                    && peer.pieces_received == 0
                    && now.saturating_duration_since(peer.connected_at) > INACTIVE_PEER_AGE
            })
            .map(|peer| peer.addr)
            .collect();
        for addr in stale {
            self.cleanup_peer(addr, "inactive");
        }
    }

    /// Pieces the initial check skipped whose files are now downloadable.
    pub(crate) fn pending_hash_candidates(&self) -> Vec<u32> {
        if self.unhashed_pieces.is_empty() {
            return Vec::new();
        }
        let mut pieces = Vec::new();
        for file in &self.files {
            if file.priority == FilePriority::Skip {
                continue;
            }
            let boundary_unhashed = self.unhashed_pieces.contains(&file.first_piece)
                || self.unhashed_pieces.contains(&file.last_piece);
            if !boundary_unhashed {
                continue;
            }
            for piece in file.first_piece..=file.last_piece {
                if self.unhashed_pieces.contains(&piece) && !pieces.contains(&piece) {
                    pieces.push(piece);
                }
            }
        }
        pieces
    }

    /// Web seed URLs that should be attached now: past the start delay, with
    /// the sustained download rate under the trigger, each tried only once.
    pub(crate) fn due_web_seeds(&mut self, now: Instant) -> Vec<String> {
        if self.web_seeds.is_empty() {
            return Vec::new();
        }
        if now.saturating_duration_since(self.started_at)
            < Duration::from_secs(self.settings.web_seed_delay_secs)
        {
            return Vec::new();
        }
        if self.download_rate.rate() >= self.settings.web_seed_speed_trigger_bps {
            return Vec::new();
        }
        let due: Vec<String> = self
            .web_seeds
            .iter()
            .filter(|url| !self.attempted_web_seeds.contains(*url))
            .cloned()
            .collect();
        for url in &due {
            event!(Level::DEBUG, url = %url, "attaching web seed");
            self.attempted_web_seeds.insert(url.clone());
        }
        due
    }
}

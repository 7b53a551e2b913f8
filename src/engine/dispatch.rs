// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Synchronous message dispatch. One inbound frame in, per-peer state
//! mutations and queued outbound traffic out. The only suspending path,
//! Piece, is intercepted by the engine before this module runs.

use std::time::Instant;

use bytes::Bytes;
use std::net::SocketAddr;
use tracing::{event, Level};

use crate::allowed_fast::allowed_fast_set;
use crate::bitfield::Bitfield;
use crate::errors::PeerError;
use crate::events::TorrentEvent;
use crate::pex::PexPayload;
use crate::wire::{
    BlockInfo, ClientExtendedId, ExtendedHandshakePayload, Handshake, Message, MetadataMessage,
};

use super::state::TorrentState;

/// Request length bounds; the final piece is exempt because its tail block
/// is allowed to be arbitrarily short.
pub const MIN_REQUEST_LEN: u32 = 4_096;
pub const MAX_REQUEST_LEN: u32 = 131_072;

/// Clients matching this prefix underreport `reqq`; their real tolerance is
/// at least this floor.
const LEGACY_REQQ_CLIENTS: &[&str] = &["\u{b5}Torrent 1.", "uTorrent 1."];
const LEGACY_REQQ_FLOOR: u32 = 192;

const METADATA_BLOCK: usize = 16_384;

/// Work the engine must carry out after a synchronous dispatch.
#[derive(Debug, PartialEq, Eq)]
pub enum Followup {
    None,
    /// Read this block from disk and queue a Piece reply when it arrives.
    StartUpload(BlockInfo),
}

impl TorrentState {
    /// Dispatches one non-Piece frame from `addr`.
    ///
    /// An `Err` means the peer broke protocol and must be disconnected; the
    /// torrent itself is unaffected.
    pub fn handle_frame_sync(
        &mut self,
        addr: SocketAddr,
        message: Message,
    ) -> Result<Followup, PeerError> {
        let Some(peer) = self.peers.get_mut(&addr) else {
            // The socket raced its own teardown; nothing to do.
            return Ok(Followup::None);
        };
        peer.last_message_received = Instant::now();

        if let Message::Handshake(handshake) = message {
            return self.on_handshake(addr, handshake).map(|_| Followup::None);
        }
        if !peer.handshaked {
            return Err(PeerError::ProtocolViolation("message before handshake"));
        }
        if message.is_fast_family() && !peer.supports_fast {
            return Err(PeerError::ProtocolViolation(
                "peer does not support fast-peer",
            ));
        }
        if let Message::Extended { id, .. } = &message {
            if *id != ClientExtendedId::Handshake.id() && !peer.supports_extended {
                return Err(PeerError::ProtocolViolation(
                    "peer does not support extension messages",
                ));
            }
        }

        match message {
            Message::KeepAlive => Ok(Followup::None),
            Message::Bitfield(raw) => self.on_bitfield(addr, &raw).map(|_| Followup::None),
            Message::Have { piece } => self.on_have(addr, piece).map(|_| Followup::None),
            Message::HaveAll => self.on_have_all(addr, true).map(|_| Followup::None),
            Message::HaveNone => self.on_have_all(addr, false).map(|_| Followup::None),
            Message::Choke => self.on_choke(addr, true).map(|_| Followup::None),
            Message::Unchoke => self.on_choke(addr, false).map(|_| Followup::None),
            Message::Interested => {
                peer.is_interested = true;
                Ok(Followup::None)
            }
            Message::NotInterested => {
                peer.is_interested = false;
                Ok(Followup::None)
            }
            Message::Request(block) => self.on_request(addr, block),
            Message::Cancel(block) => {
                if peer.remove_queued_piece(&block) || peer.pending_uploads.remove(&block) {
                    peer.requests_from_peer = peer.requests_from_peer.saturating_sub(1);
                }
                Ok(Followup::None)
            }
            Message::Reject(block) => {
                peer.outstanding_requests = peer.outstanding_requests.saturating_sub(1);
                self.picker.request_rejected(addr, block);
                Ok(Followup::None)
            }
            Message::Suggest { piece } => {
                peer.suggested.insert(piece);
                Ok(Followup::None)
            }
            Message::AllowedFast { piece } => {
                if !self.have.get(piece as usize) {
                    peer.allowed_fast_in.insert(piece);
                }
                Ok(Followup::None)
            }
            Message::Port(port) => {
                peer.dht_port = Some(port);
                Ok(Followup::None)
            }
            Message::Extended { id, payload } => {
                self.on_extended(addr, id, &payload).map(|_| Followup::None)
            }
            Message::HashRequest(span) => {
                // Reject-all default; a Mode that serves hashes flips the
                // capability and answers before we get here.
                if !self.mode.caps.serves_hashes {
                    peer.enqueue(Message::HashReject(span));
                }
                Ok(Followup::None)
            }
            Message::Hashes { .. } | Message::HashReject(_) => Ok(Followup::None),
            Message::Unknown { id } => Err(PeerError::UnsupportedMessage(id)),
            Message::Handshake(_) | Message::Piece { .. } => unreachable!("handled above"),
        }
    }

    fn on_handshake(&mut self, addr: SocketAddr, handshake: Handshake) -> Result<(), PeerError> {
        if !self.info_hash.matches_wire(&handshake.info_hash) {
            return Err(PeerError::UnknownInfoHash);
        }

        let granted = allowed_fast_set(&self.info_hash, addr.ip(), self.layout.piece_count());
        let have_all = self.have.all();
        let have_none = self.have.none();
        let have_wire = self.have.to_wire();
        let metadata_size = self.metadata.as_ref().map(|raw| raw.len() as i64);
        let allow_pex = !self.private && self.settings.allow_peer_exchange;
        let listen_port = self.settings.listen_port;
        let private = self.private;

        let Some(peer) = self.peers.get_mut(&addr) else {
            return Ok(());
        };
        if peer.handshaked {
            return Err(PeerError::ProtocolViolation("duplicate handshake"));
        }

        match peer.id {
            None => peer.id = Some(handshake.peer_id),
            Some(expected) if expected != handshake.peer_id => {
                if private {
                    return Err(PeerError::ProtocolViolation("peer id mismatch"));
                }
                // Public swarms lie about peer ids all the time; trust the
                // handshake over the tracker.
                peer.id = Some(handshake.peer_id);
            }
            Some(_) => {}
        }

        peer.handshaked = true;
        peer.supports_fast = handshake.supports_fast_peer();
        peer.supports_extended = handshake.supports_extension_protocol();
        peer.allowed_fast_out = granted.iter().copied().collect();

        // Bootstrap bundle, queued atomically: availability, extended
        // handshake, allowed-fast grants.
        if peer.supports_fast && have_none {
            peer.enqueue(Message::HaveNone);
        } else if peer.supports_fast && have_all {
            peer.enqueue(Message::HaveAll);
        } else {
            peer.enqueue(Message::Bitfield(have_wire));
        }
        if peer.supports_extended {
            let payload = ExtendedHandshakePayload::ours(listen_port, metadata_size, allow_pex);
            let raw = serde_bencode::to_bytes(&payload)
                .map_err(|_| PeerError::InvalidMessage("extended handshake encode"))?;
            peer.enqueue(Message::Extended {
                id: ClientExtendedId::Handshake.id(),
                payload: Bytes::from(raw),
            });
        }
        if peer.supports_fast {
            for piece in granted {
                peer.enqueue(Message::AllowedFast { piece });
            }
        }
        peer.try_process_queue();

        event!(
            Level::DEBUG,
            %addr,
            fast = peer.supports_fast,
            extended = peer.supports_extended,
            "handshake complete"
        );
        self.sink.emit(TorrentEvent::PeerConnected { addr });
        Ok(())
    }

    fn on_bitfield(&mut self, addr: SocketAddr, raw: &[u8]) -> Result<(), PeerError> {
        let piece_count = self.layout.piece_count() as usize;
        let bitfield = Bitfield::from_wire(raw, piece_count)
            .ok_or(PeerError::ProtocolViolation("malformed bitfield"))?;
        let peer = self.peers.get_mut(&addr).expect("dispatch without session");
        peer.is_seeder = bitfield.all();
        peer.bitfield = bitfield;
        self.refresh_interest(addr);
        Ok(())
    }

    fn on_have(&mut self, addr: SocketAddr, piece: u32) -> Result<(), PeerError> {
        if piece >= self.layout.piece_count() {
            return Err(PeerError::ProtocolViolation("have index out of range"));
        }
        let piece_length = self.layout.piece_length as u64;
        let we_have = self.have.get(piece as usize);
        let peer = self.peers.get_mut(&addr).expect("dispatch without session");
        peer.bitfield.set(piece as usize);
        peer.is_seeder = peer.bitfield.all();
        peer.estimated_downloaded_bytes += piece_length;
        if !we_have {
            peer.set_am_interested(true);
        }
        Ok(())
    }

    fn on_have_all(&mut self, addr: SocketAddr, all: bool) -> Result<(), PeerError> {
        let peer = self.peers.get_mut(&addr).expect("dispatch without session");
        if all {
            peer.bitfield.set_all();
            peer.is_seeder = true;
        } else {
            peer.bitfield.clear_all();
            peer.is_seeder = false;
        }
        self.refresh_interest(addr);
        Ok(())
    }

    fn on_choke(&mut self, addr: SocketAddr, choked: bool) -> Result<(), PeerError> {
        let peer = self.peers.get_mut(&addr).expect("dispatch without session");
        peer.is_choking = choked;
        if choked {
            // Without fast-peer there are no Reject messages coming; every
            // outstanding request is implicitly dead.
            if !peer.supports_fast {
                peer.outstanding_requests = 0;
                self.picker.cancel_requests(addr);
            }
        } else {
            self.fill_requests_for(addr);
        }
        Ok(())
    }

    fn on_request(&mut self, addr: SocketAddr, block: BlockInfo) -> Result<Followup, PeerError> {
        let last_piece = self.layout.is_last_piece(block.piece_index);
        if !self
            .layout
            .block_in_bounds(block.piece_index, block.offset, block.length)
        {
            return Err(PeerError::ProtocolViolation("request out of bounds"));
        }
        if !last_piece && !(MIN_REQUEST_LEN..=MAX_REQUEST_LEN).contains(&block.length) {
            return Err(PeerError::ProtocolViolation("request length out of bounds"));
        }

        let peer = self.peers.get_mut(&addr).expect("dispatch without session");
        let may_serve = !peer.am_choking
            || (peer.supports_fast && peer.allowed_fast_out.contains(&block.piece_index));
        if !may_serve {
            peer.enqueue(Message::Reject(block));
            return Ok(Followup::None);
        }
        if peer.pending_uploads.contains(&block) {
            return Ok(Followup::None);
        }
        peer.requests_from_peer += 1;
        peer.pending_uploads.insert(block);
        Ok(Followup::StartUpload(block))
    }

    fn on_extended(&mut self, addr: SocketAddr, id: u8, payload: &[u8]) -> Result<(), PeerError> {
        if id == ClientExtendedId::Handshake.id() {
            return self.on_extended_handshake(addr, payload);
        }
        if id == ClientExtendedId::UtMetadata.id() {
            return self.on_metadata(addr, payload);
        }
        if id == ClientExtendedId::UtPex.id() {
            return self.on_pex(addr, payload);
        }
        // lt_chat and anything else we never advertised: ignore.
        Ok(())
    }

    fn on_extended_handshake(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), PeerError> {
        let handshake: ExtendedHandshakePayload = serde_bencode::from_bytes(payload)
            .map_err(|_| PeerError::ProtocolViolation("malformed extended handshake"))?;

        let attach_pex = handshake.peer_id_for(ClientExtendedId::UtPex).is_some()
            && !self.private
            && self.settings.allow_peer_exchange
            && self.metadata.is_some();

        let peer = self.peers.get_mut(&addr).expect("dispatch without session");
        peer.listen_port = handshake.p;
        if let Some(reqq) = handshake.reqq {
            // Advertisements of zero or less carry no information.
            if reqq > 0 {
                let mut reqq = reqq.min(u32::MAX as i64) as u32;
                if underreports_reqq(handshake.v.as_deref()) {
                    reqq = reqq.max(LEGACY_REQQ_FLOOR);
                }
                peer.peer_reqq = Some(reqq);
            }
        }
        if attach_pex && peer.pex.is_none() {
            peer.pex = Some(super::peer::PexAgent::new());
        }
        peer.extended = Some(handshake);
        Ok(())
    }

    fn on_metadata(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), PeerError> {
        // Data messages carry raw bytes after the header and fail a strict
        // decode; we only ever answer requests, so those are ignored.
        let Ok(request) = serde_bencode::from_bytes::<MetadataMessage>(payload) else {
            return Ok(());
        };
        if request.msg_type != MetadataMessage::REQUEST {
            return Ok(());
        }

        let response = match &self.metadata {
            Some(metadata) => {
                let start = request.piece * METADATA_BLOCK;
                if start >= metadata.len() {
                    MetadataReply::Reject
                } else {
                    let end = (start + METADATA_BLOCK).min(metadata.len());
                    MetadataReply::Data {
                        total: metadata.len(),
                        chunk: metadata.slice(start..end),
                    }
                }
            }
            None => MetadataReply::Reject,
        };

        let peer = self.peers.get_mut(&addr).expect("dispatch without session");
        let Some(their_id) = peer
            .extended
            .as_ref()
            .and_then(|ext| ext.peer_id_for(ClientExtendedId::UtMetadata))
        else {
            return Ok(());
        };

        let raw = match response {
            MetadataReply::Reject => {
                serde_bencode::to_bytes(&MetadataMessage::reject(request.piece))
            }
            MetadataReply::Data { total, ref chunk } => {
                serde_bencode::to_bytes(&MetadataMessage::data(request.piece, total)).map(
                    |mut header| {
                        header.extend_from_slice(chunk);
                        header
                    },
                )
            }
        }
        .map_err(|_| PeerError::InvalidMessage("metadata encode"))?;

        peer.enqueue(Message::Extended {
            id: their_id,
            payload: Bytes::from(raw),
        });
        Ok(())
    }

    fn on_pex(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), PeerError> {
        let payload: PexPayload = serde_bencode::from_bytes(payload)
            .map_err(|_| PeerError::ProtocolViolation("malformed peer exchange payload"))?;

        if self.private || !self.settings.allow_peer_exchange {
            self.sink.emit(TorrentEvent::PeersFound {
                source: addr,
                added: Vec::new(),
                total: 0,
            });
            return Ok(());
        }
        if self.peers.len() + self.available.len() >= self.settings.maximum_connections {
            event!(Level::TRACE, %addr, "at connection cap, dropping pex peers");
            return Ok(());
        }

        let added = payload.added_peers();
        for peer in &added {
            self.available.insert(peer.addr);
        }
        for dropped in payload.dropped_peers() {
            self.available.remove(&dropped);
        }
        self.sink.emit(TorrentEvent::PeersFound {
            source: addr,
            added,
            total: self.available.len(),
        });
        Ok(())
    }
}

enum MetadataReply {
    Reject,
    Data { total: usize, chunk: Bytes },
}

fn underreports_reqq(version: Option<&str>) -> bool {
    let Some(version) = version else {
        return false;
    };
    LEGACY_REQQ_CLIENTS
        .iter()
        .any(|prefix| version.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::peer::{LinkCommand, PeerLink, PeerSession};
    use crate::hashes::PieceHashStore;
    use crate::layout::PieceLayout;
    use tokio::sync::mpsc;

    const PIECE_LEN: u32 = 32_768;

    fn four_piece_state() -> (TorrentState, mpsc::UnboundedReceiver<TorrentEvent>) {
        TorrentState::for_tests(
            PieceLayout::new(PIECE_LEN, 4 * PIECE_LEN as u64),
            PieceHashStore::from_v1(vec![[0u8; 20]; 4]),
        )
    }

    fn add_peer(state: &mut TorrentState, n: u8) -> (SocketAddr, mpsc::Receiver<LinkCommand>) {
        let addr: SocketAddr = format!("10.9.0.{n}:6881").parse().unwrap();
        let (tx, rx) = mpsc::channel(64);
        state.peers.insert(
            addr,
            PeerSession::new(addr, PeerLink::new(tx), state.layout.piece_count() as usize),
        );
        (addr, rx)
    }

    fn shake(state: &mut TorrentState, addr: SocketAddr) {
        let handshake = Handshake::ours(state.info_hash.wire_bytes(), [7u8; 20]);
        state
            .handle_frame_sync(addr, Message::Handshake(handshake))
            .unwrap();
    }

    fn drain(rx: &mut mpsc::Receiver<LinkCommand>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(LinkCommand::Deliver(msg)) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn handshake_with_foreign_infohash_is_fatal() {
        let (mut state, _events) = four_piece_state();
        let (addr, _rx) = add_peer(&mut state, 1);
        let handshake = Handshake::ours([0x99; 20], [7u8; 20]);
        assert_eq!(
            state.handle_frame_sync(addr, Message::Handshake(handshake)),
            Err(PeerError::UnknownInfoHash)
        );
    }

    #[test]
    fn handshake_bootstraps_availability_and_grants() {
        let (mut state, _events) = four_piece_state();
        let (addr, mut rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);

        let sent = drain(&mut rx);
        // Empty bitfield + fast peer -> compact HaveNone.
        assert_eq!(sent[0], Message::HaveNone);
        assert!(matches!(sent[1], Message::Extended { id: 0, .. }));
        let grants = sent
            .iter()
            .filter(|m| matches!(m, Message::AllowedFast { .. }))
            .count();
        assert_eq!(grants, 4);

        let peer = &state.peers[&addr];
        assert!(peer.handshaked && peer.supports_fast && peer.supports_extended);
        assert_eq!(peer.allowed_fast_out.len(), 4);
    }

    #[test]
    fn fast_message_without_negotiation_is_a_violation() {
        let (mut state, _events) = four_piece_state();
        let (addr, _rx) = add_peer(&mut state, 1);
        let mut handshake = Handshake::ours(state.info_hash.wire_bytes(), [7u8; 20]);
        handshake.reserved = [0u8; 8]; // no fast, no extended
        state
            .handle_frame_sync(addr, Message::Handshake(handshake))
            .unwrap();

        assert_eq!(
            state.handle_frame_sync(addr, Message::HaveAll),
            Err(PeerError::ProtocolViolation("peer does not support fast-peer"))
        );
        assert_eq!(
            state.handle_frame_sync(
                addr,
                Message::Extended {
                    id: 5,
                    payload: Bytes::new()
                }
            ),
            Err(PeerError::ProtocolViolation(
                "peer does not support extension messages"
            ))
        );
    }

    #[test]
    fn full_bitfield_marks_seeder_and_interest() {
        let (mut state, _events) = four_piece_state();
        let (addr, mut rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);
        drain(&mut rx);

        state
            .handle_frame_sync(addr, Message::Bitfield(Bytes::from_static(&[0xF0])))
            .unwrap();
        let peer = &state.peers[&addr];
        assert!(peer.is_seeder);
        assert!(peer.am_interested);
    }

    #[test]
    fn wrong_length_bitfield_is_a_violation() {
        let (mut state, _events) = four_piece_state();
        let (addr, _rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);
        assert_eq!(
            state.handle_frame_sync(addr, Message::Bitfield(Bytes::from_static(&[0xF0, 0x00]))),
            Err(PeerError::ProtocolViolation("malformed bitfield"))
        );
    }

    #[test]
    fn have_for_missing_piece_raises_interest() {
        let (mut state, _events) = four_piece_state();
        let (addr, _rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);

        state
            .handle_frame_sync(addr, Message::Have { piece: 2 })
            .unwrap();
        let peer = &state.peers[&addr];
        assert!(peer.bitfield.get(2));
        assert!(peer.am_interested);
        assert_eq!(peer.estimated_downloaded_bytes, PIECE_LEN as u64);
        // A re-announced Have overcounts; the counter is advisory.
        state
            .handle_frame_sync(addr, Message::Have { piece: 2 })
            .unwrap();
        assert_eq!(
            state.peers[&addr].estimated_downloaded_bytes,
            2 * PIECE_LEN as u64
        );
    }

    #[test]
    fn have_all_then_have_none_restores_disinterest() {
        let (mut state, _events) = four_piece_state();
        let (addr, _rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);

        state.handle_frame_sync(addr, Message::HaveAll).unwrap();
        assert!(state.peers[&addr].is_seeder);
        assert!(state.peers[&addr].am_interested);

        state.handle_frame_sync(addr, Message::HaveNone).unwrap();
        let peer = &state.peers[&addr];
        assert!(!peer.is_seeder);
        assert!(peer.bitfield.none());
        assert!(!peer.am_interested);
    }

    #[test]
    fn choke_without_fast_cancels_outstanding_requests() {
        let (mut state, _events) = four_piece_state();
        let (addr, _rx) = add_peer(&mut state, 1);
        let mut handshake = Handshake::ours(state.info_hash.wire_bytes(), [7u8; 20]);
        handshake.reserved = [0u8; 8];
        state
            .handle_frame_sync(addr, Message::Handshake(handshake))
            .unwrap();
        // Non-fast peer announces availability via bitfield.
        state
            .handle_frame_sync(addr, Message::Bitfield(Bytes::from_static(&[0xF0])))
            .unwrap();
        state.handle_frame_sync(addr, Message::Unchoke).unwrap();
        let outstanding = state.peers[&addr].outstanding_requests;
        assert!(outstanding > 0);

        state.handle_frame_sync(addr, Message::Choke).unwrap();
        assert_eq!(state.peers[&addr].outstanding_requests, 0);

        // The freed blocks are requestable again after an unchoke.
        state.handle_frame_sync(addr, Message::Unchoke).unwrap();
        assert!(state.peers[&addr].outstanding_requests > 0);
    }

    #[test]
    fn unchoke_fills_the_request_pipeline() {
        let (mut state, _events) = four_piece_state();
        let (addr, mut rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);
        drain(&mut rx);

        state.handle_frame_sync(addr, Message::HaveAll).unwrap();
        state.handle_frame_sync(addr, Message::Unchoke).unwrap();
        state.peers.get_mut(&addr).unwrap().try_process_queue();

        let sent = drain(&mut rx);
        let requests = sent
            .iter()
            .filter(|m| matches!(m, Message::Request(_)))
            .count();
        assert!(requests >= 1);
        assert_eq!(
            state.peers[&addr].outstanding_requests as usize,
            requests
        );
    }

    #[test]
    fn request_bounds_are_enforced_except_on_final_piece() {
        let (mut state, _events) = four_piece_state();
        let (addr, _rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);
        state.peers.get_mut(&addr).unwrap().am_choking = false;

        // Too short, not the final piece.
        let runt = BlockInfo {
            piece_index: 1,
            offset: 0,
            length: 100,
        };
        assert_eq!(
            state.handle_frame_sync(addr, Message::Request(runt)),
            Err(PeerError::ProtocolViolation("request length out of bounds"))
        );

        // Identical length on the final piece is fine.
        let tail = BlockInfo {
            piece_index: 3,
            offset: 0,
            length: 100,
        };
        assert_eq!(
            state.handle_frame_sync(addr, Message::Request(tail)).unwrap(),
            Followup::StartUpload(tail)
        );

        // Out of the piece's byte range entirely.
        let oob = BlockInfo {
            piece_index: 1,
            offset: PIECE_LEN - 4,
            length: MIN_REQUEST_LEN,
        };
        assert_eq!(
            state.handle_frame_sync(addr, Message::Request(oob)),
            Err(PeerError::ProtocolViolation("request out of bounds"))
        );
    }

    #[test]
    fn choked_request_gets_piece_only_via_allowed_fast() {
        let (mut state, _events) = four_piece_state();
        let (addr, mut rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);
        drain(&mut rx);
        assert!(state.peers[&addr].am_choking);

        let block = BlockInfo {
            piece_index: 1,
            offset: 0,
            length: 16_384,
        };
        let granted = state.peers[&addr].allowed_fast_out.contains(&1);

        let outcome = state.handle_frame_sync(addr, Message::Request(block)).unwrap();
        if granted {
            assert_eq!(outcome, Followup::StartUpload(block));
        } else {
            assert_eq!(outcome, Followup::None);
            state.peers.get_mut(&addr).unwrap().try_process_queue();
            assert!(drain(&mut rx).contains(&Message::Reject(block)));
        }
    }

    #[test]
    fn cancel_removes_queued_reply_and_decrements() {
        let (mut state, _events) = four_piece_state();
        let (addr, _rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);
        state.peers.get_mut(&addr).unwrap().am_choking = false;

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            length: 16_384,
        };
        assert_eq!(
            state.handle_frame_sync(addr, Message::Request(block)).unwrap(),
            Followup::StartUpload(block)
        );
        assert_eq!(state.peers[&addr].requests_from_peer, 1);

        state
            .handle_frame_sync(addr, Message::Cancel(block))
            .unwrap();
        let peer = &state.peers[&addr];
        assert_eq!(peer.requests_from_peer, 0);
        assert!(peer.pending_uploads.is_empty());
    }

    #[test]
    fn reject_notifies_picker_and_decrements_outstanding() {
        let (mut state, _events) = four_piece_state();
        let (addr, _rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);
        state.handle_frame_sync(addr, Message::HaveAll).unwrap();
        state.handle_frame_sync(addr, Message::Unchoke).unwrap();
        let before = state.peers[&addr].outstanding_requests;
        assert!(before > 0);

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            length: 16_384,
        };
        state
            .handle_frame_sync(addr, Message::Reject(block))
            .unwrap();
        assert_eq!(state.peers[&addr].outstanding_requests, before - 1);
    }

    #[test]
    fn allowed_fast_for_owned_piece_is_ignored() {
        let (mut state, _events) = four_piece_state();
        state.have.set(1);
        state.picker.set_piece_done(1);
        let (addr, _rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);

        state
            .handle_frame_sync(addr, Message::AllowedFast { piece: 1 })
            .unwrap();
        state
            .handle_frame_sync(addr, Message::AllowedFast { piece: 2 })
            .unwrap();
        let peer = &state.peers[&addr];
        assert!(!peer.allowed_fast_in.contains(&1));
        assert!(peer.allowed_fast_in.contains(&2));
    }

    #[test]
    fn legacy_client_reqq_is_floored() {
        let (mut state, _events) = four_piece_state();
        let (addr, _rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);

        let theirs = ExtendedHandshakePayload {
            m: [("ut_metadata".to_string(), 3u8)].into(),
            p: Some(51_413),
            v: Some("\u{b5}Torrent 1.8.5".to_string()),
            reqq: Some(16),
            metadata_size: None,
        };
        let raw = serde_bencode::to_bytes(&theirs).unwrap();
        state
            .handle_frame_sync(
                addr,
                Message::Extended {
                    id: 0,
                    payload: Bytes::from(raw),
                },
            )
            .unwrap();

        let peer = &state.peers[&addr];
        assert_eq!(peer.peer_reqq, Some(LEGACY_REQQ_FLOOR));
        assert_eq!(peer.listen_port, Some(51_413));
    }

    #[test]
    fn nonpositive_reqq_is_ignored() {
        let (mut state, _events) = four_piece_state();
        let (addr, _rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);

        let theirs = ExtendedHandshakePayload {
            reqq: Some(0),
            ..Default::default()
        };
        let raw = serde_bencode::to_bytes(&theirs).unwrap();
        state
            .handle_frame_sync(
                addr,
                Message::Extended {
                    id: 0,
                    payload: Bytes::from(raw),
                },
            )
            .unwrap();
        assert_eq!(state.peers[&addr].peer_reqq, None);
    }

    #[test]
    fn metadata_request_is_served_or_rejected() {
        let (mut state, _events) = four_piece_state();
        state.metadata = Some(Bytes::from(vec![0x61u8; 20_000]));
        let (addr, mut rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);
        drain(&mut rx);

        // Their handshake maps ut_metadata to 9 on their side.
        let theirs = ExtendedHandshakePayload {
            m: [("ut_metadata".to_string(), 9u8)].into(),
            ..Default::default()
        };
        let raw = serde_bencode::to_bytes(&theirs).unwrap();
        state
            .handle_frame_sync(
                addr,
                Message::Extended {
                    id: 0,
                    payload: Bytes::from(raw),
                },
            )
            .unwrap();

        // Request piece 1: bytes 16384..20000.
        let request = serde_bencode::to_bytes(&MetadataMessage::request(1)).unwrap();
        state
            .handle_frame_sync(
                addr,
                Message::Extended {
                    id: ClientExtendedId::UtMetadata.id(),
                    payload: Bytes::from(request),
                },
            )
            .unwrap();
        state.peers.get_mut(&addr).unwrap().try_process_queue();
        let sent = drain(&mut rx);
        let Message::Extended { id, payload } = &sent[0] else {
            panic!("expected extended reply, got {:?}", sent[0]);
        };
        assert_eq!(*id, 9);
        assert!(payload.len() > 20_000 - 16_384);

        // Out-of-range piece gets a reject header.
        let request = serde_bencode::to_bytes(&MetadataMessage::request(5)).unwrap();
        state
            .handle_frame_sync(
                addr,
                Message::Extended {
                    id: ClientExtendedId::UtMetadata.id(),
                    payload: Bytes::from(request),
                },
            )
            .unwrap();
        state.peers.get_mut(&addr).unwrap().try_process_queue();
        let sent = drain(&mut rx);
        let Message::Extended { payload, .. } = &sent[0] else {
            panic!("expected extended reply");
        };
        let reject: MetadataMessage = serde_bencode::from_bytes(payload).unwrap();
        assert_eq!(reject.msg_type, MetadataMessage::REJECT);
    }

    #[test]
    fn choked_request_from_plain_peer_is_rejected_not_served() {
        let (mut state, _events) = four_piece_state();
        let (addr, mut rx) = add_peer(&mut state, 1);
        let mut handshake = Handshake::ours(state.info_hash.wire_bytes(), [7u8; 20]);
        handshake.reserved = [0u8; 8];
        state
            .handle_frame_sync(addr, Message::Handshake(handshake))
            .unwrap();
        drain(&mut rx);
        assert!(state.peers[&addr].am_choking);

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            length: 16_384,
        };
        let outcome = state
            .handle_frame_sync(addr, Message::Request(block))
            .unwrap();
        assert_eq!(outcome, Followup::None);
        assert_eq!(state.peers[&addr].requests_from_peer, 0);

        state.peers.get_mut(&addr).unwrap().try_process_queue();
        let sent = drain(&mut rx);
        // No Piece is ever queued toward a choked peer without a grant.
        assert!(!sent.iter().any(|m| matches!(m, Message::Piece { .. })));
        assert!(sent.contains(&Message::Reject(block)));
    }

    #[test]
    fn pex_is_dropped_at_the_connection_cap() {
        let (mut state, mut events) = four_piece_state();
        let (addr, _rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);
        while events.try_recv().is_ok() {}

        // Fill the candidate pool so connected + available hits the cap.
        let cap = state.settings.maximum_connections;
        for i in 0..cap - state.peers.len() {
            state
                .available
                .insert(format!("172.16.{}.{}:1", i / 256, i % 256).parse().unwrap());
        }
        let before = state.available.len();

        let gossip = PexPayload::from_deltas(
            &[crate::pex::PexPeer {
                addr: "198.51.100.7:6881".parse().unwrap(),
                flags: Default::default(),
            }],
            &[],
        );
        let raw = serde_bencode::to_bytes(&gossip).unwrap();
        state
            .handle_frame_sync(
                addr,
                Message::Extended {
                    id: ClientExtendedId::UtPex.id(),
                    payload: Bytes::from(raw),
                },
            )
            .unwrap();

        assert_eq!(state.available.len(), before);
        assert!(events.try_recv().is_err(), "no PeersFound while at cap");
    }

    #[test]
    fn unknown_message_id_is_unsupported() {
        let (mut state, _events) = four_piece_state();
        let (addr, _rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);
        assert_eq!(
            state.handle_frame_sync(addr, Message::Unknown { id: 99 }),
            Err(PeerError::UnsupportedMessage(99))
        );
    }

    #[test]
    fn hash_request_is_rejected_by_default() {
        let (mut state, _events) = four_piece_state();
        let (addr, mut rx) = add_peer(&mut state, 1);
        shake(&mut state, addr);
        drain(&mut rx);

        let span = crate::wire::HashSpan {
            pieces_root: [1u8; 32],
            base_layer: 0,
            index: 0,
            length: 2,
            proof_layers: 0,
        };
        state
            .handle_frame_sync(addr, Message::HashRequest(span))
            .unwrap();
        state.peers.get_mut(&addr).unwrap().try_process_queue();
        assert_eq!(drain(&mut rx), vec![Message::HashReject(span)]);
    }
}

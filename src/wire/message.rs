// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::PeerError;

/// The protocol identifier every handshake must carry, byte for byte.
pub const PROTOCOL_TAG: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Hard upper bound for a single frame; anything larger is a corrupt stream.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// One requested (or delivered) sub-range of a piece.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub offset: u32,
    pub length: u32,
}

/// Identifies a span of merkle-layer hashes in a v2 hash exchange (BEP 52).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashSpan {
    pub pieces_root: [u8; 32],
    pub base_layer: u32,
    pub index: u32,
    pub length: u32,
    pub proof_layers: u32,
}

/// The initial handshake frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Our outgoing handshake: extension protocol (BEP 10) and fast
    /// extension (BEP 6) advertised.
    pub fn ours(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10;
        reserved[7] |= 0x04;
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    pub fn supports_fast_peer(&self) -> bool {
        self.reserved[7] & 0x04 != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_TAG.len() as u8);
        buf.put_slice(PROTOCOL_TAG);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, PeerError> {
        if raw.len() < HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake);
        }
        if raw[0] as usize != PROTOCOL_TAG.len() || &raw[1..20] != PROTOCOL_TAG {
            return Err(PeerError::ProtocolViolation("bad protocol tag"));
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&raw[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&raw[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&raw[48..68]);
        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// A peer-wire frame after the handshake.
///
/// Covers the base protocol, the fast extension (ids 13..=17), the extension
/// protocol (id 20) and the v2 hash exchange (ids 21..=23). Ids the engine
/// does not know come out as [`Message::Unknown`] so the dispatcher decides
/// what to do with them.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Only produced by the connection layer's handshake phase; the framed
    /// parser never emits it.
    Handshake(Handshake),
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request(BlockInfo),
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel(BlockInfo),
    Port(u16),
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject(BlockInfo),
    AllowedFast { piece: u32 },
    Extended { id: u8, payload: Bytes },
    HashRequest(HashSpan),
    Hashes { span: HashSpan, hashes: Bytes },
    HashReject(HashSpan),
    Unknown { id: u8 },
}

impl Message {
    /// Fast-extension family (BEP 6); only valid after both sides advertised
    /// the fast bit.
    pub fn is_fast_family(&self) -> bool {
        matches!(
            self,
            Message::Suggest { .. }
                | Message::HaveAll
                | Message::HaveNone
                | Message::Reject(_)
                | Message::AllowedFast { .. }
        )
    }

    pub fn is_extended_family(&self) -> bool {
        matches!(self, Message::Extended { .. })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::Handshake(hs) => return hs.encode(),
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_bare(&mut buf, 0),
            Message::Unchoke => put_bare(&mut buf, 1),
            Message::Interested => put_bare(&mut buf, 2),
            Message::NotInterested => put_bare(&mut buf, 3),
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(5);
                buf.put_slice(bits);
            }
            Message::Request(block) => put_block(&mut buf, 6, block),
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel(block) => put_block(&mut buf, 8, block),
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(9);
                buf.put_u16(*port);
            }
            Message::Suggest { piece } => {
                buf.put_u32(5);
                buf.put_u8(13);
                buf.put_u32(*piece);
            }
            Message::HaveAll => put_bare(&mut buf, 14),
            Message::HaveNone => put_bare(&mut buf, 15),
            Message::Reject(block) => put_block(&mut buf, 16, block),
            Message::AllowedFast { piece } => {
                buf.put_u32(5);
                buf.put_u8(17);
                buf.put_u32(*piece);
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(20);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            Message::HashRequest(span) => put_hash_span(&mut buf, 21, span, &[]),
            Message::Hashes { span, hashes } => put_hash_span(&mut buf, 22, span, hashes),
            Message::HashReject(span) => put_hash_span(&mut buf, 23, span, &[]),
            Message::Unknown { id } => put_bare(&mut buf, *id),
        }
        buf.freeze()
    }

    /// Pulls one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a whole frame; in
    /// that case nothing is consumed and the caller reads more bytes.
    pub fn parse(src: &mut BytesMut) -> Result<Option<Message>, PeerError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(PeerError::InvalidMessage("frame exceeds maximum length"));
        }
        if src.len() < 4 + frame_len {
            return Ok(None);
        }

        src.advance(4);
        if frame_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = src.get_u8();
        let mut payload = src.split_to(frame_len - 1).freeze();

        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have {
                piece: get_u32(&mut payload, "have")?,
            },
            5 => Message::Bitfield(payload),
            6 => Message::Request(get_block(&mut payload, "request")?),
            7 => {
                if payload.len() < 8 {
                    return Err(PeerError::InvalidMessage("piece too short"));
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: payload,
                }
            }
            8 => Message::Cancel(get_block(&mut payload, "cancel")?),
            9 => Message::Port(get_u16(&mut payload, "port")?),
            13 => Message::Suggest {
                piece: get_u32(&mut payload, "suggest")?,
            },
            14 => Message::HaveAll,
            15 => Message::HaveNone,
            16 => Message::Reject(get_block(&mut payload, "reject")?),
            17 => Message::AllowedFast {
                piece: get_u32(&mut payload, "allowed fast")?,
            },
            20 => {
                if payload.is_empty() {
                    return Err(PeerError::InvalidMessage("extended without id"));
                }
                let ext_id = payload.get_u8();
                Message::Extended {
                    id: ext_id,
                    payload,
                }
            }
            21 => Message::HashRequest(get_hash_span(&mut payload)?),
            22 => {
                let span = get_hash_span(&mut payload)?;
                Message::Hashes {
                    span,
                    hashes: payload,
                }
            }
            23 => Message::HashReject(get_hash_span(&mut payload)?),
            other => Message::Unknown { id: other },
        };
        Ok(Some(msg))
    }
}

fn put_bare(buf: &mut BytesMut, id: u8) {
    buf.put_u32(1);
    buf.put_u8(id);
}

fn put_block(buf: &mut BytesMut, id: u8, block: &BlockInfo) {
    buf.put_u32(13);
    buf.put_u8(id);
    buf.put_u32(block.piece_index);
    buf.put_u32(block.offset);
    buf.put_u32(block.length);
}

fn put_hash_span(buf: &mut BytesMut, id: u8, span: &HashSpan, hashes: &[u8]) {
    buf.put_u32(1 + 48 + hashes.len() as u32);
    buf.put_u8(id);
    buf.put_slice(&span.pieces_root);
    buf.put_u32(span.base_layer);
    buf.put_u32(span.index);
    buf.put_u32(span.length);
    buf.put_u32(span.proof_layers);
    buf.put_slice(hashes);
}

fn get_u16(payload: &mut Bytes, what: &'static str) -> Result<u16, PeerError> {
    if payload.len() < 2 {
        return Err(PeerError::InvalidMessage(what));
    }
    Ok(payload.get_u16())
}

fn get_u32(payload: &mut Bytes, what: &'static str) -> Result<u32, PeerError> {
    if payload.len() < 4 {
        return Err(PeerError::InvalidMessage(what));
    }
    Ok(payload.get_u32())
}

fn get_block(payload: &mut Bytes, what: &'static str) -> Result<BlockInfo, PeerError> {
    if payload.len() < 12 {
        return Err(PeerError::InvalidMessage(what));
    }
    Ok(BlockInfo {
        piece_index: payload.get_u32(),
        offset: payload.get_u32(),
        length: payload.get_u32(),
    })
}

fn get_hash_span(payload: &mut Bytes) -> Result<HashSpan, PeerError> {
    if payload.len() < 48 {
        return Err(PeerError::InvalidMessage("hash span too short"));
    }
    let mut pieces_root = [0u8; 32];
    payload.copy_to_slice(&mut pieces_root);
    Ok(HashSpan {
        pieces_root,
        base_layer: payload.get_u32(),
        index: payload.get_u32(),
        length: payload.get_u32(),
        proof_layers: payload.get_u32(),
    })
}

/// Compact `Debug` for log lines: large payloads shown by length only.
pub struct MessageSummary<'a>(pub &'a Message);

impl fmt::Debug for MessageSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Message::Bitfield(bits) => write!(f, "BITFIELD(len: {})", bits.len()),
            Message::Piece { index, begin, data } => write!(
                f,
                "PIECE(index: {}, begin: {}, len: {})",
                index,
                begin,
                data.len()
            ),
            Message::Extended { id, payload } => {
                write!(f, "EXTENDED(id: {}, len: {})", id, payload.len())
            }
            Message::Hashes { span, hashes } => write!(
                f,
                "HASHES(layer: {}, index: {}, len: {})",
                span.base_layer,
                span.index,
                hashes.len()
            ),
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(msg: Message) {
        let encoded = msg.encode();
        let mut buf = BytesMut::from(&encoded[..]);
        let parsed = Message::parse(&mut buf).unwrap().unwrap();
        assert_eq!(msg, parsed);
        assert!(buf.is_empty(), "parser left bytes behind");
    }

    #[test]
    fn handshake_rejects_wrong_tag() {
        let hs = Handshake::ours([1u8; 20], [2u8; 20]);
        let mut raw = hs.encode().to_vec();
        raw[1] = b'b';
        assert_eq!(
            Handshake::decode(&raw),
            Err(PeerError::ProtocolViolation("bad protocol tag"))
        );
    }

    #[test]
    fn handshake_capability_bits() {
        let hs = Handshake::ours([0u8; 20], [0u8; 20]);
        let decoded = Handshake::decode(&hs.encode()).unwrap();
        assert!(decoded.supports_extension_protocol());
        assert!(decoded.supports_fast_peer());
    }

    #[test]
    fn fast_extension_messages_roundtrip() {
        roundtrip(Message::HaveAll);
        roundtrip(Message::HaveNone);
        roundtrip(Message::Suggest { piece: 12 });
        roundtrip(Message::AllowedFast { piece: 3 });
        roundtrip(Message::Reject(BlockInfo {
            piece_index: 1,
            offset: 16_384,
            length: 16_384,
        }));
    }

    #[test]
    fn hash_exchange_messages_roundtrip() {
        let span = HashSpan {
            pieces_root: [7u8; 32],
            base_layer: 0,
            index: 4,
            length: 2,
            proof_layers: 1,
        };
        roundtrip(Message::HashRequest(span));
        roundtrip(Message::HashReject(span));
        roundtrip(Message::Hashes {
            span,
            hashes: Bytes::from(vec![0xAAu8; 96]),
        });
    }

    #[test]
    fn unknown_id_is_surfaced_not_dropped() {
        let mut buf = BytesMut::from(&[0, 0, 0, 3, 42, 1, 2][..]);
        let msg = Message::parse(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Unknown { id: 42 });
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_consumes_nothing() {
        let encoded = Message::Piece {
            index: 0,
            begin: 0,
            data: Bytes::from(vec![9u8; 100]),
        }
        .encode();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        let before = buf.len();
        assert_eq!(Message::parse(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), before);
    }

    #[test]
    fn oversized_frame_is_a_protocol_error() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xFF, 7][..]);
        assert!(Message::parse(&mut buf).is_err());
    }

    proptest! {
        #[test]
        fn request_fields_survive_roundtrip(index in 0u32..1 << 20, offset in 0u32..1 << 24, length in 1u32..1 << 17) {
            roundtrip(Message::Request(BlockInfo { piece_index: index, offset, length }));
        }

        #[test]
        fn piece_payloads_survive_roundtrip(index in 0u32..1024, begin in 0u32..1 << 24, data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            roundtrip(Message::Piece { index, begin, data: Bytes::from(data) });
        }
    }
}

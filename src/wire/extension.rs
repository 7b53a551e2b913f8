// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

/// Extension message ids on OUR side of the connection. Peers address us with
/// these; we address peers with the ids from their handshake's `m` dict.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum ClientExtendedId {
    Handshake = 0,
    UtPex = 1,
    UtMetadata = 2,
}

impl ClientExtendedId {
    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientExtendedId::Handshake => "handshake",
            ClientExtendedId::UtPex => "ut_pex",
            ClientExtendedId::UtMetadata => "ut_metadata",
        }
    }
}

/// Bencoded payload of the extended handshake (BEP 10).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ExtendedHandshakePayload {
    /// Extension name -> message id mapping of the sender.
    #[serde(default)]
    pub m: HashMap<String, u8>,

    /// Sender's listen port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<u16>,

    /// Client name and version, human readable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,

    /// How many outstanding requests the sender tolerates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,
}

impl ExtendedHandshakePayload {
    /// Builds our handshake. Private torrents must not advertise `ut_pex`,
    /// which is how the private flag travels in this handshake.
    pub fn ours(listen_port: u16, metadata_size: Option<i64>, allow_pex: bool) -> Self {
        let m = ClientExtendedId::iter()
            .filter(|variant| *variant != ClientExtendedId::Handshake)
            .filter(|variant| allow_pex || *variant != ClientExtendedId::UtPex)
            .map(|variant| (variant.as_str().to_string(), variant.id()))
            .collect();
        Self {
            m,
            p: Some(listen_port),
            v: Some(concat!("peerling ", env!("CARGO_PKG_VERSION")).to_string()),
            reqq: Some(500),
            metadata_size,
        }
    }

    /// The id the peer expects for a given extension, if it supports it.
    pub fn peer_id_for(&self, ext: ClientExtendedId) -> Option<u8> {
        self.m.get(ext.as_str()).copied().filter(|id| *id != 0)
    }
}

/// `ut_metadata` control message (BEP 9). For `data` messages the raw
/// metadata piece follows the bencoded header on the wire.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct MetadataMessage {
    /// 0 request, 1 data, 2 reject.
    pub msg_type: u8,
    pub piece: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<usize>,
}

impl MetadataMessage {
    pub const REQUEST: u8 = 0;
    pub const DATA: u8 = 1;
    pub const REJECT: u8 = 2;

    pub fn request(piece: usize) -> Self {
        Self {
            msg_type: Self::REQUEST,
            piece,
            total_size: None,
        }
    }

    pub fn reject(piece: usize) -> Self {
        Self {
            msg_type: Self::REJECT,
            piece,
            total_size: None,
        }
    }

    /// Header for a `data` message; the caller appends the raw piece bytes.
    pub fn data(piece: usize, total_size: usize) -> Self {
        Self {
            msg_type: Self::DATA,
            piece,
            total_size: Some(total_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_handshake_omits_ut_pex() {
        let open = ExtendedHandshakePayload::ours(6881, Some(1234), true);
        assert!(open.m.contains_key("ut_pex"));
        assert!(open.m.contains_key("ut_metadata"));

        let private = ExtendedHandshakePayload::ours(6881, None, false);
        assert!(!private.m.contains_key("ut_pex"));
        assert!(private.m.contains_key("ut_metadata"));
        assert_eq!(private.p, Some(6881));
    }

    #[test]
    fn handshake_payload_bencodes_roundtrip() {
        let ours = ExtendedHandshakePayload::ours(51413, Some(9000), true);
        let raw = serde_bencode::to_bytes(&ours).unwrap();
        let back: ExtendedHandshakePayload = serde_bencode::from_bytes(&raw).unwrap();
        assert_eq!(back.m, ours.m);
        assert_eq!(back.p, Some(51413));
        assert_eq!(back.metadata_size, Some(9000));
        assert_eq!(back.reqq, Some(500));
    }

    #[test]
    fn peer_id_zero_means_disabled() {
        let mut payload = ExtendedHandshakePayload::default();
        payload.m.insert("ut_pex".into(), 0);
        assert_eq!(payload.peer_id_for(ClientExtendedId::UtPex), None);
        payload.m.insert("ut_pex".into(), 3);
        assert_eq!(payload.peer_id_for(ClientExtendedId::UtPex), Some(3));
    }

    #[test]
    fn metadata_request_matches_wire_form() {
        let raw = serde_bencode::to_bytes(&MetadataMessage::request(2)).unwrap();
        let back: MetadataMessage = serde_bencode::from_bytes(&raw).unwrap();
        assert_eq!(back, MetadataMessage::request(2));
        assert_eq!(
            MetadataMessage::data(0, 31_235).total_size,
            Some(31_235)
        );
    }
}

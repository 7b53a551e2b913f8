// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod extension;
pub mod message;

pub use extension::{ClientExtendedId, ExtendedHandshakePayload, MetadataMessage};
pub use message::{BlockInfo, Handshake, HashSpan, Message, MessageSummary, PROTOCOL_TAG};

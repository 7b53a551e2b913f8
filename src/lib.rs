// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! peerling - a per-torrent BitTorrent peer-wire engine
//!
//! This crate is the protocol heart of a client: it owns per-peer session
//! state, dispatches every inbound peer message, schedules outbound
//! requests, verifies completed pieces and walks a torrent through its
//! lifecycle (hash-checking, downloading, seeding). Sockets, trackers, DHT
//! routing and piece storage policy live outside and talk to the engine over
//! channels.
//!
//! # Modules
//!
//! - [`engine`] - the mode-driven engine: dispatcher, tick loop, piece
//!   pipeline
//! - [`wire`] - peer wire messages (BEP 3/6/10/52) and the handshake
//! - [`pex`] - peer exchange payloads (BEP 11)
//! - [`allowed_fast`] - canonical allowed-fast set derivation (BEP 6)
//! - [`picker`] - rarest-first block scheduling
//! - [`choker`] - unchoke slot review
//! - [`disk`] / [`storage`] - disk actor contract and file-backed impl
//! - [`sync`] - async exclusion primitives the engine is built on

pub mod allowed_fast;
pub mod announce;
pub mod bitfield;
pub mod buffer;
pub mod choker;
pub mod config;
pub mod disk;
pub mod engine;
pub mod errors;
pub mod events;
pub mod hashes;
pub mod layout;
pub mod pex;
pub mod picker;
pub mod rate;
pub mod storage;
pub mod sync;
pub mod webseed;
pub mod wire;

pub use bitfield::Bitfield;
pub use buffer::{BufferLease, BufferPool};
pub use config::{load_settings, Settings};
pub use disk::{DiskCommand, DiskHandle, DiskManager};
pub use engine::{Engine, EngineEvent, EngineHandle, LinkCommand, Mode, PeerLink, Phase};
pub use errors::{PeerError, StorageError, TorrentFault};
pub use events::{EventSink, TorrentEvent};
pub use hashes::{HashFamily, InfoHash, PieceHash, PieceHashStore};
pub use layout::{PieceLayout, BLOCK_SIZE};
pub use wire::{BlockInfo, Handshake, Message};

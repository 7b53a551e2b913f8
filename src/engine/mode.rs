// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use tokio_util::sync::CancellationToken;

use crate::errors::TorrentFault;

/// Lifecycle state of a torrent, readable by embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Hashing,
    Starting,
    Downloading,
    Seeding,
    Error,
}

/// What the current Mode permits. The dispatcher and tick loop consult these
/// instead of dispatching through per-mode virtual handlers.
#[derive(Debug, Clone, Copy)]
pub struct ModeCaps {
    pub can_accept_connections: bool,
    pub can_handle_messages: bool,
    pub can_hash_check: bool,
    /// Whether v2 hash requests are served instead of rejected. No mode in
    /// this crate turns it on; the field is the override point.
    pub serves_hashes: bool,
}

/// The per-torrent lifecycle policy object. Exactly one is live at a time;
/// replacing it cancels every task the old one spawned.
#[derive(Debug)]
pub struct Mode {
    pub phase: Phase,
    pub caps: ModeCaps,
    pub cancel: CancellationToken,
    /// Set when `phase == Error`.
    pub fault: Option<TorrentFault>,
}

impl Mode {
    fn new(phase: Phase, caps: ModeCaps) -> Self {
        Self {
            phase,
            caps,
            cancel: CancellationToken::new(),
            fault: None,
        }
    }

    pub fn stopped() -> Self {
        Self::new(
            Phase::Stopped,
            ModeCaps {
                can_accept_connections: false,
                can_handle_messages: false,
                can_hash_check: false,
                serves_hashes: false,
            },
        )
    }

    pub fn hashing() -> Self {
        Self::new(
            Phase::Hashing,
            ModeCaps {
                can_accept_connections: false,
                can_handle_messages: false,
                can_hash_check: true,
                serves_hashes: false,
            },
        )
    }

    /// Between hash check and the first announce round.
    pub fn starting() -> Self {
        Self::new(
            Phase::Starting,
            ModeCaps {
                can_accept_connections: true,
                can_handle_messages: false,
                can_hash_check: false,
                serves_hashes: false,
            },
        )
    }

    pub fn downloading() -> Self {
        Self::new(
            Phase::Downloading,
            ModeCaps {
                can_accept_connections: true,
                can_handle_messages: true,
                can_hash_check: true,
                serves_hashes: false,
            },
        )
    }

    pub fn seeding() -> Self {
        Self::new(
            Phase::Seeding,
            ModeCaps {
                can_accept_connections: true,
                can_handle_messages: true,
                can_hash_check: true,
                serves_hashes: false,
            },
        )
    }

    pub fn error(fault: TorrentFault) -> Self {
        let mut mode = Self::new(
            Phase::Error,
            ModeCaps {
                can_accept_connections: false,
                can_handle_messages: false,
                can_hash_check: false,
                serves_hashes: false,
            },
        );
        mode.fault = Some(fault);
        mode
    }

    /// True for the phases whose tick runs transfer policy.
    pub fn is_transferring(&self) -> bool {
        matches!(self.phase, Phase::Downloading | Phase::Seeding)
    }
}

// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::errors::TorrentFault;
use crate::pex::PexPeer;

/// Notifications the engine pushes to whoever embeds it (UI, session layer).
/// Best-effort: a full or dropped receiver never blocks the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TorrentEvent {
    StateChanged {
        state: crate::engine::Phase,
    },
    /// A piece passed verification and will be announced to peers.
    PieceFinished {
        piece: u32,
    },
    PieceFailed {
        piece: u32,
    },
    /// Result of ingesting one PEX message; `added` is empty when PEX is
    /// suppressed for this torrent.
    PeersFound {
        source: SocketAddr,
        added: Vec<PexPeer>,
        total: usize,
    },
    PeerConnected {
        addr: SocketAddr,
    },
    PeerDisconnected {
        addr: SocketAddr,
    },
    TorrentError {
        fault: TorrentFault,
    },
}

/// Sending side handed to the engine.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TorrentEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TorrentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: TorrentEvent) {
        let _ = self.tx.send(event);
    }
}

// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Announce triggers toward the tracker / DHT / local-discovery
//! collaborators. The engine only decides *when* to announce; transports and
//! routing live outside this crate and drain the channels at their own pace.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceKind {
    None,
    Started,
    Stopped,
    Completed,
}

#[derive(Debug)]
pub struct AnnounceRequest {
    pub kind: AnnounceKind,
    /// Fires when the requesting Mode is torn down; the transport should
    /// abandon the announce rather than finish it on a dead torrent.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
    LocalPeerDiscovery,
    Dht,
}

/// Collaborator endpoints plus the elapsed-interval bookkeeping for the
/// periodic triggers.
pub struct Discovery {
    tracker_tx: mpsc::Sender<AnnounceRequest>,
    discovery_tx: mpsc::Sender<DiscoveryKind>,

    pub lsd_enabled: bool,
    pub dht_enabled: bool,
    lsd_interval: Duration,
    dht_interval: Duration,
    last_lsd: Option<Instant>,
    last_dht: Option<Instant>,
}

impl Discovery {
    pub fn new(
        tracker_tx: mpsc::Sender<AnnounceRequest>,
        discovery_tx: mpsc::Sender<DiscoveryKind>,
        lsd_interval: Duration,
        dht_interval: Duration,
    ) -> Self {
        Self {
            tracker_tx,
            discovery_tx,
            lsd_enabled: true,
            dht_enabled: true,
            lsd_interval,
            dht_interval,
            last_lsd: None,
            last_dht: None,
        }
    }

    /// Fire-and-forget tracker announce; a congested transport drops the
    /// trigger rather than stalling the engine.
    pub fn announce(&self, kind: AnnounceKind, cancel: CancellationToken) {
        let _ = self.tracker_tx.try_send(AnnounceRequest { kind, cancel });
    }

    /// Emits LPD/DHT triggers whose interval has elapsed.
    pub fn run_periodic(&mut self, now: Instant) {
        if self.lsd_enabled && interval_elapsed(self.last_lsd, self.lsd_interval, now) {
            self.last_lsd = Some(now);
            let _ = self.discovery_tx.try_send(DiscoveryKind::LocalPeerDiscovery);
        }
        if self.dht_enabled && interval_elapsed(self.last_dht, self.dht_interval, now) {
            self.last_dht = Some(now);
            let _ = self.discovery_tx.try_send(DiscoveryKind::Dht);
        }
    }
}

fn interval_elapsed(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    match last {
        None => true,
        Some(last) => now.duration_since(last) >= interval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_triggers_respect_intervals() {
        let (tracker_tx, _tracker_rx) = mpsc::channel(4);
        let (discovery_tx, mut discovery_rx) = mpsc::channel(8);
        let mut discovery = Discovery::new(
            tracker_tx,
            discovery_tx,
            Duration::from_secs(300),
            Duration::from_secs(900),
        );

        let start = Instant::now();
        discovery.run_periodic(start);
        assert_eq!(
            discovery_rx.try_recv().unwrap(),
            DiscoveryKind::LocalPeerDiscovery
        );
        assert_eq!(discovery_rx.try_recv().unwrap(), DiscoveryKind::Dht);

        // Within the interval nothing fires.
        discovery.run_periodic(start + Duration::from_secs(10));
        assert!(discovery_rx.try_recv().is_err());

        // LPD interval elapses first.
        discovery.run_periodic(start + Duration::from_secs(301));
        assert_eq!(
            discovery_rx.try_recv().unwrap(),
            DiscoveryKind::LocalPeerDiscovery
        );
        assert!(discovery_rx.try_recv().is_err());
    }

    #[test]
    fn announce_does_not_block_on_full_channel() {
        let (tracker_tx, _rx) = mpsc::channel(1);
        let (discovery_tx, _drx) = mpsc::channel(1);
        let discovery = Discovery::new(
            tracker_tx,
            discovery_tx,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        for _ in 0..5 {
            discovery.announce(AnnounceKind::None, CancellationToken::new());
        }
    }
}

// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

const UNCHOKE_INTERVAL: Duration = Duration::from_secs(10);
const OPTIMISTIC_INTERVAL: Duration = Duration::from_secs(30);
const MAX_UNCHOKED: usize = 4;

/// Snapshot of one peer for a choke review.
#[derive(Debug, Clone, Copy)]
pub struct ChokeView {
    pub addr: SocketAddr,
    pub interested: bool,
    pub am_choking: bool,
    pub download_rate: u64,
    pub upload_rate: u64,
}

/// Tit-for-tat unchoke slots plus a rotating optimistic slot.
///
/// The engine calls [`Unchoker::unchoke_review`] every tick; the review is
/// internally rate-limited, so most calls return no decisions.
pub struct Unchoker {
    last_regular: Option<Instant>,
    last_optimistic: Option<Instant>,
    optimistic: Option<SocketAddr>,
}

impl Unchoker {
    pub fn new() -> Self {
        Self {
            last_regular: None,
            last_optimistic: None,
            optimistic: None,
        }
    }

    pub fn forget_peer(&mut self, addr: &SocketAddr) {
        if self.optimistic.as_ref() == Some(addr) {
            self.optimistic = None;
        }
    }

    /// Returns `(peer, should_unchoke)` for every peer whose choke state must
    /// flip. While seeding, slots go to the peers we upload to fastest;
    /// while downloading, to the peers serving us fastest.
    pub fn unchoke_review(&mut self, peers: &[ChokeView], seeding: bool) -> Vec<(SocketAddr, bool)> {
        let now = Instant::now();
        if let Some(last) = self.last_regular {
            if now.duration_since(last) < UNCHOKE_INTERVAL {
                return Vec::new();
            }
        }
        self.last_regular = Some(now);

        let mut candidates: Vec<&ChokeView> = peers.iter().filter(|p| p.interested).collect();
        if seeding {
            candidates.sort_by(|a, b| b.upload_rate.cmp(&a.upload_rate));
        } else {
            candidates.sort_by(|a, b| b.download_rate.cmp(&a.download_rate));
        }

        let mut unchoke: Vec<SocketAddr> = candidates
            .iter()
            .take(MAX_UNCHOKED - 1)
            .map(|p| p.addr)
            .collect();

        let optimistic_due = self
            .last_optimistic
            .is_none_or(|last| now.duration_since(last) >= OPTIMISTIC_INTERVAL);
        if optimistic_due {
            self.last_optimistic = Some(now);
            let pool: Vec<SocketAddr> = candidates
                .iter()
                .filter(|p| !unchoke.contains(&p.addr))
                .map(|p| p.addr)
                .collect();
            if pool.is_empty() {
                self.optimistic = None;
            } else {
                let pick = rand::rng().random_range(0..pool.len());
                self.optimistic = Some(pool[pick]);
            }
        }

        if let Some(optimistic) = self.optimistic {
            if !unchoke.contains(&optimistic) && unchoke.len() < MAX_UNCHOKED {
                unchoke.push(optimistic);
            }
        }

        peers
            .iter()
            .filter_map(|p| {
                let should_unchoke = unchoke.contains(&p.addr);
                (should_unchoke == p.am_choking).then_some((p.addr, should_unchoke))
            })
            .collect()
    }
}

impl Default for Unchoker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(n: u8, interested: bool, am_choking: bool, rate: u64) -> ChokeView {
        ChokeView {
            addr: format!("10.1.1.{n}:6881").parse().unwrap(),
            interested,
            am_choking,
            download_rate: rate,
            upload_rate: rate,
        }
    }

    #[test]
    fn fastest_interested_peers_get_the_slots() {
        let mut unchoker = Unchoker::new();
        let peers = vec![
            view(1, true, true, 100),
            view(2, true, true, 300),
            view(3, true, true, 200),
            view(4, false, true, 900),
            view(5, true, true, 50),
        ];
        let decisions = unchoker.unchoke_review(&peers, false);

        // Uninterested peers never get a slot.
        assert!(!decisions.iter().any(|(a, up)| *a == peers[3].addr && *up));
        // The three fastest interested peers are unchoked.
        for fast in [peers[1].addr, peers[2].addr, peers[0].addr] {
            assert!(decisions.contains(&(fast, true)));
        }
        // At most MAX_UNCHOKED peers may be unchoked at once.
        assert!(decisions.iter().filter(|(_, up)| *up).count() <= MAX_UNCHOKED);
    }

    #[test]
    fn review_is_rate_limited() {
        let mut unchoker = Unchoker::new();
        let peers = vec![view(1, true, true, 10)];
        assert!(!unchoker.unchoke_review(&peers, false).is_empty());
        // Immediately again: inside the interval, nothing to do.
        assert!(unchoker.unchoke_review(&peers, false).is_empty());
    }

    #[test]
    fn already_unchoked_peers_produce_no_decision() {
        let mut unchoker = Unchoker::new();
        let peers = vec![view(1, true, false, 10)];
        let decisions = unchoker.unchoke_review(&peers, false);
        assert!(decisions.is_empty());
    }

    #[test]
    fn choked_slow_peer_is_choked_back() {
        let mut unchoker = Unchoker::new();
        let mut peers: Vec<ChokeView> = (1..=5).map(|n| view(n, true, true, n as u64 * 10)).collect();
        // Pretend peer 1 (slowest) was unchoked earlier.
        peers[0].am_choking = false;
        // Disable the optimistic slot for determinism.
        unchoker.last_optimistic = Some(Instant::now());
        let decisions = unchoker.unchoke_review(&peers, false);
        assert!(decisions.contains(&(peers[0].addr, false)));
    }
}

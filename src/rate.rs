// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::ops::AddAssign;

/// Running throughput tally with a 5 second weighed moving average.
///
/// Bytes are recorded as they arrive; [`RateCounter::tick`] is called once a
/// second from the engine tick, folding the round into the average as
/// `avg = avg * 4/5 + round / 5` so a single noisy second does not distort
/// the rate.
#[derive(Debug, Default)]
pub struct RateCounter {
    total: u64,
    round: u64,
    avg: f64,
}

impl RateCounter {
    const WEIGHT: f64 = 5.0;

    pub fn add(&mut self, bytes: u64) {
        self.total += bytes;
        self.round += bytes;
    }

    /// Closes the current one-second round.
    pub fn tick(&mut self) {
        self.avg = self.avg * (Self::WEIGHT - 1.0) / Self::WEIGHT + self.round as f64 / Self::WEIGHT;
        self.round = 0;
    }

    /// Bytes per second, averaged over the last ~5 rounds.
    pub fn rate(&self) -> u64 {
        self.avg.round() as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

impl AddAssign<u64> for RateCounter {
    fn add_assign(&mut self, rhs: u64) {
        self.add(rhs);
    }
}

/// Byte-rate limiter refilled from the engine tick. A rate of zero means
/// unlimited. The connection layer draws from it before moving bytes; the
/// engine only keeps it topped up.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    rate: f64,
    last_refill: std::time::Instant,
}

impl TokenBucket {
    pub fn new(rate_bps: u64) -> Self {
        let rate = rate_bps as f64;
        Self {
            tokens: if rate == 0.0 { f64::INFINITY } else { rate },
            rate,
            last_refill: std::time::Instant::now(),
        }
    }

    pub fn set_rate(&mut self, rate_bps: u64) {
        self.rate = rate_bps as f64;
        self.tokens = if self.rate == 0.0 {
            f64::INFINITY
        } else {
            // Start a fresh window; a burst allowance of one second.
            self.rate
        };
        self.last_refill = std::time::Instant::now();
    }

    /// Adds the tokens accrued since the last refill, capped at one second
    /// of burst.
    pub fn refill(&mut self, now: std::time::Instant) {
        if self.rate == 0.0 {
            self.tokens = f64::INFINITY;
            self.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.last_refill = now;
    }

    /// Takes up to `wanted` bytes worth of tokens, returning how many were
    /// granted.
    pub fn take(&mut self, wanted: u64) -> u64 {
        if self.tokens.is_infinite() {
            return wanted;
        }
        let granted = (wanted as f64).min(self.tokens.max(0.0));
        self.tokens -= granted;
        granted as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_converges_on_steady_input() {
        let mut counter = RateCounter::default();
        for _ in 0..40 {
            counter.add(10_000);
            counter.tick();
        }
        let rate = counter.rate();
        assert!((9_900..=10_000).contains(&rate), "rate was {rate}");
        assert_eq!(counter.total(), 400_000);
    }

    #[test]
    fn bucket_grants_up_to_rate_and_refills() {
        let mut bucket = TokenBucket::new(10_000);
        assert_eq!(bucket.take(4_000), 4_000);
        assert_eq!(bucket.take(20_000), 6_000);
        assert_eq!(bucket.take(1), 0);

        bucket.refill(std::time::Instant::now() + std::time::Duration::from_millis(500));
        let granted = bucket.take(10_000);
        assert!((4_900..=5_100).contains(&granted), "granted {granted}");
    }

    #[test]
    fn zero_rate_means_unlimited() {
        let mut bucket = TokenBucket::new(0);
        assert_eq!(bucket.take(u64::MAX), u64::MAX);
        bucket.set_rate(100);
        assert_eq!(bucket.take(1_000), 100);
    }

    #[test]
    fn one_spike_does_not_dominate() {
        let mut counter = RateCounter::default();
        counter.add(1_000_000);
        counter.tick();
        assert_eq!(counter.rate(), 200_000);
        counter.tick();
        assert_eq!(counter.rate(), 160_000);
    }
}

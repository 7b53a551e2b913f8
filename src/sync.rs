// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Async exclusion primitives used by the engine.
//!
//! [`Exclusive`] is a single-slot critical section that stays held across
//! `.await` points: entrants chain behind the completion signal of whoever
//! arrived before them, so the section is granted strictly in arrival order.
//! [`Gate`] wraps a counting semaphore with a scoped permit.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use std::sync::Arc;

/// A mutual-exclusion slot protecting `T`, safe to hold across `.await`.
///
/// Each entrant swaps a fresh completion signal into the tail slot, capturing
/// the signal of the previous entrant, and waits for that one to fire before
/// taking the guard. Dropping the guard fires the signal for the next in line.
pub struct Exclusive<T> {
    tail: Mutex<oneshot::Receiver<()>>,
    value: UnsafeCell<T>,
}

// The tail mutex serializes handle creation and the signal chain serializes
// access to `value`, so sharing is sound as long as T itself can move between
// threads.
unsafe impl<T: Send> Send for Exclusive<T> {}
unsafe impl<T: Send> Sync for Exclusive<T> {}

/// Scoped acquisition of an [`Exclusive`]. Releases on every exit path.
pub struct ExclusiveGuard<'a, T> {
    slot: &'a Exclusive<T>,
    release: Option<oneshot::Sender<()>>,
}

/// Keeps the signal chain intact if an `enter()` future is dropped while
/// still queued: the abandoned link forwards its predecessor's completion to
/// its successor instead of silently breaking the chain.
struct Link {
    prior: Option<oneshot::Receiver<()>>,
    next: Option<oneshot::Sender<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        if let (Some(prior), Some(next)) = (self.prior.take(), self.next.take()) {
            tokio::spawn(async move {
                let _ = prior.await;
                let _ = next.send(());
            });
        }
    }
}

impl<T> Exclusive<T> {
    pub fn new(value: T) -> Self {
        // Pre-fired signal so the first entrant passes straight through.
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        Self {
            tail: Mutex::new(rx),
            value: UnsafeCell::new(value),
        }
    }

    /// Waits for every earlier entrant to release, then returns the guard.
    pub async fn enter(&self) -> ExclusiveGuard<'_, T> {
        let (tx, rx) = oneshot::channel();
        let prior = {
            let mut tail = self.tail.lock().expect("exclusive tail poisoned");
            std::mem::replace(&mut *tail, rx)
        };

        let mut link = Link {
            prior: Some(prior),
            next: Some(tx),
        };

        // An Err here means the predecessor vanished without sending, which
        // only happens when its guard was leaked; treat it as released rather
        // than wedging the whole chain.
        let _ = link.prior.as_mut().expect("link already consumed").await;
        link.prior = None;

        ExclusiveGuard {
            slot: self,
            release: link.next.take(),
        }
    }
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.slot.value.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.slot.value.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            // Nobody queued behind us is fine; the tail slot keeps the
            // stored completion for the next arrival.
            let _ = release.send(());
        }
    }
}

/// Scoped wrapper over a counting semaphore.
#[derive(Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

/// Permit returned by [`Gate::enter_async`]. Dropping it releases the slot,
/// so a canceled holder can never leak a permit.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl Gate {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub async fn enter_async(&self) -> Result<GatePermit, AcquireError> {
        let permit = self.permits.clone().acquire_owned().await?;
        Ok(GatePermit { _permit: permit })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Receive-buffer accounting. The connection layer leases a slot per inbound
//! frame; the engine drops the lease when the frame is fully consumed. For
//! Piece messages the lease travels into the async write path and is only
//! released when the disk write completes.

use std::sync::Arc;

use tokio::sync::AcquireError;

use crate::sync::{Gate, GatePermit};

pub const DEFAULT_POOL_SLOTS: usize = 256;

/// Counted pool of inbound buffer slots.
pub struct BufferPool {
    gate: Gate,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            gate: Gate::new(capacity),
            capacity,
        })
    }

    pub async fn lease(self: &Arc<Self>) -> Result<BufferLease, AcquireError> {
        let permit = self.gate.enter_async().await?;
        Ok(BufferLease {
            permit: Some(permit),
        })
    }

    pub fn available(&self) -> usize {
        self.gate.available()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Scoped release token for one leased slot. Exactly one release happens,
/// on drop, whichever path the message takes.
#[derive(Debug, Default)]
pub struct BufferLease {
    permit: Option<GatePermit>,
}

impl BufferLease {
    /// A lease not backed by any pool, for synthetic peers and tests.
    pub fn detached() -> Self {
        Self { permit: None }
    }
}

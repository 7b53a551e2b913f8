// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{event, Level};

use crate::bitfield::Bitfield;
use crate::buffer::BufferLease;
use crate::pex::PexPeer;
use crate::rate::RateCounter;
use crate::wire::{BlockInfo, ExtendedHandshakePayload, Message};

/// Lowest pending-request allowance a peer can be clamped down to.
pub const MIN_PENDING_REQUESTS: u32 = 2;
/// Assumed request tolerance when the peer never advertised `reqq`.
pub const DEFAULT_PEER_REQQ: u32 = 250;

/// Traffic the engine hands to the connection layer for one peer.
#[derive(Debug)]
pub enum LinkCommand {
    Deliver(Message),
    Close,
}

/// Sending side of one peer's socket writer.
#[derive(Debug, Clone)]
pub struct PeerLink {
    tx: mpsc::Sender<LinkCommand>,
}

impl PeerLink {
    pub fn new(tx: mpsc::Sender<LinkCommand>) -> Self {
        Self { tx }
    }

    /// Non-blocking hand-off; gives the message back when the writer is
    /// saturated so it can stay queued.
    pub fn try_deliver(&self, message: Message) -> Result<(), Option<Message>> {
        self.tx
            .try_send(LinkCommand::Deliver(message))
            .map_err(|error| match error {
                mpsc::error::TrySendError::Full(LinkCommand::Deliver(msg)) => Some(msg),
                _ => None,
            })
    }

    pub fn close(&self) {
        let _ = self.tx.try_send(LinkCommand::Close);
    }
}

/// One queued outbound message plus the buffer it may still be borrowing.
#[derive(Debug)]
pub struct Outbound {
    pub message: Message,
    pub lease: BufferLease,
}

/// Per-peer PEX sub-agent: remembers what this peer was last told and emits
/// added/dropped deltas on its own one-minute cadence.
#[derive(Debug)]
pub struct PexAgent {
    known: HashSet<SocketAddr>,
    last_run: Option<Instant>,
}

impl PexAgent {
    pub const INTERVAL: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self {
            known: HashSet::new(),
            last_run: None,
        }
    }

    pub fn due(&self, now: Instant) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now.duration_since(last) >= Self::INTERVAL,
        }
    }

    /// Difference between the swarm view and what this peer already knows.
    pub fn delta(
        &mut self,
        current: &HashSet<SocketAddr>,
        now: Instant,
    ) -> (Vec<SocketAddr>, Vec<SocketAddr>) {
        self.last_run = Some(now);
        let added: Vec<SocketAddr> = current.difference(&self.known).copied().collect();
        let dropped: Vec<SocketAddr> = self.known.difference(current).copied().collect();
        self.known = current.clone();
        (added, dropped)
    }
}

impl Default for PexAgent {
    fn default() -> Self {
        Self::new()
    }
}

/// All engine-side state for one connected peer. Created when the connection
/// layer reports a completed socket, destroyed on cleanup.
#[derive(Debug)]
pub struct PeerSession {
    pub addr: SocketAddr,
    pub id: Option<[u8; 20]>,
    pub link: PeerLink,
    /// Synthetic peers (web seeds) never take part in PEX or choking.
    pub synthetic: bool,

    pub handshaked: bool,
    pub supports_fast: bool,
    pub supports_extended: bool,

    pub am_choking: bool,
    pub is_choking: bool,
    pub am_interested: bool,
    pub is_interested: bool,

    pub bitfield: Bitfield,
    pub is_seeder: bool,
    /// Pieces we allow this peer to request while choked.
    pub allowed_fast_out: HashSet<u32>,
    /// Pieces this peer allows us to request while choked.
    pub allowed_fast_in: HashSet<u32>,
    pub suggested: HashSet<u32>,

    /// Requests we have issued and not yet seen answered.
    pub outstanding_requests: u32,
    /// Requests the peer has issued that we have not yet served or dropped.
    pub requests_from_peer: u32,
    pub max_pending_requests: u32,
    /// The peer's advertised `reqq`, once known.
    pub peer_reqq: Option<u32>,
    /// Uploads whose disk read is still in flight; a Cancel drops the entry
    /// before the Piece reply is ever queued.
    pub pending_uploads: HashSet<BlockInfo>,

    pub connected_at: Instant,
    pub last_message_sent: Instant,
    pub last_message_received: Instant,
    pub last_block_received: Instant,

    pub send_queue: VecDeque<Outbound>,
    pub pex: Option<PexAgent>,
    pub extended: Option<ExtendedHandshakePayload>,
    pub dht_port: Option<u16>,
    pub listen_port: Option<u16>,

    pub pieces_received: u64,
    /// Verification failures attributed to this peer across its lifetime.
    pub hash_failures: u32,
    pub download: RateCounter,
    pub upload: RateCounter,
    /// Advisory: piece_length per Have received; overcounts re-announced
    /// pieces.
    pub estimated_downloaded_bytes: u64,
}

impl PeerSession {
    pub fn new(addr: SocketAddr, link: PeerLink, piece_count: usize) -> Self {
        let now = Instant::now();
        Self {
            addr,
            id: None,
            link,
            synthetic: false,
            handshaked: false,
            supports_fast: false,
            supports_extended: false,
            am_choking: true,
            is_choking: true,
            am_interested: false,
            is_interested: false,
            bitfield: Bitfield::new(piece_count),
            is_seeder: false,
            allowed_fast_out: HashSet::new(),
            allowed_fast_in: HashSet::new(),
            suggested: HashSet::new(),
            outstanding_requests: 0,
            requests_from_peer: 0,
            max_pending_requests: MIN_PENDING_REQUESTS,
            peer_reqq: None,
            pending_uploads: HashSet::new(),
            connected_at: now,
            last_message_sent: now,
            last_message_received: now,
            last_block_received: now,
            send_queue: VecDeque::new(),
            pex: None,
            extended: None,
            dht_port: None,
            listen_port: None,
            pieces_received: 0,
            hash_failures: 0,
            download: RateCounter::default(),
            upload: RateCounter::default(),
            estimated_downloaded_bytes: 0,
        }
    }

    pub fn enqueue(&mut self, message: Message) {
        self.send_queue.push_back(Outbound {
            message,
            lease: BufferLease::detached(),
        });
    }

    pub fn enqueue_with_lease(&mut self, message: Message, lease: BufferLease) {
        self.send_queue.push_back(Outbound { message, lease });
    }

    /// Drains the send queue into the connection layer. Stops at the first
    /// back-pressure and leaves the rest queued for the next nudge.
    pub fn try_process_queue(&mut self) {
        while let Some(out) = self.send_queue.pop_front() {
            match self.link.try_deliver(out.message) {
                Ok(()) => {
                    self.last_message_sent = Instant::now();
                    // Buffer released here: the connection layer owns the
                    // bytes from this point on.
                    drop(out.lease);
                }
                Err(Some(message)) => {
                    self.send_queue.push_front(Outbound {
                        message,
                        lease: out.lease,
                    });
                    break;
                }
                Err(None) => {
                    event!(Level::TRACE, addr = %self.addr, "peer link gone, dropping outbound");
                    break;
                }
            }
        }
    }

    /// Flips our interest, enqueueing at most one wire message per actual
    /// change. Repeated calls with the same value are no-ops.
    pub fn set_am_interested(&mut self, interested: bool) {
        if self.am_interested == interested {
            return;
        }
        self.am_interested = interested;
        self.enqueue(if interested {
            Message::Interested
        } else {
            Message::NotInterested
        });
    }

    /// Flips choking toward the peer, one wire message per actual change.
    pub fn set_am_choking(&mut self, choking: bool) {
        if self.am_choking == choking {
            return;
        }
        self.am_choking = choking;
        self.enqueue(if choking {
            Message::Choke
        } else {
            Message::Unchoke
        });
    }

    /// Whether regular (non allowed-fast) requests may be sent right now.
    pub fn can_request(&self) -> bool {
        self.am_interested && !self.is_choking
    }

    /// How many more requests fit in this peer's pipeline.
    pub fn request_capacity(&self) -> usize {
        self.max_pending_requests.saturating_sub(self.outstanding_requests) as usize
    }

    /// Removes a queued Piece reply matching `block`, if one exists.
    pub fn remove_queued_piece(&mut self, block: &BlockInfo) -> bool {
        let before = self.send_queue.len();
        self.send_queue.retain(|out| {
            !matches!(
                &out.message,
                Message::Piece { index, begin, data }
                    if *index == block.piece_index
                        && *begin == block.offset
                        && data.len() as u32 == block.length
            )
        });
        self.send_queue.len() != before
    }

    /// The PEX view of this peer for gossip to others.
    pub fn as_pex_peer(&self) -> PexPeer {
        PexPeer {
            addr: self.listen_addr(),
            flags: crate::pex::PexFlags {
                seed: self.is_seeder,
                ..Default::default()
            },
        }
    }

    /// Address other peers should dial: the advertised listen port when we
    /// have it, else the connection's source address.
    pub fn listen_addr(&self) -> SocketAddr {
        match self.listen_port {
            Some(port) => SocketAddr::new(self.addr.ip(), port),
            None => self.addr,
        }
    }
}

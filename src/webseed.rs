// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! HTTP web seeds (BEP 19, range-request flavor).
//!
//! A web seed is presented to the engine as a synthetic peer: it handshakes,
//! claims a full bitfield, unchokes immediately, and answers Request
//! messages by fetching the byte range over HTTP. The engine's picker,
//! pipeline and rate accounting treat it like any other seeder.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::Bytes;
use rand::RngCore;
use reqwest::header::RANGE;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::bitfield::Bitfield;
use crate::buffer::BufferLease;
use crate::engine::{EngineEvent, EngineShared, LinkCommand, PeerLink};
use crate::layout::PieceLayout;
use crate::wire::{BlockInfo, Handshake, Message};

/// Stable fake endpoint for one seed URL, kept inside 127.0.0.0/8 so it can
/// never collide with a dialable peer.
fn synthetic_addr(url: &str) -> SocketAddr {
    let digest = Sha1::digest(url.as_bytes());
    let port = u16::from_be_bytes([digest[3], digest[4]]).max(1024);
    SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::new(127, digest[0], digest[1], digest[2]),
        port,
    ))
}

fn worker_peer_id() -> [u8; 20] {
    let mut id = *b"-WS0030-............";
    rand::rng().fill_bytes(&mut id[8..]);
    id
}

pub(crate) fn spawn_worker(
    shared: Arc<EngineShared>,
    url: String,
    info_hash: [u8; 20],
    layout: PieceLayout,
    cancel: CancellationToken,
) {
    tokio::spawn(run_worker(shared, url, info_hash, layout, cancel));
}

async fn run_worker(
    shared: Arc<EngineShared>,
    url: String,
    info_hash: [u8; 20],
    layout: PieceLayout,
    cancel: CancellationToken,
) {
    let addr = synthetic_addr(&url);
    let (link_tx, mut link_rx) = mpsc::channel::<LinkCommand>(64);
    let events = shared.events_tx.clone();

    if events
        .send(EngineEvent::PeerConnected {
            addr,
            link: PeerLink::new(link_tx),
            expected_id: None,
            synthetic: true,
        })
        .await
        .is_err()
    {
        return;
    }

    // Introduce ourselves as a plain (no fast, no extensions) seeder.
    let mut handshake = Handshake::ours(info_hash, worker_peer_id());
    handshake.reserved = [0u8; 8];
    let mut full = Bitfield::new(layout.piece_count() as usize);
    full.set_all();
    for message in [
        Message::Handshake(handshake),
        Message::Bitfield(full.to_wire()),
        Message::Unchoke,
    ] {
        if events
            .send(EngineEvent::Frame {
                addr,
                message,
                lease: BufferLease::detached(),
            })
            .await
            .is_err()
        {
            return;
        }
    }

    let client = reqwest::Client::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = link_rx.recv() => match command {
                None | Some(LinkCommand::Close) => break,
                Some(LinkCommand::Deliver(Message::Request(block))) => {
                    match fetch_block(&client, &url, layout, block).await {
                        Ok(data) if data.len() != block.length as usize => {
                            event!(Level::WARN, url = %url, "web seed returned a short range");
                            break;
                        }
                        Ok(data) => {
                            let frame = EngineEvent::Frame {
                                addr,
                                message: Message::Piece {
                                    index: block.piece_index,
                                    begin: block.offset,
                                    data,
                                },
                                lease: BufferLease::detached(),
                            };
                            if events.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            event!(Level::WARN, url = %url, %error, "web seed fetch failed");
                            break;
                        }
                    }
                }
                // Bundles, chokes and keep-alives from the engine are noise
                // to an HTTP origin.
                Some(LinkCommand::Deliver(_)) => {}
            }
        }
    }

    let _ = events.send(EngineEvent::PeerClosed { addr }).await;
}

async fn fetch_block(
    client: &reqwest::Client,
    url: &str,
    layout: PieceLayout,
    block: BlockInfo,
) -> Result<Bytes, reqwest::Error> {
    let start = layout.global_offset(block.piece_index, block.offset);
    let end = start + block.length as u64 - 1;
    let response = client
        .get(url)
        .header(RANGE, format!("bytes={start}-{end}"))
        .send()
        .await?
        .error_for_status()?;
    response.bytes().await
}

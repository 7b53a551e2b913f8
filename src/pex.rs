// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Peer exchange payloads (BEP 11): compact peer lists plus per-peer flag
//! bytes, carried inside `ut_pex` extension messages.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use serde::{Deserialize, Serialize};

/// Capability flags attached to each `added` peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PexFlags {
    pub encryption: bool,
    pub seed: bool,
    pub utp: bool,
    pub holepunch: bool,
    pub connectable: bool,
}

impl PexFlags {
    pub fn from_byte(b: u8) -> Self {
        Self {
            encryption: b & 0x01 != 0,
            seed: b & 0x02 != 0,
            utp: b & 0x04 != 0,
            holepunch: b & 0x08 != 0,
            connectable: b & 0x10 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.encryption {
            b |= 0x01;
        }
        if self.seed {
            b |= 0x02;
        }
        if self.utp {
            b |= 0x04;
        }
        if self.holepunch {
            b |= 0x08;
        }
        if self.connectable {
            b |= 0x10;
        }
        b
    }
}

/// A peer learned (or advertised) through PEX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PexPeer {
    pub addr: SocketAddr,
    pub flags: PexFlags,
}

/// The bencoded `ut_pex` payload.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct PexPayload {
    #[serde(default, with = "serde_bytes")]
    pub added: Vec<u8>,
    #[serde(rename = "added.f", default, with = "serde_bytes")]
    pub added_f: Vec<u8>,
    #[serde(default, with = "serde_bytes")]
    pub dropped: Vec<u8>,
    #[serde(default, with = "serde_bytes")]
    pub added6: Vec<u8>,
    #[serde(rename = "added6.f", default, with = "serde_bytes")]
    pub added6_f: Vec<u8>,
    #[serde(default, with = "serde_bytes")]
    pub dropped6: Vec<u8>,
}

impl PexPayload {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.added6.is_empty()
            && self.dropped.is_empty()
            && self.dropped6.is_empty()
    }

    /// Builds a payload from added/dropped deltas, splitting by family.
    pub fn from_deltas(added: &[PexPeer], dropped: &[SocketAddr]) -> Self {
        let mut payload = Self::default();
        for peer in added {
            match peer.addr {
                SocketAddr::V4(v4) => {
                    payload.added.extend_from_slice(&v4.ip().octets());
                    payload.added.extend_from_slice(&v4.port().to_be_bytes());
                    payload.added_f.push(peer.flags.to_byte());
                }
                SocketAddr::V6(v6) => {
                    payload.added6.extend_from_slice(&v6.ip().octets());
                    payload.added6.extend_from_slice(&v6.port().to_be_bytes());
                    payload.added6_f.push(peer.flags.to_byte());
                }
            }
        }
        for addr in dropped {
            match addr {
                SocketAddr::V4(v4) => {
                    payload.dropped.extend_from_slice(&v4.ip().octets());
                    payload.dropped.extend_from_slice(&v4.port().to_be_bytes());
                }
                SocketAddr::V6(v6) => {
                    payload.dropped6.extend_from_slice(&v6.ip().octets());
                    payload.dropped6.extend_from_slice(&v6.port().to_be_bytes());
                }
            }
        }
        payload
    }

    /// All `added` peers with their flags, both address families.
    pub fn added_peers(&self) -> Vec<PexPeer> {
        let mut peers = Vec::new();
        for (chunk, flag) in self.added.chunks_exact(6).zip(flags_iter(&self.added_f)) {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            peers.push(PexPeer {
                addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
                flags: flag,
            });
        }
        for (chunk, flag) in self.added6.chunks_exact(18).zip(flags_iter(&self.added6_f)) {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            peers.push(PexPeer {
                addr: SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), port, 0, 0)),
                flags: flag,
            });
        }
        peers
    }

    pub fn dropped_peers(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();
        for chunk in self.dropped.chunks_exact(6) {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            addrs.push(SocketAddr::V4(SocketAddrV4::new(ip, port)));
        }
        for chunk in self.dropped6.chunks_exact(18) {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            addrs.push(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(ip),
                port,
                0,
                0,
            )));
        }
        addrs
    }
}

// Missing flag bytes decode as "no flags"; some clients omit the tail.
fn flags_iter(flags: &[u8]) -> impl Iterator<Item = PexFlags> + '_ {
    flags
        .iter()
        .copied()
        .map(PexFlags::from_byte)
        .chain(std::iter::repeat(PexFlags::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port))
    }

    #[test]
    fn deltas_roundtrip_through_bencode() {
        let added = vec![
            PexPeer {
                addr: v4(10, 0, 0, 1, 6881),
                flags: PexFlags {
                    seed: true,
                    ..Default::default()
                },
            },
            PexPeer {
                addr: "[2001:db8::1]:51413".parse().unwrap(),
                flags: PexFlags::default(),
            },
        ];
        let dropped = vec![v4(192, 168, 1, 9, 1337)];

        let payload = PexPayload::from_deltas(&added, &dropped);
        let raw = serde_bencode::to_bytes(&payload).unwrap();
        let back: PexPayload = serde_bencode::from_bytes(&raw).unwrap();

        let peers = back.added_peers();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].addr, v4(10, 0, 0, 1, 6881));
        assert!(peers[0].flags.seed);
        assert!(peers[1].addr.is_ipv6());
        assert_eq!(back.dropped_peers(), dropped);
    }

    #[test]
    fn seed_bit_is_0x02() {
        assert!(PexFlags::from_byte(0x02).seed);
        assert!(!PexFlags::from_byte(0x1D).seed);
        let flags = PexFlags {
            seed: true,
            connectable: true,
            ..Default::default()
        };
        assert_eq!(flags.to_byte(), 0x12);
    }

    #[test]
    fn short_flag_list_defaults_remaining_peers() {
        let added = vec![
            PexPeer {
                addr: v4(1, 1, 1, 1, 1),
                flags: PexFlags {
                    seed: true,
                    ..Default::default()
                },
            },
            PexPeer {
                addr: v4(2, 2, 2, 2, 2),
                flags: PexFlags::default(),
            },
        ];
        let mut payload = PexPayload::from_deltas(&added, &[]);
        payload.added_f.truncate(1);
        let peers = payload.added_peers();
        assert!(peers[0].flags.seed);
        assert!(!peers[1].flags.seed);
    }
}

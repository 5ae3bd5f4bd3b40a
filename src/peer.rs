//! # Peer Records and Bitfields
//!
//! Types shared by the tracker client, the sessions and the coordinator:
//! peer addresses as discovered by the tracker, the piece-availability
//! bitfield, and the four-flag choke/interest state every connection tracks.
//!
//! ## Compact Peer Format
//!
//! Trackers answering `compact=1` encode each peer in 6 bytes:
//!
//! ```text
//! <IPv4: 4 bytes><port: 2 bytes, big-endian>
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{Error, Result, WireError};

const COMPACT_PEER_SIZE: usize = 6;

/// Stable identifier the coordinator assigns to each session.
pub type PeerKey = usize;

/// A peer endpoint as reported by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerAddr {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parse a compact tracker peer list (6 bytes per peer).
pub fn parse_compact_peers(data: &[u8]) -> Result<Vec<PeerAddr>> {
    if data.len() % COMPACT_PEER_SIZE != 0 {
        return Err(Error::Tracker(format!(
            "compact peer list length {} is not a multiple of {COMPACT_PEER_SIZE}",
            data.len()
        )));
    }

    Ok(data
        .chunks_exact(COMPACT_PEER_SIZE)
        .map(|chunk| PeerAddr {
            ip: IpAddr::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect())
}

/// The four booleans of a connection's choke/interest state.
///
/// Initialized to the protocol's opening state: both sides choking, neither
/// interested.
#[derive(Debug, Clone, Copy)]
pub struct PeerFlags {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for PeerFlags {
    fn default() -> Self {
        PeerFlags {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Piece-availability bit vector, MSB first within each byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    num_pieces: u32,
}

impl Bitfield {
    /// An all-zero bitfield for `num_pieces` pieces.
    pub fn new(num_pieces: u32) -> Bitfield {
        Bitfield {
            bits: vec![0; num_pieces.div_ceil(8) as usize],
            num_pieces,
        }
    }

    /// Validate and adopt a received bitfield payload.
    ///
    /// The payload must be exactly `ceil(P / 8)` bytes, and every bit past
    /// piece `P - 1` must be zero; anything else is a protocol violation.
    pub fn from_payload(payload: &[u8], num_pieces: u32) -> Result<Bitfield> {
        let expected = num_pieces.div_ceil(8) as usize;
        if payload.len() != expected {
            return Err(WireError::ProtocolViolation(format!(
                "bitfield is {} bytes, expected {expected}",
                payload.len()
            ))
            .into());
        }

        let spare = expected as u32 * 8 - num_pieces;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if payload[expected - 1] & mask != 0 {
                return Err(WireError::ProtocolViolation(
                    "bitfield has spare bits set".into(),
                )
                .into());
            }
        }

        Ok(Bitfield {
            bits: payload.to_vec(),
            num_pieces,
        })
    }

    pub fn has(&self, index: u32) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        self.bits[(index / 8) as usize] >> (7 - index % 8) & 1 != 0
    }

    pub fn set(&mut self, index: u32) {
        if index < self.num_pieces {
            self.bits[(index / 8) as usize] |= 1 << (7 - index % 8);
        }
    }

    pub fn count(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    pub fn num_pieces(&self) -> u32 {
        self.num_pieces
    }

    /// Wire payload for a bitfield message.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone()
    }

    /// Indices of set bits, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.num_pieces).filter(|i| self.has(*i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peer_entries() {
        let data = [192, 168, 1, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80];
        let peers = parse_compact_peers(&data).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].ip, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[1].port, 80);
    }

    #[test]
    fn rejects_ragged_compact_lists() {
        assert!(parse_compact_peers(&[1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn flags_start_choked_and_uninterested() {
        let flags = PeerFlags::default();
        assert!(flags.am_choking);
        assert!(!flags.am_interested);
        assert!(flags.peer_choking);
        assert!(!flags.peer_interested);
    }

    #[test]
    fn bitfield_set_and_lookup_are_msb_first() {
        let mut field = Bitfield::new(10);
        field.set(0);
        field.set(9);
        assert_eq!(field.to_bytes(), vec![0b1000_0000, 0b0100_0000]);
        assert!(field.has(0));
        assert!(!field.has(1));
        assert!(field.has(9));
        assert!(!field.has(10)); // out of range reads as absent
        assert_eq!(field.count(), 2);
    }

    #[test]
    fn payload_spare_bits_must_be_zero() {
        // 10 pieces -> 2 bytes, low 6 bits of byte 1 are spare
        assert!(Bitfield::from_payload(&[0xff, 0b1100_0000], 10).is_ok());
        assert!(Bitfield::from_payload(&[0xff, 0b1110_0000], 10).is_err());
        assert!(Bitfield::from_payload(&[0xff], 10).is_err());
        assert!(Bitfield::from_payload(&[0xff, 0, 0], 10).is_err());
    }

    #[test]
    fn iter_set_yields_ascending_indices() {
        let field = Bitfield::from_payload(&[0b1010_0000, 0b0100_0000], 10).unwrap();
        assert_eq!(field.iter_set().collect::<Vec<_>>(), vec![0, 2, 9]);
    }
}

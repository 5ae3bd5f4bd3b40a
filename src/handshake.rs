//! # Opening Handshake
//!
//! The fixed 68-byte exchange that opens every peer connection.
//!
//! ## Layout
//!
//! ```text
//! <pstrlen=19><pstr="BitTorrent protocol"><reserved: 8 zero bytes><info_hash: 20><peer_id: 20>
//! ```
//!
//! A received handshake is rejected unless its first 20 bytes match the
//! protocol header exactly and its info digest equals ours. Reserved bytes
//! are ignored on receive; we send all zeros.

use std::io::{Read, Write};

use crate::error::{Error, Result, WireError};

const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";

/// Total handshake size on the wire.
pub const HANDSHAKE_LEN: usize = 68;

/// One endpoint's handshake: its swarm identifier and peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake { info_hash, peer_id }
    }

    /// Serialize into the fixed wire layout.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_ID.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_ID);
        // bytes 20..28 stay zero (reserved)
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parse a received handshake, validating the protocol header.
    pub fn parse(buf: &[u8; HANDSHAKE_LEN]) -> Result<Handshake> {
        if buf[0] as usize != PROTOCOL_ID.len() || &buf[1..20] != PROTOCOL_ID {
            return Err(WireError::HandshakeMismatch.into());
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.serialize()).map_err(Error::Io)
    }

    /// Read and validate the remote handshake, then check its info digest
    /// against `expected`.
    pub fn read_from<R: Read>(reader: &mut R, expected: &[u8; 20]) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).map_err(Error::Io)?;

        let handshake = Handshake::parse(&buf)?;
        if &handshake.info_hash != expected {
            return Err(WireError::HandshakeMismatch.into());
        }

        Ok(handshake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn serializes_to_exact_layout() {
        let hs = Handshake::new([0xaa; 20], [0xbb; 20]);
        let buf = hs.serialize();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[20..28], &[0u8; 8]);
        assert_eq!(&buf[28..48], &[0xaa; 20]);
        assert_eq!(&buf[48..68], &[0xbb; 20]);
    }

    #[test]
    fn round_trips_back_to_back() {
        let ours = Handshake::new([1; 20], [2; 20]);
        let mut wire = Cursor::new(ours.serialize().to_vec());
        let theirs = Handshake::read_from(&mut wire, &[1; 20]).unwrap();
        assert_eq!(theirs, ours);
    }

    #[test]
    fn rejects_foreign_info_hash() {
        let remote = Handshake::new([1; 20], [2; 20]);
        let mut wire = Cursor::new(remote.serialize().to_vec());
        let err = Handshake::read_from(&mut wire, &[9; 20]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Wire(WireError::HandshakeMismatch)
        ));
    }

    #[test]
    fn rejects_foreign_protocol_header() {
        let mut buf = Handshake::new([1; 20], [2; 20]).serialize();
        buf[3] ^= 0x20; // corrupt one protocol-string byte
        assert!(Handshake::parse(&buf).is_err());

        let mut buf = Handshake::new([1; 20], [2; 20]).serialize();
        buf[0] = 18; // wrong pstrlen
        assert!(Handshake::parse(&buf).is_err());
    }

    #[test]
    fn ignores_reserved_bits() {
        let mut buf = Handshake::new([1; 20], [2; 20]).serialize();
        buf[20..28].copy_from_slice(&[0xff; 8]);
        assert!(Handshake::parse(&buf).is_ok());
    }
}

//! # Peer Wire Messages
//!
//! Length-prefixed message codec for the peer wire protocol. Every frame is
//! a big-endian u32 length `N` followed by `N` bytes; `N = 0` is a
//! keep-alive, otherwise the first body byte is the message id.
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | choke | empty |
//! | 1 | unchoke | empty |
//! | 2 | interested | empty |
//! | 3 | not interested | empty |
//! | 4 | have | u32 piece index |
//! | 5 | bitfield | one bit per piece, MSB first |
//! | 6 | request | u32 index, u32 begin, u32 length |
//! | 7 | piece | u32 index, u32 begin, block bytes |
//! | 8 | cancel | u32 index, u32 begin, u32 length |
//!
//! Unknown ids are consumed exactly and surfaced as [`Message::Unknown`] so
//! the session can discard them without desynchronizing the stream. Frames
//! longer than [`MAX_FRAME_LEN`] are refused before any allocation.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result, WireError};

/// Upper bound on a frame body: a 128 KiB block reply plus its header.
pub const MAX_FRAME_LEN: u32 = (1 << 17) + 9;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;

/// One peer wire message, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// A message id this client does not implement; body already consumed.
    Unknown(u8),
}

impl Message {
    /// Serialize into a length-prefixed frame.
    ///
    /// [`Message::Unknown`] has no wire form and serializes as a keep-alive.
    pub fn serialize(&self) -> Vec<u8> {
        let (id, payload): (Option<u8>, Vec<u8>) = match self {
            Message::KeepAlive | Message::Unknown(_) => (None, vec![]),
            Message::Choke => (Some(ID_CHOKE), vec![]),
            Message::Unchoke => (Some(ID_UNCHOKE), vec![]),
            Message::Interested => (Some(ID_INTERESTED), vec![]),
            Message::NotInterested => (Some(ID_NOT_INTERESTED), vec![]),
            Message::Have(index) => (Some(ID_HAVE), index.to_be_bytes().to_vec()),
            Message::Bitfield(bits) => (Some(ID_BITFIELD), bits.clone()),
            Message::Request { index, begin, length } => {
                (Some(ID_REQUEST), triple(*index, *begin, *length))
            }
            Message::Cancel { index, begin, length } => {
                (Some(ID_CANCEL), triple(*index, *begin, *length))
            }
            Message::Piece { index, begin, block } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                (Some(ID_PIECE), payload)
            }
        };

        let body_len = id.map_or(0, |_| 1 + payload.len());
        let mut frame = Vec::with_capacity(4 + body_len);
        frame.extend_from_slice(&(body_len as u32).to_be_bytes());
        if let Some(id) = id {
            frame.push(id);
            frame.extend_from_slice(&payload);
        }
        frame
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.serialize()).map_err(Error::Io)
    }

    /// Read exactly one frame from `reader`.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Message> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).map_err(Error::Io)?;
        let frame_len = u32::from_be_bytes(len_buf);

        if frame_len == 0 {
            return Ok(Message::KeepAlive);
        }
        if frame_len > MAX_FRAME_LEN {
            return Err(WireError::OversizeMessage(frame_len).into());
        }

        let mut body = vec![0u8; frame_len as usize];
        reader.read_exact(&mut body).map_err(Error::Io)?;

        Message::parse(&body)
    }

    /// Decode a frame body (id byte plus payload).
    pub fn parse(body: &[u8]) -> Result<Message> {
        if body.is_empty() {
            return Err(WireError::FramingViolation("empty frame body".into()).into());
        }
        let id = body[0];
        let payload = &body[1..];

        let message = match id {
            ID_CHOKE => expect_empty(id, payload, Message::Choke)?,
            ID_UNCHOKE => expect_empty(id, payload, Message::Unchoke)?,
            ID_INTERESTED => expect_empty(id, payload, Message::Interested)?,
            ID_NOT_INTERESTED => expect_empty(id, payload, Message::NotInterested)?,
            ID_HAVE => {
                if payload.len() != 4 {
                    return Err(framing("have", payload.len()));
                }
                Message::Have(u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]))
            }
            ID_BITFIELD => Message::Bitfield(payload.to_vec()),
            ID_REQUEST | ID_CANCEL => {
                if payload.len() != 12 {
                    return Err(framing("request/cancel", payload.len()));
                }
                let mut cursor = Cursor::new(payload);
                let index = cursor.read_u32::<BigEndian>().map_err(Error::Io)?;
                let begin = cursor.read_u32::<BigEndian>().map_err(Error::Io)?;
                let length = cursor.read_u32::<BigEndian>().map_err(Error::Io)?;
                if id == ID_REQUEST {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            ID_PIECE => {
                if payload.len() < 8 {
                    return Err(framing("piece", payload.len()));
                }
                let mut cursor = Cursor::new(&payload[..8]);
                let index = cursor.read_u32::<BigEndian>().map_err(Error::Io)?;
                let begin = cursor.read_u32::<BigEndian>().map_err(Error::Io)?;
                Message::Piece {
                    index,
                    begin,
                    block: payload[8..].to_vec(),
                }
            }
            other => Message::Unknown(other),
        };

        Ok(message)
    }
}

fn triple(index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    // infallible: Vec<u8> writes cannot error
    let _ = payload.write_u32::<BigEndian>(index);
    let _ = payload.write_u32::<BigEndian>(begin);
    let _ = payload.write_u32::<BigEndian>(length);
    payload
}

fn expect_empty(id: u8, payload: &[u8], message: Message) -> Result<Message> {
    if payload.is_empty() {
        Ok(message)
    } else {
        Err(WireError::FramingViolation(format!(
            "message id {id} carries {} unexpected payload bytes",
            payload.len()
        ))
        .into())
    }
}

fn framing(what: &str, got: usize) -> Error {
    WireError::FramingViolation(format!("bad {what} payload length {got}")).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(message: Message) {
        let mut wire = Cursor::new(message.serialize());
        assert_eq!(Message::read_from(&mut wire).unwrap(), message);
    }

    #[test]
    fn round_trips_every_kind() {
        round_trip(Message::KeepAlive);
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have(42));
        round_trip(Message::Bitfield(vec![0b1010_0000, 0x01]));
        round_trip(Message::Request { index: 1, begin: 16384, length: 16384 });
        round_trip(Message::Piece { index: 1, begin: 0, block: vec![7; 512] });
        round_trip(Message::Cancel { index: 1, begin: 16384, length: 16384 });
    }

    #[test]
    fn keep_alive_is_a_bare_zero_length() {
        assert_eq!(Message::KeepAlive.serialize(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn refuses_oversize_frames() {
        let mut frame = (MAX_FRAME_LEN + 1).to_be_bytes().to_vec();
        frame.push(ID_PIECE);
        let err = Message::read_from(&mut Cursor::new(frame)).unwrap_err();
        assert!(matches!(
            err,
            Error::Wire(WireError::OversizeMessage(n)) if n == MAX_FRAME_LEN + 1
        ));
    }

    #[test]
    fn unknown_ids_are_consumed_and_tagged() {
        let mut frame = 5u32.to_be_bytes().to_vec();
        frame.push(20); // extension id we do not speak
        frame.extend_from_slice(&[1, 2, 3, 4]);
        let mut wire = Cursor::new(frame);
        assert_eq!(Message::read_from(&mut wire).unwrap(), Message::Unknown(20));
        // the stream is fully drained
        assert_eq!(wire.position() as usize, wire.get_ref().len());
    }

    #[test]
    fn rejects_short_fixed_payloads() {
        for body in [
            vec![ID_HAVE, 0, 0],
            vec![ID_REQUEST, 0, 0, 0, 0],
            vec![ID_PIECE, 0, 0, 0, 0, 0, 0],
            vec![ID_CHOKE, 9],
        ] {
            assert!(matches!(
                Message::parse(&body),
                Err(Error::Wire(WireError::FramingViolation(_)))
            ));
        }
    }
}

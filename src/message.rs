//! # Peer Wire Messages
//!
//! Every post-handshake message is framed as:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - Length prefix: 4 bytes (big-endian u32), counting the ID and payload
//! - Message ID: 1 byte
//! - Payload: `length - 1` bytes
//!
//! A length of 0 is a keep-alive with no ID or payload.
//!
//! | ID | Name           | Payload                 |
//! |----|----------------|-------------------------|
//! | 0  | choke          | none                    |
//! | 1  | unchoke        | none                    |
//! | 2  | interested     | none                    |
//! | 3  | not interested | none                    |
//! | 4  | have           | piece index             |
//! | 5  | bitfield       | raw bits                |
//! | 6  | request        | index, begin, length    |
//! | 7  | piece          | index, begin, block     |
//! | 8  | cancel         | index, begin, length    |
//! | 9  | port           | DHT port                |
//!
//! All multi-byte integer fields are big-endian.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::client::SessionError;

/// Largest frame a peer may send: a full 128 KiB block plus the piece
/// message header. Anything longer drops the connection.
pub const MAX_FRAME_LEN: u32 = (1 << 17) + 9;

const MSG_CHOKE: u8 = 0;
const MSG_UNCHOKE: u8 = 1;
const MSG_INTERESTED: u8 = 2;
const MSG_NOT_INTERESTED: u8 = 3;
const MSG_HAVE: u8 = 4;
const MSG_BITFIELD: u8 = 5;
const MSG_REQUEST: u8 = 6;
const MSG_PIECE: u8 = 7;
const MSG_CANCEL: u8 = 8;
const MSG_PORT: u8 = 9;

/// A parsed peer wire message.
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
    Port(u16),
}

impl Message {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not interested",
            Message::Have(_) => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request { .. } => "request",
            Message::Piece { .. } => "piece",
            Message::Cancel { .. } => "cancel",
            Message::Port(_) => "port",
        }
    }

    /// Serialize with the 4-byte length prefix.
    pub fn serialize(&self) -> Vec<u8> {
        let (id, payload): (u8, Vec<u8>) = match *self {
            Message::KeepAlive => return vec![0, 0, 0, 0],
            Message::Choke => (MSG_CHOKE, vec![]),
            Message::Unchoke => (MSG_UNCHOKE, vec![]),
            Message::Interested => (MSG_INTERESTED, vec![]),
            Message::NotInterested => (MSG_NOT_INTERESTED, vec![]),
            Message::Have(index) => (MSG_HAVE, index.to_be_bytes().to_vec()),
            Message::Bitfield(ref bits) => (MSG_BITFIELD, bits.clone()),
            Message::Request { index, begin, length } => {
                (MSG_REQUEST, triple(index, begin, length))
            }
            Message::Piece { index, begin, ref block } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                (MSG_PIECE, payload)
            }
            Message::Cancel { index, begin, length } => {
                (MSG_CANCEL, triple(index, begin, length))
            }
            Message::Port(port) => (MSG_PORT, port.to_be_bytes().to_vec()),
        };

        let mut frame = Vec::with_capacity(4 + 1 + payload.len());
        frame.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
        frame.push(id);
        frame.extend_from_slice(&payload);
        frame
    }

    /// Parse a frame body (message ID plus payload, the length prefix
    /// already stripped). Keep-alives have an empty body and are handled by
    /// the framing layer.
    pub fn parse(frame: &[u8]) -> Result<Message, SessionError> {
        let (&id, payload) = frame
            .split_first()
            .ok_or(SessionError::MalformedMessage("empty frame"))?;
        match id {
            MSG_CHOKE => expect_empty(payload, Message::Choke),
            MSG_UNCHOKE => expect_empty(payload, Message::Unchoke),
            MSG_INTERESTED => expect_empty(payload, Message::Interested),
            MSG_NOT_INTERESTED => expect_empty(payload, Message::NotInterested),
            MSG_HAVE => {
                if payload.len() != 4 {
                    return Err(SessionError::MalformedMessage("have"));
                }
                let mut cursor = Cursor::new(payload);
                Ok(Message::Have(cursor.read_u32::<BigEndian>()?))
            }
            MSG_BITFIELD => Ok(Message::Bitfield(payload.to_vec())),
            MSG_REQUEST | MSG_CANCEL => {
                if payload.len() != 12 {
                    return Err(SessionError::MalformedMessage("request"));
                }
                let mut cursor = Cursor::new(payload);
                let index = cursor.read_u32::<BigEndian>()?;
                let begin = cursor.read_u32::<BigEndian>()?;
                let length = cursor.read_u32::<BigEndian>()?;
                Ok(if id == MSG_REQUEST {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                })
            }
            MSG_PIECE => {
                if payload.len() < 8 {
                    return Err(SessionError::MalformedMessage("piece"));
                }
                let mut cursor = Cursor::new(&payload[..8]);
                let index = cursor.read_u32::<BigEndian>()?;
                let begin = cursor.read_u32::<BigEndian>()?;
                Ok(Message::Piece { index, begin, block: payload[8..].to_vec() })
            }
            MSG_PORT => {
                if payload.len() != 2 {
                    return Err(SessionError::MalformedMessage("port"));
                }
                let mut cursor = Cursor::new(payload);
                Ok(Message::Port(cursor.read_u16::<BigEndian>()?))
            }
            other => Err(SessionError::UnexpectedMessageId(other)),
        }
    }
}

fn triple(index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&begin.to_be_bytes());
    payload.extend_from_slice(&length.to_be_bytes());
    payload
}

fn expect_empty(payload: &[u8], message: Message) -> Result<Message, SessionError> {
    if payload.is_empty() {
        Ok(message)
    } else {
        Err(SessionError::MalformedMessage("unexpected payload"))
    }
}

//! # Peer Handshake
//!
//! The handshake is the first thing exchanged on a peer connection, in both
//! directions, before any framed message. It is a fixed 68-byte string:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte, always 19
//! - **pstr**: `"BitTorrent protocol"`
//! - **reserved**: 8 bytes, all zeros (no extensions)
//! - **info_hash**: 20 bytes, identifies the swarm
//! - **peer_id**: 20 bytes, identifies the peer
//!
//! A received handshake whose protocol string or info hash does not match
//! drops the connection; the remote peer id is recorded but not otherwise
//! validated.

use crate::client::SessionError;
use crate::torrent::SHA1_HASH_SIZE;

const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";

/// Total size of a handshake on the wire.
pub const HANDSHAKE_LEN: usize = 49 + PROTOCOL_ID.len();

/// The fields a handshake carries.
pub struct Handshake {
    pub info_hash: [u8; SHA1_HASH_SIZE],
    pub peer_id: [u8; SHA1_HASH_SIZE],
}

impl Handshake {
    pub fn new(info_hash: [u8; SHA1_HASH_SIZE], peer_id: [u8; SHA1_HASH_SIZE]) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    /// Serialize into the 68-byte wire form.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_ID.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_ID);
        // Bytes 20..28 are the reserved field, left zeroed.
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parse a received handshake, validating the protocol string.
    pub fn parse(buf: &[u8; HANDSHAKE_LEN]) -> Result<Handshake, SessionError> {
        if buf[0] as usize != PROTOCOL_ID.len() || &buf[1..20] != PROTOCOL_ID {
            return Err(SessionError::HandshakeMismatch);
        }
        let mut info_hash = [0u8; SHA1_HASH_SIZE];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; SHA1_HASH_SIZE];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Handshake { info_hash, peer_id })
    }
}

//! # Peer Connection
//!
//! One TCP connection to one remote peer: connect, exchange handshakes,
//! then read and write framed messages.
//!
//! ## Connection states
//!
//! Each side of a connection carries four flags:
//!
//! - `am_choking` / `am_interested`: our view towards the peer
//! - `peer_choking` / `peer_interested`: the peer's view towards us
//!
//! A connection starts choked in both directions and interested in neither.
//! Requests may only be sent while the peer has unchoked us and we are
//! interested.
//!
//! ## Bitfield
//!
//! The peer's piece availability is a compact bit array, bit 7 of byte 0
//! being piece 0. A `bitfield` message must have exactly
//! `ceil(piece_count / 8)` bytes and no spare bit set beyond the last
//! piece; violations drop the connection.
//!
//! ## Timeouts
//!
//! TCP connect and the handshake exchange get 10 seconds each. After the
//! handshake the socket switches to a short poll timeout so the session
//! loop can run its timers; a connection with no inbound data for 150
//! seconds is considered dead.

use std::io::{self, Cursor, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

use crate::handshake::{Handshake, HANDSHAKE_LEN};
use crate::message::{Message, MAX_FRAME_LEN};
use crate::peer::PeerAddress;
use crate::torrent::SHA1_HASH_SIZE;

/// TCP connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The handshake must complete, both directions, within this.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Granularity at which an idle read hands control back to the session
/// loop for keep-alives and work claims.
const READ_POLL: Duration = Duration::from_secs(2);

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// A connection with no inbound data for this long is dead.
pub const INBOUND_SILENCE: Duration = Duration::from_secs(150);

/// Errors that tear down a peer session. All of these are local to the
/// session; the download as a whole continues.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not connect to peer in time")]
    ConnectTimeout,
    #[error("handshake mismatch")]
    HandshakeMismatch,
    #[error("frame length {0} exceeds limit")]
    BadFrameLength(u32),
    #[error("bitfield has {actual} bytes, expected {expected}")]
    BitfieldSizeMismatch { expected: usize, actual: usize },
    #[error("bitfield has spare bits set")]
    BitfieldSpareBitsSet,
    #[error("unexpected message id {0}")]
    UnexpectedMessageId(u8),
    #[error("malformed {0} message")]
    MalformedMessage(&'static str),
    #[error("unsolicited block for piece {index} at offset {begin}")]
    UnsolicitedPiece { index: u32, begin: u32 },
    #[error("no data from peer within the silence limit")]
    ReadTimeout,
    #[error("no piece data from peer while work was claimed")]
    Stalled,
    #[error("peer closed connection")]
    PeerClosedConnection,
    #[error("too many corrupt pieces from peer")]
    TooManyCorrupt,
    #[error("peer io: {0}")]
    Io(#[from] io::Error),
}

/// Test whether `index` is set in a piece bitfield.
pub(crate) fn bit_set(bits: &[u8], index: u32) -> bool {
    let byte = (index / 8) as usize;
    byte < bits.len() && bits[byte] >> (7 - index % 8) & 1 != 0
}

/// Set `index` in a piece bitfield.
pub(crate) fn set_bit(bits: &mut [u8], index: u32) {
    bits[(index / 8) as usize] |= 1 << (7 - index % 8);
}

/// Validate a received bitfield payload against the torrent's piece count:
/// exact byte length, and no bit set past the last piece.
pub(crate) fn validate_bitfield(bits: &[u8], piece_count: u32) -> Result<(), SessionError> {
    let expected = piece_count.div_ceil(8) as usize;
    if bits.len() != expected {
        return Err(SessionError::BitfieldSizeMismatch { expected, actual: bits.len() });
    }
    let spare = expected as u32 * 8 - piece_count;
    if spare > 0 {
        let mask = (1u8 << spare) - 1;
        if bits[expected - 1] & mask != 0 {
            return Err(SessionError::BitfieldSpareBitsSet);
        }
    }
    Ok(())
}

fn map_read_error(error: io::Error) -> SessionError {
    match error.kind() {
        io::ErrorKind::UnexpectedEof => SessionError::PeerClosedConnection,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => SessionError::ReadTimeout,
        _ => SessionError::Io(error),
    }
}

/// A connected, handshaken peer.
pub struct Client {
    addr: PeerAddress,
    conn: TcpStream,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    bitfield: Vec<u8>,
    piece_count: u32,
}

impl Client {
    /// Open a TCP connection to `addr` and exchange handshakes.
    ///
    /// The peer's handshake must carry the same protocol string and the
    /// same info hash as ours; any mismatch drops the connection.
    pub fn connect(
        addr: PeerAddress,
        info_hash: &[u8; SHA1_HASH_SIZE],
        peer_id: &[u8; SHA1_HASH_SIZE],
        piece_count: u32,
    ) -> Result<Client, SessionError> {
        let socket = SocketAddr::new(IpAddr::V4(addr.ip), addr.port);
        let conn = TcpStream::connect_timeout(&socket, CONNECT_TIMEOUT).map_err(|e| {
            match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                    SessionError::ConnectTimeout
                }
                _ => SessionError::Io(e),
            }
        })?;
        conn.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        conn.set_write_timeout(Some(WRITE_TIMEOUT))?;

        let mut client = Client {
            addr,
            conn,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: vec![0; piece_count.div_ceil(8) as usize],
            piece_count,
        };
        client.exchange_handshake(info_hash, peer_id)?;
        client.conn.set_read_timeout(Some(READ_POLL))?;
        Ok(client)
    }

    fn exchange_handshake(
        &mut self,
        info_hash: &[u8; SHA1_HASH_SIZE],
        peer_id: &[u8; SHA1_HASH_SIZE],
    ) -> Result<(), SessionError> {
        self.conn
            .write_all(&Handshake::new(*info_hash, *peer_id).serialize())?;

        let mut buf = [0u8; HANDSHAKE_LEN];
        self.conn.read_exact(&mut buf).map_err(map_read_error)?;
        let theirs = Handshake::parse(&buf)?;
        if theirs.info_hash != *info_hash {
            return Err(SessionError::HandshakeMismatch);
        }
        debug!(
            "handshake with {} complete, peer id {}",
            self.addr,
            String::from_utf8_lossy(&theirs.peer_id[..8]),
        );
        Ok(())
    }

    /// Read one framed message.
    ///
    /// Returns `Ok(None)` when the connection was idle for one poll
    /// interval without starting a frame, so the caller can run its
    /// timers. Once a frame has started, the read continues until the
    /// frame completes or the silence limit passes.
    pub fn read_frame(&mut self) -> Result<Option<Message>, SessionError> {
        let mut prefix = [0u8; 4];
        if self.read_full(&mut prefix, true)?.is_none() {
            return Ok(None);
        }
        let frame_len = Cursor::new(&prefix).read_u32::<BigEndian>()?;
        if frame_len == 0 {
            debug!("receive keep-alive from {}", self.addr);
            return Ok(Some(Message::KeepAlive));
        }
        if frame_len > MAX_FRAME_LEN {
            return Err(SessionError::BadFrameLength(frame_len));
        }

        let mut frame = vec![0u8; frame_len as usize];
        self.read_full(&mut frame, false)?;
        let message = Message::parse(&frame)?;
        debug!("receive {} from {}", message.name(), self.addr);
        Ok(Some(message))
    }

    /// Fill `buf` from the socket, riding out poll timeouts.
    ///
    /// With `allow_idle`, a timeout before the first byte yields
    /// `Ok(None)`. Mid-buffer timeouts keep reading until the
    /// inbound-silence deadline.
    fn read_full(&mut self, buf: &mut [u8], allow_idle: bool) -> Result<Option<()>, SessionError> {
        let deadline = Instant::now() + INBOUND_SILENCE;
        let mut filled = 0;
        while filled < buf.len() {
            match self.conn.read(&mut buf[filled..]) {
                Ok(0) => return Err(SessionError::PeerClosedConnection),
                Ok(n) => filled += n,
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    if filled == 0 && allow_idle {
                        return Ok(None);
                    }
                    if Instant::now() >= deadline {
                        return Err(SessionError::ReadTimeout);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(SessionError::Io(e)),
            }
        }
        Ok(Some(()))
    }

    /// Send one message.
    pub fn send(&mut self, message: &Message) -> Result<(), SessionError> {
        debug!("send {} to {}", message.name(), self.addr);
        self.conn.write_all(&message.serialize())?;
        Ok(())
    }

    /// Install the peer's bitfield after validating it.
    pub fn apply_bitfield(&mut self, bits: &[u8]) -> Result<(), SessionError> {
        validate_bitfield(bits, self.piece_count)?;
        self.bitfield.copy_from_slice(bits);
        Ok(())
    }

    /// Record a `have` announcement from the peer.
    pub fn record_have(&mut self, index: u32) -> Result<(), SessionError> {
        if index >= self.piece_count {
            return Err(SessionError::MalformedMessage("have"));
        }
        set_bit(&mut self.bitfield, index);
        Ok(())
    }

    /// The peer's current bitfield.
    pub fn bitfield(&self) -> &[u8] {
        &self.bitfield
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    #[test]
    fn bit_helpers() {
        let mut bits = vec![0u8; 2];
        assert!(!bit_set(&bits, 0));
        set_bit(&mut bits, 0);
        set_bit(&mut bits, 9);
        assert!(bit_set(&bits, 0));
        assert!(bit_set(&bits, 9));
        assert!(!bit_set(&bits, 8));
        assert_eq!(bits, vec![0b1000_0000, 0b0100_0000]);
        // Out of range reads are just false.
        assert!(!bit_set(&bits, 99));
    }

    #[test]
    fn bitfield_validation() {
        // 10 pieces: 2 bytes, 6 spare bits in the last byte.
        assert!(validate_bitfield(&[0xff, 0xc0], 10).is_ok());
        assert!(matches!(
            validate_bitfield(&[0xff], 10),
            Err(SessionError::BitfieldSizeMismatch { expected: 2, actual: 1 })
        ));
        assert!(matches!(
            validate_bitfield(&[0xff, 0xff, 0xff], 10),
            Err(SessionError::BitfieldSizeMismatch { .. })
        ));
        // A spare bit set past piece 9 drops the connection.
        assert!(matches!(
            validate_bitfield(&[0xff, 0b1100_0100], 10),
            Err(SessionError::BitfieldSpareBitsSet)
        ));
        // Exact multiple of 8: no spare bits to check.
        assert!(validate_bitfield(&[0xff], 8).is_ok());
    }

    fn local_peer(listener: &TcpListener) -> PeerAddress {
        let addr = listener.local_addr().unwrap();
        PeerAddress { ip: Ipv4Addr::LOCALHOST, port: addr.port() }
    }

    #[test]
    fn connect_exchanges_handshakes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = local_peer(&listener);
        let info_hash = [3u8; 20];

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            conn.read_exact(&mut buf).unwrap();
            let theirs = Handshake::parse(&buf).unwrap();
            assert_eq!(theirs.info_hash, [3u8; 20]);
            conn.write_all(&Handshake::new([3u8; 20], [7u8; 20]).serialize())
                .unwrap();
            // Follow up with an unchoke, then hang up.
            conn.write_all(&Message::Unchoke.serialize()).unwrap();
        });

        let mut client = Client::connect(addr, &info_hash, &[1u8; 20], 10).unwrap();
        assert!(client.peer_choking);
        assert!(!client.am_interested);
        assert_eq!(client.read_frame().unwrap(), Some(Message::Unchoke));
        assert!(matches!(
            client.read_frame(),
            Err(SessionError::PeerClosedConnection)
        ));
        server.join().unwrap();
    }

    #[test]
    fn connect_rejects_wrong_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = local_peer(&listener);

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&Handshake::new([9u8; 20], [7u8; 20]).serialize())
                .unwrap();
        });

        assert!(matches!(
            Client::connect(addr, &[3u8; 20], &[1u8; 20], 10),
            Err(SessionError::HandshakeMismatch)
        ));
        server.join().unwrap();
    }
}

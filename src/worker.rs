//! # Peer Session Worker
//!
//! One worker per peer connection, each on its own thread. A worker
//! connects, handshakes, then loops: claim a piece from the coordinator,
//! keep up to five block requests on the wire, reassemble arriving blocks,
//! and hand the completed piece back for verification.
//!
//! ## Session rules
//!
//! - `interested` goes out once the peer provably has a piece the download
//!   still needs; `not interested` once no such piece remains.
//! - A piece is claimed from the coordinator only while the peer has us
//!   unchoked, and requests flow only while that holds. A choke cancels
//!   all outstanding requests; their blocks are re-requested after the
//!   next unchoke.
//! - A `bitfield` is only legal as the first message after the handshake.
//! - A block is accepted only if it matches an outstanding request.
//! - A keep-alive goes out after 120 s without outbound traffic; 150 s
//!   without inbound traffic kills the session, as does a session holding
//!   a claimed piece that sees no piece data for 30 s.
//!
//! Every worker failure is local: the session reports back to the
//! coordinator, its claimed pieces revert to missing, and the download
//! carries on with other peers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::client::{Client, SessionError, INBOUND_SILENCE};
use crate::message::Message;
use crate::peer::PeerAddress;
use crate::piece::PieceBuilder;
use crate::scheduler::{SessionEvent, SessionId, Shared, SubmitOutcome};

/// Concurrent block requests kept on the wire per session.
const PIPELINE_DEPTH: usize = 5;

/// A keep-alive goes out if nothing was sent for this long.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// A session holding a claimed piece that sees no piece data for this
/// long is given up on so its slot can go to a better peer.
const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Manages the download from a single peer.
pub struct Worker {
    shared: Arc<Shared>,
    addr: PeerAddress,
    session: SessionId,
    events: Sender<SessionEvent>,
    have_rx: Receiver<u32>,
}

impl Worker {
    pub fn new(
        shared: Arc<Shared>,
        addr: PeerAddress,
        session: SessionId,
        events: Sender<SessionEvent>,
        have_rx: Receiver<u32>,
    ) -> Worker {
        Worker { shared, addr, session, events, have_rx }
    }

    /// Run the session to its end and report back to the coordinator. Any
    /// piece still in flight reverts to missing.
    pub fn run(self) {
        let failed = match self.download() {
            Ok(()) => false,
            Err(err) => {
                warn!("peer_failed addr={} kind={}", self.addr, err);
                true
            }
        };
        self.shared.release_session(self.session);
        let _ = self.events.send(SessionEvent::Ended {
            addr: self.addr,
            session: self.session,
            failed,
        });
    }

    fn download(&self) -> Result<(), SessionError> {
        let mut client = Client::connect(
            self.addr,
            self.shared.meta.info_hash(),
            &self.shared.identity.peer_id,
            self.shared.meta.piece_count(),
        )?;
        info!("peer_connected addr={}", self.addr);

        let mut builder: Option<PieceBuilder> = None;
        let mut first_message = true;
        let mut last_inbound = Instant::now();
        let mut last_outbound = Instant::now();
        // Armed at unchoke and whenever a request goes out or a block
        // arrives; cleared by a choke only when no piece is held.
        let mut last_progress: Option<Instant> = None;

        loop {
            if self.shared.is_shutdown() || self.shared.is_complete() {
                return Ok(());
            }

            // Pieces other sessions completed since the last pass.
            while let Ok(index) = self.have_rx.try_recv() {
                client.send(&Message::Have(index))?;
                last_outbound = Instant::now();
            }

            // A piece is claimed only once the peer has unchoked us; a
            // choking peer cannot be sent requests for it.
            if builder.is_none() && !client.peer_choking {
                if let Some(assignment) = self.shared.claim_work(self.session, client.bitfield()) {
                    builder = Some(PieceBuilder::new(assignment.index, assignment.length));
                }
            }

            // Interest follows what the download still needs from this
            // peer, whether or not a piece is claimable right now.
            let wants = builder.is_some() || self.shared.wants_any(client.bitfield());
            if wants && !client.am_interested {
                client.send(&Message::Interested)?;
                client.am_interested = true;
                last_outbound = Instant::now();
            } else if !wants && client.am_interested {
                client.send(&Message::NotInterested)?;
                client.am_interested = false;
                last_outbound = Instant::now();
            }

            // Top the request pipeline up, FIFO.
            if client.am_interested && !client.peer_choking {
                if let Some(piece) = builder.as_mut() {
                    while piece.outstanding() < PIPELINE_DEPTH {
                        let Some(block) = piece.next_request() else { break };
                        client.send(&Message::Request {
                            index: block.index,
                            begin: block.offset,
                            length: block.length,
                        })?;
                        last_outbound = Instant::now();
                        // A fresh request restarts the stall clock.
                        last_progress = Some(Instant::now());
                    }
                }
            }

            if last_outbound.elapsed() >= KEEPALIVE_INTERVAL {
                client.send(&Message::KeepAlive)?;
                last_outbound = Instant::now();
            }

            let Some(message) = client.read_frame()? else {
                // Idle poll: enforce the session deadlines.
                if last_inbound.elapsed() >= INBOUND_SILENCE {
                    return Err(SessionError::ReadTimeout);
                }
                if let Some(since) = last_progress {
                    if builder.is_some() && since.elapsed() >= STALL_TIMEOUT {
                        return Err(SessionError::Stalled);
                    }
                }
                continue;
            };
            last_inbound = Instant::now();

            let is_first = first_message;
            first_message = false;
            if !is_first && matches!(message, Message::Bitfield(_)) {
                // Only legal as the first post-handshake message.
                return Err(SessionError::UnexpectedMessageId(5));
            }

            match message {
                Message::KeepAlive => {}
                Message::Choke => {
                    client.peer_choking = true;
                    // Outstanding requests will not be answered. The stall
                    // clock stays armed while a piece is held, so a choke
                    // that never lifts releases the piece to other peers.
                    if let Some(piece) = builder.as_mut() {
                        piece.requeue_outstanding();
                        last_progress = Some(Instant::now());
                    } else {
                        last_progress = None;
                    }
                }
                Message::Unchoke => {
                    client.peer_choking = false;
                    last_progress = Some(Instant::now());
                }
                Message::Interested => client.peer_interested = true,
                Message::NotInterested => client.peer_interested = false,
                Message::Have(index) => client.record_have(index)?,
                Message::Bitfield(bits) => client.apply_bitfield(&bits)?,
                Message::Piece { index, begin, block } => {
                    let piece = builder
                        .as_mut()
                        .ok_or(SessionError::UnsolicitedPiece { index, begin })?;
                    if index != piece.index {
                        return Err(SessionError::UnsolicitedPiece { index, begin });
                    }
                    piece.accept(begin, &block)?;
                    last_progress = Some(Instant::now());

                    if piece.is_complete() {
                        if let Some(done) = builder.take() {
                            let index = done.index;
                            match self.shared.submit_piece(self.session, index, done.into_data())
                            {
                                SubmitOutcome::Verified | SubmitOutcome::Stale => {}
                                SubmitOutcome::Corrupt { terminate: false } => {}
                                SubmitOutcome::Corrupt { terminate: true } => {
                                    return Err(SessionError::TooManyCorrupt);
                                }
                                SubmitOutcome::Aborted => return Ok(()),
                            }
                        }
                    }
                }
                // A leecher serves no data and runs no DHT.
                Message::Request { .. } | Message::Cancel { .. } | Message::Port(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};
    use crate::handshake::{Handshake, HANDSHAKE_LEN};
    use crate::torrent::{sha1, Metainfo};
    use crate::tracker::ClientIdentity;
    use crate::writer::FileWriter;
    use indicatif::ProgressBar;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener, TcpStream};
    use std::thread;

    const PIECE0: [u8; 16] = [0xaa; 16];
    const PIECE1: [u8; 4] = [0xbb; 4];

    fn sample_meta() -> Metainfo {
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&sha1(&PIECE0));
        pieces.extend_from_slice(&sha1(&PIECE1));
        let info = Value::dict(vec![
            (b"length".to_vec(), Value::int(20)),
            (b"name".to_vec(), Value::bytes(&b"sample.bin"[..])),
            (b"piece length".to_vec(), Value::int(16)),
            (b"pieces".to_vec(), Value::bytes(pieces)),
        ]);
        let root = Value::dict(vec![
            (b"announce".to_vec(), Value::bytes(&b"http://t.example/a"[..])),
            (b"info".to_vec(), info),
        ]);
        Metainfo::from_bytes(&bencode::encode(&root).unwrap()).unwrap()
    }

    fn payload(index: u32) -> &'static [u8] {
        if index == 0 {
            &PIECE0
        } else {
            &PIECE1
        }
    }

    /// Minimal seeder: handshake, bitfield, unchoke, then answer every
    /// request from the in-memory payload.
    fn serve_seeder(mut conn: TcpStream, info_hash: [u8; 20]) {
        let mut buf = [0u8; HANDSHAKE_LEN];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(Handshake::parse(&buf).unwrap().info_hash, info_hash);
        conn.write_all(&Handshake::new(info_hash, [7u8; 20]).serialize())
            .unwrap();
        conn.write_all(&Message::Bitfield(vec![0b1100_0000]).serialize())
            .unwrap();
        conn.write_all(&Message::Unchoke.serialize()).unwrap();

        loop {
            let mut prefix = [0u8; 4];
            if conn.read_exact(&mut prefix).is_err() {
                return;
            }
            let frame_len = u32::from_be_bytes(prefix) as usize;
            if frame_len == 0 {
                continue;
            }
            let mut frame = vec![0u8; frame_len];
            if conn.read_exact(&mut frame).is_err() {
                return;
            }
            if let Ok(Message::Request { index, begin, length }) = Message::parse(&frame) {
                let data = payload(index);
                let block = data[begin as usize..(begin + length) as usize].to_vec();
                conn.write_all(&Message::Piece { index, begin, block }.serialize())
                    .unwrap();
            }
        }
    }

    #[test]
    fn downloads_both_pieces_from_a_seeder() {
        let meta = sample_meta();
        let info_hash = *meta.info_hash();
        let path = std::env::temp_dir()
            .join(format!("remora-worker-{}-e2e", std::process::id()));
        let writer = FileWriter::create(&path, meta.total_length()).unwrap();
        let identity = ClientIdentity::generate(6881, meta.total_length());
        let shared = Arc::new(test_shared(meta, identity, writer));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let seeder = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            serve_seeder(conn, info_hash);
        });

        let (session, have_rx) = shared.register_session();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let worker = Worker::new(
            Arc::clone(&shared),
            PeerAddress { ip: Ipv4Addr::LOCALHOST, port },
            session,
            events_tx,
            have_rx,
        );
        worker.run();

        match events_rx.try_recv().unwrap() {
            SessionEvent::Ended { failed, .. } => assert!(!failed),
        }
        assert!(shared.is_complete());
        assert_eq!(shared.identity.stats().left, 0);

        let contents = std::fs::read(&path).unwrap();
        let mut expected = PIECE0.to_vec();
        expected.extend_from_slice(&PIECE1);
        assert_eq!(contents, expected);
        std::fs::remove_file(&path).unwrap();
        seeder.join().unwrap();
    }

    fn test_shared(meta: Metainfo, identity: ClientIdentity, writer: FileWriter) -> Shared {
        Shared::new(meta, identity, writer, ProgressBar::hidden())
    }

    #[test]
    fn late_bitfield_is_a_protocol_error() {
        let meta = sample_meta();
        let info_hash = *meta.info_hash();
        let path = std::env::temp_dir()
            .join(format!("remora-worker-{}-late", std::process::id()));
        let writer = FileWriter::create(&path, meta.total_length()).unwrap();
        let identity = ClientIdentity::generate(6881, meta.total_length());
        let shared = Arc::new(test_shared(meta, identity, writer));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let seeder = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&Handshake::new(info_hash, [7u8; 20]).serialize())
                .unwrap();
            conn.write_all(&Message::Unchoke.serialize()).unwrap();
            // A bitfield after another message must drop the connection.
            conn.write_all(&Message::Bitfield(vec![0b1100_0000]).serialize())
                .unwrap();
            // Keep the socket open until the peer hangs up.
            let mut sink = Vec::new();
            let _ = conn.read_to_end(&mut sink);
        });

        let (session, have_rx) = shared.register_session();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let worker = Worker::new(
            Arc::clone(&shared),
            PeerAddress { ip: Ipv4Addr::LOCALHOST, port },
            session,
            events_tx,
            have_rx,
        );
        worker.run();

        match events_rx.try_recv().unwrap() {
            SessionEvent::Ended { failed, .. } => assert!(failed),
        }
        std::fs::remove_file(&path).unwrap();
        seeder.join().unwrap();
    }
}

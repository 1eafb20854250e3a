//! # Piece Scheduler and Download Coordinator
//!
//! Owns the global download state: the piece table, the session registry,
//! the tracker re-announce timer and the client identity.
//!
//! ## Piece table
//!
//! Every piece is in exactly one state: `Missing`, `InFlight(session)` or
//! `Complete`. Transitions happen only through [`Shared::claim_work`],
//! [`Shared::submit_piece`] and the release operations, all under one
//! mutex, so at most one session ever builds a given piece.
//!
//! ## Coordination
//!
//! The coordinator thread announces to the tracker, spawns one worker
//! thread per peer address (at most 30 at a time, failed addresses cool
//! down for five minutes) and collects lifecycle events over a channel.
//! Sessions call into [`Shared`] directly to claim work and submit
//! completed pieces; verified pieces are written to disk before any `have`
//! broadcast goes out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use indicatif::{ProgressBar, ProgressStyle};

use crate::client::bit_set;
use crate::peer::PeerAddress;
use crate::torrent::{sha1, Metainfo};
use crate::tracker::{Announce, ClientIdentity, Event, Tracker, TrackerError};
use crate::worker::Worker;
use crate::writer::{FileWriter, WriteError};

/// Concurrent peer session cap.
const MAX_SESSIONS: usize = 30;

/// How long a failed address is kept off the connect queue.
const COOLDOWN: Duration = Duration::from_secs(300);

/// Corrupt pieces from one session before it is told to terminate.
const CORRUPT_LIMIT: u32 = 3;

/// Tracker retry backoff bounds.
const BACKOFF_INITIAL: Duration = Duration::from_secs(15);
const BACKOFF_MAX: Duration = Duration::from_secs(900);

/// Coordinator loop granularity.
const TICK: Duration = Duration::from_secs(1);

/// Identifies one peer session; monotonic within a process.
pub type SessionId = u64;

/// Work handed to a session: one piece to build.
#[derive(Debug, Clone, Copy)]
pub struct PieceAssignment {
    pub index: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceState {
    Missing,
    InFlight(SessionId),
    Complete,
}

struct PieceTable {
    states: Vec<PieceState>,
    remaining: u32,
}

/// What became of a submitted piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Hash matched; the piece is on disk.
    Verified,
    /// Hash mismatch; the piece went back to `Missing`. `terminate` is set
    /// once the session crossed the corruption limit.
    Corrupt { terminate: bool },
    /// The submission does not match the table any more.
    Stale,
    /// A file error aborted the download.
    Aborted,
}

/// Session lifecycle notification to the coordinator.
pub enum SessionEvent {
    Ended {
        addr: PeerAddress,
        session: SessionId,
        failed: bool,
    },
}

/// State shared between the coordinator and every session.
pub struct Shared {
    pub meta: Metainfo,
    pub identity: ClientIdentity,
    table: Mutex<PieceTable>,
    corrupt: Mutex<HashMap<SessionId, u32>>,
    have_txs: Mutex<HashMap<SessionId, Sender<u32>>>,
    writer: FileWriter,
    fatal: Mutex<Option<WriteError>>,
    shutdown: AtomicBool,
    next_session: AtomicU64,
    progress: ProgressBar,
}

impl Shared {
    pub(crate) fn new(
        meta: Metainfo,
        identity: ClientIdentity,
        writer: FileWriter,
        progress: ProgressBar,
    ) -> Shared {
        let piece_count = meta.piece_count();
        Shared {
            meta,
            identity,
            table: Mutex::new(PieceTable {
                states: vec![PieceState::Missing; piece_count as usize],
                remaining: piece_count,
            }),
            corrupt: Mutex::new(HashMap::new()),
            have_txs: Mutex::new(HashMap::new()),
            writer,
            fatal: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            next_session: AtomicU64::new(1),
            progress,
        }
    }

    /// Register a new session: assign its id and the channel on which it
    /// receives `have` broadcasts.
    pub fn register_session(&self) -> (SessionId, Receiver<u32>) {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        self.have_txs.lock().unwrap().insert(session, tx);
        (session, rx)
    }

    /// Hand out the lowest-index `Missing` piece the peer claims to hold,
    /// atomically marking it in flight for `session`.
    pub fn claim_work(&self, session: SessionId, bitfield: &[u8]) -> Option<PieceAssignment> {
        let mut table = self.table.lock().unwrap();
        let index = (0..table.states.len())
            .find(|&i| table.states[i] == PieceState::Missing && bit_set(bitfield, i as u32))?;
        table.states[index] = PieceState::InFlight(session);
        Some(PieceAssignment {
            index: index as u32,
            length: self.meta.piece_size(index as u32),
        })
    }

    /// Whether the peer holds any piece the download still needs.
    pub fn wants_any(&self, bitfield: &[u8]) -> bool {
        let table = self.table.lock().unwrap();
        table
            .states
            .iter()
            .enumerate()
            .any(|(i, state)| *state != PieceState::Complete && bit_set(bitfield, i as u32))
    }

    /// Verify and store a completed piece.
    pub fn submit_piece(&self, session: SessionId, index: u32, data: Vec<u8>) -> SubmitOutcome {
        // The hash runs outside the table lock.
        let verified = sha1(&data) == *self.meta.piece_hash(index);

        if !verified {
            {
                let mut table = self.table.lock().unwrap();
                match table.states[index as usize] {
                    PieceState::InFlight(holder) if holder == session => {
                        table.states[index as usize] = PieceState::Missing;
                    }
                    _ => return SubmitOutcome::Stale,
                }
            }
            let mut corrupt = self.corrupt.lock().unwrap();
            let strikes = corrupt.entry(session).or_insert(0);
            *strikes += 1;
            warn!(
                "piece_corrupt index={} session={} strikes={}",
                index, session, strikes
            );
            return SubmitOutcome::Corrupt {
                terminate: *strikes >= CORRUPT_LIMIT,
            };
        }

        {
            let table = self.table.lock().unwrap();
            match table.states[index as usize] {
                PieceState::InFlight(holder) if holder == session => {}
                _ => return SubmitOutcome::Stale,
            }
        }

        // The piece must be on disk before it is marked complete and
        // before any have broadcast goes out.
        if let Err(err) = self.writer.write_piece(self.meta.piece_offset(index), &data) {
            error!("{}", err);
            *self.fatal.lock().unwrap() = Some(err);
            self.shutdown.store(true, Ordering::SeqCst);
            return SubmitOutcome::Aborted;
        }

        let have;
        {
            let mut table = self.table.lock().unwrap();
            table.states[index as usize] = PieceState::Complete;
            table.remaining -= 1;
            have = table.states.len() as u32 - table.remaining;
        }
        self.identity.record_piece(data.len() as u64);
        self.progress.inc(data.len() as u64);
        info!("piece_complete index={}", index);
        info!("progress have={} total={}", have, self.meta.piece_count());

        let have_txs = self.have_txs.lock().unwrap();
        for (&other, tx) in have_txs.iter() {
            if other != session {
                let _ = tx.send(index);
            }
        }
        SubmitOutcome::Verified
    }

    /// Revert one in-flight piece to `Missing`, if `session` still holds it.
    pub fn release_piece(&self, session: SessionId, index: u32) {
        let mut table = self.table.lock().unwrap();
        if table.states[index as usize] == PieceState::InFlight(session) {
            table.states[index as usize] = PieceState::Missing;
        }
    }

    /// Put every piece held by a dying session back to `Missing` and drop
    /// its registration.
    pub fn release_session(&self, session: SessionId) {
        let held: Vec<u32> = {
            let table = self.table.lock().unwrap();
            table
                .states
                .iter()
                .enumerate()
                .filter(|&(_, state)| *state == PieceState::InFlight(session))
                .map(|(i, _)| i as u32)
                .collect()
        };
        for index in held {
            self.release_piece(session, index);
        }
        self.corrupt.lock().unwrap().remove(&session);
        self.have_txs.lock().unwrap().remove(&session);
    }

    pub fn is_complete(&self) -> bool {
        self.table.lock().unwrap().remaining == 0
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn take_fatal(&self) -> Option<WriteError> {
        self.fatal.lock().unwrap().take()
    }

    fn sync_output(&self) -> Result<(), WriteError> {
        self.writer.finish()
    }
}

/// Drives one torrent to completion.
pub struct Coordinator {
    shared: Arc<Shared>,
    tracker: Tracker,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
    /// Addresses waiting for a session slot.
    queue: VecDeque<PeerAddress>,
    /// Every address ever learned from the tracker.
    known: HashSet<PeerAddress>,
    /// Addresses with a live session.
    active: HashSet<PeerAddress>,
    /// Failed addresses and when they may be retried.
    cooldown: HashMap<PeerAddress, Instant>,
}

impl Coordinator {
    pub fn new(meta: Metainfo, output_path: &Path, port: u16) -> Result<Coordinator> {
        let identity = ClientIdentity::generate(port, meta.total_length());
        let tracker = Tracker::new(&meta)?;
        let writer = FileWriter::create(output_path, meta.total_length())?;

        let progress = ProgressBar::new(meta.total_length());
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );

        let (events_tx, events_rx) = unbounded();
        Ok(Coordinator {
            shared: Arc::new(Shared::new(meta, identity, writer, progress)),
            tracker,
            events_tx,
            events_rx,
            queue: VecDeque::new(),
            known: HashSet::new(),
            active: HashSet::new(),
            cooldown: HashMap::new(),
        })
    }

    /// Download every piece, verify it and write it out. Returns when the
    /// file is complete or the download aborts.
    pub fn download(&mut self) -> Result<()> {
        info!(
            "started name={:?} pieces={} piece_length={} bytes={}",
            self.shared.meta.name(),
            self.shared.meta.piece_count(),
            self.shared.meta.piece_length(),
            self.shared.meta.total_length(),
        );

        // The first announce carries event=started; failing it aborts
        // startup.
        let announce = self
            .tracker
            .announce(
                &self.shared.identity,
                Some(Event::Started),
                self.shared.identity.stats(),
            )
            .context("first announce failed")?;
        let mut interval = interval_of(&announce);
        let mut next_announce = Instant::now() + interval;
        let mut backoff = BACKOFF_INITIAL;
        self.absorb_peers(&announce);

        while !self.shared.is_complete() {
            if let Some(err) = self.shared.take_fatal() {
                self.shared.request_shutdown();
                let _ = self.tracker.announce(
                    &self.shared.identity,
                    Some(Event::Stopped),
                    self.shared.identity.stats(),
                );
                return Err(anyhow::Error::new(err).context("download aborted"));
            }

            self.spawn_sessions();

            match self.events_rx.recv_timeout(TICK) {
                Ok(SessionEvent::Ended { addr, session, failed }) => {
                    self.active.remove(&addr);
                    self.shared.release_session(session);
                    if failed {
                        self.cooldown.insert(addr, Instant::now() + COOLDOWN);
                    }
                    self.queue.push_back(addr);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }

            if Instant::now() >= next_announce {
                match self.tracker.announce(
                    &self.shared.identity,
                    None,
                    self.shared.identity.stats(),
                ) {
                    Ok(announce) => {
                        backoff = BACKOFF_INITIAL;
                        interval = interval_of(&announce);
                        next_announce = Instant::now() + interval;
                        self.absorb_peers(&announce);
                    }
                    Err(err @ TrackerError::Failure(_)) => {
                        // The tracker answered; retry on the regular
                        // schedule rather than backing off.
                        warn!("tracker: {}", err);
                        next_announce = Instant::now() + interval;
                    }
                    Err(err) => {
                        warn!("tracker: {}", err);
                        next_announce = Instant::now() + backoff;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }
        }

        self.shared.request_shutdown();
        self.shared.sync_output()?;
        self.shared.progress.finish_and_clear();
        info!("completed");
        if let Err(err) = self.tracker.announce(
            &self.shared.identity,
            Some(Event::Completed),
            self.shared.identity.stats(),
        ) {
            warn!("completed announce failed: {}", err);
        }
        Ok(())
    }

    /// Queue newly learned peers, deduplicated across announces.
    fn absorb_peers(&mut self, announce: &Announce) {
        match (announce.complete, announce.incomplete) {
            (Some(seeders), Some(leechers)) => info!(
                "peers_received count={} seeders={} leechers={}",
                announce.peers.len(),
                seeders,
                leechers
            ),
            _ => info!("peers_received count={}", announce.peers.len()),
        }
        for &addr in &announce.peers {
            if self.known.insert(addr) {
                self.queue.push_back(addr);
            }
        }
    }

    /// Top sessions up to the cap from the address queue, skipping
    /// addresses still cooling down.
    fn spawn_sessions(&mut self) {
        let mut scanned = 0;
        let queue_len = self.queue.len();
        while self.active.len() < MAX_SESSIONS && scanned < queue_len {
            let Some(addr) = self.queue.pop_front() else { break };
            scanned += 1;
            if self.active.contains(&addr) {
                continue;
            }
            if let Some(&until) = self.cooldown.get(&addr) {
                if Instant::now() < until {
                    self.queue.push_back(addr);
                    continue;
                }
                self.cooldown.remove(&addr);
            }

            let (session, have_rx) = self.shared.register_session();
            let worker = Worker::new(
                Arc::clone(&self.shared),
                addr,
                session,
                self.events_tx.clone(),
                have_rx,
            );
            thread::spawn(move || worker.run());
            self.active.insert(addr);
        }
    }
}

/// Seconds until the next announce: the tracker's interval, but never
/// sooner than its minimum.
fn interval_of(announce: &Announce) -> Duration {
    let secs = announce.interval.max(announce.min_interval.unwrap_or(0));
    Duration::from_secs(secs.max(1))
}

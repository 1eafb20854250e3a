//! # Tracker Client
//!
//! HTTP announce protocol: reports transfer statistics to the tracker and
//! receives a refreshed peer set plus a re-announce interval.
//!
//! ## Announce request
//!
//! An announce is an HTTP GET with these query parameters, in a fixed
//! order: `info_hash`, `peer_id`, `port`, `uploaded`, `downloaded`, `left`,
//! `compact=1`, then `event` when one applies, then `trackerid` when the
//! tracker previously issued one. `info_hash` and `peer_id` are raw 20-byte
//! strings percent-encoded octet by octet.
//!
//! ## Tier failover
//!
//! Announce URLs come in tiers (BEP-12). Tiers are walked in order; within
//! a tier the URLs are shuffled on every announce cycle. The first tracker
//! that answers wins. A tracker that answers with a `failure reason` ends
//! the cycle with that failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;
use url::Url;

use crate::bencode::{self, Kind, Value};
use crate::peer::{self, PeerAddress};
use crate::torrent::{Metainfo, SHA1_HASH_SIZE};

/// Azureus-style client prefix of every generated peer id.
const CLIENT_PREFIX: &[u8; 8] = b"-PC0001-";

/// Timeout for a regular announce request.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

/// A `stopped` announce on shutdown is abandoned after this long.
const STOPPED_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker returned failure: {0}")]
    Failure(String),
    #[error("could not reach tracker: {0}")]
    Network(String),
    #[error("invalid tracker response: {0}")]
    InvalidResponse(&'static str),
    #[error("could not decode tracker response: {0}")]
    Bencode(#[from] bencode::Error),
    #[error("could not parse tracker url {0:?}")]
    BadUrl(String),
}

/// Announce event reported to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Completed,
    Stopped,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Completed => "completed",
            Event::Stopped => "stopped",
        }
    }
}

/// Process-wide client identity: peer id, listening port and the transfer
/// counters reported on every announce.
pub struct ClientIdentity {
    pub peer_id: [u8; SHA1_HASH_SIZE],
    pub port: u16,
    pub uploaded: AtomicU64,
    pub downloaded: AtomicU64,
    pub left: AtomicU64,
}

impl ClientIdentity {
    /// Create the identity for this process: `-PC0001-` followed by twelve
    /// random ASCII digits.
    pub fn generate(port: u16, total_length: u64) -> ClientIdentity {
        let mut peer_id = [0u8; SHA1_HASH_SIZE];
        peer_id[..CLIENT_PREFIX.len()].copy_from_slice(CLIENT_PREFIX);
        let mut rng = rand::thread_rng();
        for byte in peer_id[CLIENT_PREFIX.len()..].iter_mut() {
            *byte = b'0' + rng.gen_range(0..10u8);
        }
        ClientIdentity {
            peer_id,
            port,
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            left: AtomicU64::new(total_length),
        }
    }

    /// Snapshot of the transfer counters.
    pub fn stats(&self) -> Stats {
        Stats {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left: self.left.load(Ordering::Relaxed),
        }
    }

    /// Account a verified piece of `size` bytes.
    pub fn record_piece(&self, size: u64) {
        self.downloaded.fetch_add(size, Ordering::Relaxed);
        self.left.fetch_sub(size, Ordering::Relaxed);
    }
}

/// Transfer counters as reported in an announce query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// A parsed announce response.
#[derive(Debug, Clone)]
pub struct Announce {
    /// Seconds until the next scheduled announce.
    pub interval: u64,
    /// Lower bound on the re-announce period, when the tracker sets one.
    pub min_interval: Option<u64>,
    /// Opaque id to echo on subsequent announces, when the tracker sets one.
    pub tracker_id: Option<Vec<u8>>,
    /// Number of seeders, when reported.
    pub complete: Option<i64>,
    /// Number of leechers, when reported.
    pub incomplete: Option<i64>,
    pub peers: Vec<PeerAddress>,
}

/// Tracker client for one torrent.
pub struct Tracker {
    tiers: Vec<Vec<String>>,
    info_hash: [u8; SHA1_HASH_SIZE],
    http: reqwest::blocking::Client,
    tracker_id: Option<Vec<u8>>,
}

impl Tracker {
    pub fn new(meta: &Metainfo) -> Result<Tracker, TrackerError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .map_err(|e| TrackerError::Network(e.to_string()))?;
        Ok(Tracker {
            tiers: meta.tiers().to_vec(),
            info_hash: *meta.info_hash(),
            http,
            tracker_id: None,
        })
    }

    /// Announce to the first reachable tracker, walking tiers in order and
    /// shuffling within each tier.
    pub fn announce(
        &mut self,
        identity: &ClientIdentity,
        event: Option<Event>,
        stats: Stats,
    ) -> Result<Announce, TrackerError> {
        let mut last_err = TrackerError::Network("no tracker urls".to_string());
        for tier_index in 0..self.tiers.len() {
            self.tiers[tier_index].shuffle(&mut rand::thread_rng());
            let urls = self.tiers[tier_index].clone();
            for url in urls {
                match self.announce_one(&url, identity, event, stats) {
                    Ok(announce) => {
                        if announce.tracker_id.is_some() {
                            self.tracker_id = announce.tracker_id.clone();
                        }
                        return Ok(announce);
                    }
                    // A tracker that answered with a failure reason ends
                    // the cycle; only unreachable trackers fail over.
                    Err(err @ TrackerError::Failure(_)) => return Err(err),
                    Err(err) => {
                        debug!("announce to {} failed: {}", url, err);
                        last_err = err;
                    }
                }
            }
        }
        Err(last_err)
    }

    fn announce_one(
        &self,
        announce_url: &str,
        identity: &ClientIdentity,
        event: Option<Event>,
        stats: Stats,
    ) -> Result<Announce, TrackerError> {
        let url = build_announce_url(
            announce_url,
            &self.info_hash,
            identity,
            event,
            stats,
            self.tracker_id.as_deref(),
        )?;

        let mut request = self.http.get(&url);
        if event == Some(Event::Stopped) {
            request = request.timeout(STOPPED_TIMEOUT);
        }
        let body = request
            .send()
            .and_then(|response| response.bytes())
            .map_err(|e| TrackerError::Network(e.to_string()))?;

        parse_response(&body)
    }
}

/// Percent-encode every octet as `%XX`.
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);
    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }
    encoded
}

/// Build the full announce URL. The parameter order is fixed so that two
/// announces with identical inputs produce identical query strings.
fn build_announce_url(
    announce: &str,
    info_hash: &[u8; SHA1_HASH_SIZE],
    identity: &ClientIdentity,
    event: Option<Event>,
    stats: Stats,
    tracker_id: Option<&[u8]>,
) -> Result<String, TrackerError> {
    let base_url =
        Url::parse(announce).map_err(|_| TrackerError::BadUrl(announce.to_string()))?;

    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        percent_encode_binary(info_hash),
        percent_encode_binary(&identity.peer_id),
        identity.port,
        stats.uploaded,
        stats.downloaded,
        stats.left,
    );
    if let Some(event) = event {
        query.push_str("&event=");
        query.push_str(event.as_str());
    }
    if let Some(id) = tracker_id {
        query.push_str("&trackerid=");
        query.push_str(&percent_encode_binary(id));
    }

    let mut url = base_url.to_string();
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(&query);
    Ok(url)
}

/// Parse a bencoded announce response body.
fn parse_response(body: &[u8]) -> Result<Announce, TrackerError> {
    let root = bencode::decode(body)?;
    if root.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse("not a dictionary"));
    }

    if let Some(reason) = root.get(b"failure reason") {
        let reason = reason
            .as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        return Err(TrackerError::Failure(reason));
    }

    let interval = root
        .get(b"interval")
        .and_then(Value::as_int)
        .filter(|&n| n >= 0)
        .ok_or(TrackerError::InvalidResponse("interval"))? as u64;
    let min_interval = root
        .get(b"min interval")
        .and_then(Value::as_int)
        .filter(|&n| n >= 0)
        .map(|n| n as u64);
    let tracker_id = root
        .get(b"tracker id")
        .and_then(Value::as_bytes)
        .map(<[u8]>::to_vec);
    let complete = root.get(b"complete").and_then(Value::as_int);
    let incomplete = root.get(b"incomplete").and_then(Value::as_int);

    let peers = match root.get(b"peers") {
        None => Vec::new(),
        Some(peers) => match peers.kind {
            Kind::Bytes(ref compact) => peer::from_compact(compact)?,
            Kind::List(ref entries) => peer::from_dicts(entries)?,
            _ => return Err(TrackerError::InvalidResponse("peers")),
        },
    };

    Ok(Announce {
        interval,
        min_interval,
        tracker_id,
        complete,
        incomplete,
        peers,
    })
}

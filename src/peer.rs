//! # Peer Addresses
//!
//! Parsing of peer information received from trackers.
//!
//! Trackers hand out peers in one of two encodings:
//!
//! - **Compact form**: a single byte string whose length is a multiple of 6;
//!   each 6-byte chunk is a 4-byte IPv4 address followed by a 2-byte port,
//!   both in network byte order.
//! - **Dictionary form**: a list of mappings with `ip`, `port` and an
//!   optional `peer id`.

use std::fmt;
use std::net::Ipv4Addr;

use crate::bencode::Value;
use crate::tracker::TrackerError;

/// Size of one compact-form peer entry.
const COMPACT_PEER_SIZE: usize = 6;

/// Network address of a peer in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parse a compact peer list.
///
/// A length that is not a multiple of 6 is rejected; an empty string yields
/// an empty peer list.
pub fn from_compact(bytes: &[u8]) -> Result<Vec<PeerAddress>, TrackerError> {
    if bytes.len() % COMPACT_PEER_SIZE != 0 {
        return Err(TrackerError::InvalidResponse(
            "compact peer list length is not a multiple of 6",
        ));
    }
    Ok(bytes
        .chunks_exact(COMPACT_PEER_SIZE)
        .map(|chunk| PeerAddress {
            ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect())
}

/// Parse a dictionary-form peer list.
///
/// Entries whose `ip` is not a literal IPv4 address (hostnames, IPv6) are
/// skipped; entries missing `ip` or `port` are a protocol error.
pub fn from_dicts(entries: &[Value]) -> Result<Vec<PeerAddress>, TrackerError> {
    let mut peers = Vec::with_capacity(entries.len());
    for entry in entries {
        let ip = entry
            .get(b"ip")
            .and_then(Value::as_str)
            .ok_or(TrackerError::InvalidResponse("peer entry has no ip"))?;
        let port = entry
            .get(b"port")
            .and_then(Value::as_int)
            .filter(|&p| (0..=i64::from(u16::MAX)).contains(&p))
            .ok_or(TrackerError::InvalidResponse("peer entry has no port"))?
            as u16;
        match ip.parse::<Ipv4Addr>() {
            Ok(ip) => peers.push(PeerAddress { ip, port }),
            Err(_) => debug!("skipping peer with non-IPv4 address {:?}", ip),
        }
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Value;

    #[test]
    fn compact_peers_parse() {
        let bytes = b"\x7f\x00\x00\x01\x1a\xe1\xc0\xa8\x00\x01\x1a\xe1";
        let peers = from_compact(bytes).unwrap();
        assert_eq!(
            peers,
            vec![
                PeerAddress { ip: Ipv4Addr::new(127, 0, 0, 1), port: 6881 },
                PeerAddress { ip: Ipv4Addr::new(192, 168, 0, 1), port: 6881 },
            ]
        );
    }

    #[test]
    fn compact_peers_empty() {
        assert_eq!(from_compact(b"").unwrap(), vec![]);
    }

    #[test]
    fn compact_peers_bad_length() {
        assert!(from_compact(&[0u8; 7]).is_err());
    }

    #[test]
    fn dict_peers_parse() {
        let entries = vec![
            Value::dict(vec![
                (b"ip".to_vec(), Value::bytes(&b"10.0.0.2"[..])),
                (b"peer id".to_vec(), Value::bytes(vec![1u8; 20])),
                (b"port".to_vec(), Value::int(51413)),
            ]),
            // Hostname entries are skipped, not fatal.
            Value::dict(vec![
                (b"ip".to_vec(), Value::bytes(&b"seed.example.org"[..])),
                (b"port".to_vec(), Value::int(6881)),
            ]),
        ];
        let peers = from_dicts(&entries).unwrap();
        assert_eq!(
            peers,
            vec![PeerAddress { ip: Ipv4Addr::new(10, 0, 0, 2), port: 51413 }]
        );
    }

    #[test]
    fn dict_peers_missing_port() {
        let entries = vec![Value::dict(vec![(
            b"ip".to_vec(),
            Value::bytes(&b"10.0.0.2"[..]),
        )])];
        assert!(from_dicts(&entries).is_err());
    }
}

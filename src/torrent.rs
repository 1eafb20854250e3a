//! # Torrent Metadata
//!
//! Typed view over a decoded `.torrent` file.
//!
//! A torrent file is a bencoded dictionary:
//!
//! - **announce**: tracker URL for peer discovery
//! - **announce-list**: optional ordered tiers of tracker URLs (BEP-12)
//! - **info**: dictionary with file information and piece hashes
//!   - **pieces**: concatenated 20-byte SHA-1 digests, one per piece
//!   - **piece length**: size of each piece (except possibly the last)
//!   - **length**: total file size
//!   - **name**: suggested filename
//!
//! ## Info hash
//!
//! The swarm identifier is the SHA-1 digest of the `info` dictionary *as it
//! appears in the source file*. The digest is computed over the raw byte
//! span reported by the decoder, so torrents whose `info` keys are not in
//! canonical order still hash to the value the tracker expects.
//!
//! Only single-file torrents are accepted; an `info` dictionary carrying a
//! `files` key is rejected.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use boring::sha::Sha1;
use thiserror::Error;

use crate::bencode::{self, Value};

/// Size of a SHA-1 digest in bytes.
pub const SHA1_HASH_SIZE: usize = 20;

/// Reasons a `.torrent` file can be rejected.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("could not read torrent: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not decode torrent: {0}")]
    Bencode(#[from] bencode::Error),
    #[error("torrent is not a bencoded dictionary")]
    NotADict,
    #[error("torrent has no {0} entry")]
    MissingField(&'static str),
    #[error("torrent has an invalid {0} entry")]
    InvalidField(&'static str),
    #[error("multi-file torrents are not supported")]
    MultiFile,
    #[error("torrent has {actual} piece hashes, expected {expected}")]
    PieceCountMismatch { expected: usize, actual: usize },
}

/// Parsed torrent metadata.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Tracker tiers in announce order (each tier is a list of URLs).
    tiers: Vec<Vec<String>>,
    /// SHA-1 of the raw bencoded `info` dictionary.
    info_hash: [u8; SHA1_HASH_SIZE],
    /// One 20-byte SHA-1 digest per piece.
    piece_hashes: Vec<[u8; SHA1_HASH_SIZE]>,
    /// Bytes per piece (except possibly the last).
    piece_length: u32,
    /// Bytes in the file.
    total_length: u64,
    /// Suggested filename from the torrent metadata.
    name: String,
}

/// SHA-1 over a byte slice.
pub fn sha1(data: &[u8]) -> [u8; SHA1_HASH_SIZE] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finish()
}

impl Metainfo {
    /// Read and parse a `.torrent` file.
    pub fn open(path: &Path) -> Result<Metainfo, MetaError> {
        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;
        Metainfo::from_bytes(&buf)
    }

    /// Parse torrent metadata from raw bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Metainfo, MetaError> {
        let root = bencode::decode(buf)?;
        if root.as_dict().is_none() {
            return Err(MetaError::NotADict);
        }

        let info = root.get(b"info").ok_or(MetaError::MissingField("info"))?;
        if info.as_dict().is_none() {
            return Err(MetaError::InvalidField("info"));
        }
        if info.get(b"files").is_some() {
            return Err(MetaError::MultiFile);
        }

        // Hash the info dictionary exactly as it appeared in the file. A
        // re-encode of a non-canonically-ordered dictionary would hash to
        // the wrong swarm.
        let info_hash = sha1(info.raw(buf));
        if bencode::encode_canonical(info).is_err() {
            debug!("info dictionary keys are not in canonical order");
        }

        let piece_length = info
            .get(b"piece length")
            .ok_or(MetaError::MissingField("piece length"))?
            .as_int()
            .filter(|&n| n > 0 && n <= i64::from(u32::MAX))
            .ok_or(MetaError::InvalidField("piece length"))? as u32;

        let total_length = info
            .get(b"length")
            .ok_or(MetaError::MissingField("length"))?
            .as_int()
            .filter(|&n| n > 0)
            .ok_or(MetaError::InvalidField("length"))? as u64;

        let name = info
            .get(b"name")
            .ok_or(MetaError::MissingField("name"))?
            .as_str()
            .ok_or(MetaError::InvalidField("name"))?
            .to_string();

        let piece_hashes = split_piece_hashes(
            info.get(b"pieces")
                .ok_or(MetaError::MissingField("pieces"))?
                .as_bytes()
                .ok_or(MetaError::InvalidField("pieces"))?,
        )?;

        let expected = total_length.div_ceil(u64::from(piece_length)) as usize;
        if piece_hashes.len() != expected {
            return Err(MetaError::PieceCountMismatch {
                expected,
                actual: piece_hashes.len(),
            });
        }

        let tiers = parse_tiers(&root)?;

        Ok(Metainfo {
            tiers,
            info_hash,
            piece_hashes,
            piece_length,
            total_length,
            name,
        })
    }

    /// Returns the suggested filename from the torrent metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info_hash(&self) -> &[u8; SHA1_HASH_SIZE] {
        &self.info_hash
    }

    /// Tracker tiers in announce order.
    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    pub fn piece_hash(&self, index: u32) -> &[u8; SHA1_HASH_SIZE] {
        &self.piece_hashes[index as usize]
    }

    /// Size in bytes of the given piece; every piece has `piece_length`
    /// bytes except possibly the last.
    pub fn piece_size(&self, index: u32) -> u32 {
        let begin = self.piece_offset(index);
        let end = (begin + u64::from(self.piece_length)).min(self.total_length);
        (end - begin) as u32
    }

    /// Byte offset of the given piece in the output file.
    pub fn piece_offset(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.piece_length)
    }
}

/// Split the concatenated `pieces` blob into 20-byte digests.
fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<[u8; SHA1_HASH_SIZE]>, MetaError> {
    if pieces.len() % SHA1_HASH_SIZE != 0 {
        return Err(MetaError::InvalidField("pieces"));
    }
    Ok(pieces
        .chunks_exact(SHA1_HASH_SIZE)
        .map(|chunk| {
            let mut hash = [0u8; SHA1_HASH_SIZE];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

/// Build tracker tiers: `announce-list` when present and usable, otherwise
/// a single tier holding `announce`.
fn parse_tiers(root: &Value) -> Result<Vec<Vec<String>>, MetaError> {
    let mut tiers: Vec<Vec<String>> = Vec::new();
    if let Some(list) = root.get(b"announce-list").and_then(Value::as_list) {
        for tier in list {
            let urls: Vec<String> = tier
                .as_list()
                .ok_or(MetaError::InvalidField("announce-list"))?
                .iter()
                .filter_map(|url| url.as_str().map(str::to_string))
                .collect();
            if !urls.is_empty() {
                tiers.push(urls);
            }
        }
    }
    if tiers.is_empty() {
        let announce = root
            .get(b"announce")
            .ok_or(MetaError::MissingField("announce"))?
            .as_str()
            .ok_or(MetaError::InvalidField("announce"))?;
        tiers.push(vec![announce.to_string()]);
    }
    Ok(tiers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Value;

    /// A two-piece torrent: piece_length 16, total_length 20.
    fn sample_torrent() -> Vec<u8> {
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&sha1(&[0xaa; 16]));
        pieces.extend_from_slice(&sha1(&[0xbb; 4]));
        let info = Value::dict(vec![
            (b"length".to_vec(), Value::int(20)),
            (b"name".to_vec(), Value::bytes(&b"sample.bin"[..])),
            (b"piece length".to_vec(), Value::int(16)),
            (b"pieces".to_vec(), Value::bytes(pieces)),
        ]);
        let root = Value::dict(vec![
            (
                b"announce".to_vec(),
                Value::bytes(&b"http://tracker.example/announce"[..]),
            ),
            (b"info".to_vec(), info),
        ]);
        bencode::encode(&root).unwrap()
    }

    #[test]
    fn parses_single_file_torrent() {
        let buf = sample_torrent();
        let meta = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(meta.name(), "sample.bin");
        assert_eq!(meta.piece_length(), 16);
        assert_eq!(meta.total_length(), 20);
        assert_eq!(meta.piece_count(), 2);
        assert_eq!(meta.piece_size(0), 16);
        assert_eq!(meta.piece_size(1), 4);
        assert_eq!(meta.piece_offset(1), 16);
        assert_eq!(
            meta.tiers(),
            &[vec!["http://tracker.example/announce".to_string()]]
        );
    }

    #[test]
    fn info_hash_covers_raw_bytes() {
        let buf = sample_torrent();
        let meta = Metainfo::from_bytes(&buf).unwrap();
        let root = bencode::decode(&buf).unwrap();
        let info_raw = root.get(b"info").unwrap().raw(&buf);
        assert_eq!(*meta.info_hash(), sha1(info_raw));
    }

    #[test]
    fn info_hash_survives_non_canonical_key_order() {
        // Hand-assemble a torrent whose info keys are out of canonical
        // order; the digest must cover the source bytes, not a re-encoding.
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&sha1(&[0xaa; 16]));
        pieces.extend_from_slice(&sha1(&[0xbb; 4]));
        let mut info = Vec::new();
        info.extend_from_slice(b"d4:name10:sample.bin6:lengthi20e12:piece lengthi16e6:pieces");
        info.extend_from_slice(pieces.len().to_string().as_bytes());
        info.push(b':');
        info.extend_from_slice(&pieces);
        info.push(b'e');
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:info");
        buf.extend_from_slice(&info);
        buf.push(b'e');

        let meta = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(*meta.info_hash(), sha1(&info));
        // A canonical re-encode would hash differently.
        let root = bencode::decode(&buf).unwrap();
        let reencoded = bencode::encode(root.get(b"info").unwrap()).unwrap();
        assert_ne!(sha1(&reencoded), *meta.info_hash());
    }

    #[test]
    fn rejects_multi_file_torrents() {
        let info = Value::dict(vec![
            (b"files".to_vec(), Value::list(vec![])),
            (b"length".to_vec(), Value::int(20)),
            (b"name".to_vec(), Value::bytes(&b"x"[..])),
            (b"piece length".to_vec(), Value::int(16)),
            (b"pieces".to_vec(), Value::bytes(vec![0u8; 40])),
        ]);
        let root = Value::dict(vec![
            (b"announce".to_vec(), Value::bytes(&b"http://t/a"[..])),
            (b"info".to_vec(), info),
        ]);
        let buf = bencode::encode(&root).unwrap();
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(MetaError::MultiFile)
        ));
    }

    #[test]
    fn rejects_piece_hash_mismatch() {
        let info = Value::dict(vec![
            (b"length".to_vec(), Value::int(20)),
            (b"name".to_vec(), Value::bytes(&b"x"[..])),
            (b"piece length".to_vec(), Value::int(16)),
            // Only one hash for a two-piece payload.
            (b"pieces".to_vec(), Value::bytes(vec![0u8; 20])),
        ]);
        let root = Value::dict(vec![
            (b"announce".to_vec(), Value::bytes(&b"http://t/a"[..])),
            (b"info".to_vec(), info),
        ]);
        let buf = bencode::encode(&root).unwrap();
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(MetaError::PieceCountMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn announce_list_tiers_take_precedence() {
        let info = Value::dict(vec![
            (b"length".to_vec(), Value::int(20)),
            (b"name".to_vec(), Value::bytes(&b"x"[..])),
            (b"piece length".to_vec(), Value::int(16)),
            (b"pieces".to_vec(), Value::bytes(vec![0u8; 40])),
        ]);
        let root = Value::dict(vec![
            (b"announce".to_vec(), Value::bytes(&b"http://primary/a"[..])),
            (
                b"announce-list".to_vec(),
                Value::list(vec![
                    Value::list(vec![
                        Value::bytes(&b"http://t1a/a"[..]),
                        Value::bytes(&b"http://t1b/a"[..]),
                    ]),
                    Value::list(vec![Value::bytes(&b"http://t2/a"[..])]),
                ]),
            ),
            (b"info".to_vec(), info),
        ]);
        let buf = bencode::encode(&root).unwrap();
        let meta = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(
            meta.tiers(),
            &[
                vec!["http://t1a/a".to_string(), "http://t1b/a".to_string()],
                vec!["http://t2/a".to_string()],
            ]
        );
    }
}

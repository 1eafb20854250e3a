//! # Output File Writer
//!
//! Random-access sink for verified pieces. The file is created at its final
//! size up front; pieces land at `piece_index * piece_length` in whatever
//! order they complete. Data is flushed to disk once, when the download
//! finishes.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

/// A failed file operation, with enough position information to diagnose
/// partial output.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("could not create output file {path:?}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not write {len} bytes at offset {offset}: {source}")]
    Write {
        offset: u64,
        len: usize,
        source: std::io::Error,
    },
    #[error("could not flush output file: {source}")]
    Sync { source: std::io::Error },
}

/// Positional writer over the single output file.
pub struct FileWriter {
    file: Mutex<File>,
}

impl FileWriter {
    /// Create (or truncate) the output file at exactly `total_length` bytes.
    pub fn create(path: &Path, total_length: u64) -> Result<FileWriter, WriteError> {
        let make = |source| WriteError::Create { path: path.to_path_buf(), source };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(make)?;
        file.set_len(total_length).map_err(make)?;
        Ok(FileWriter { file: Mutex::new(file) })
    }

    /// Write `data` at byte `offset`.
    pub fn write_piece(&self, offset: u64, data: &[u8]) -> Result<(), WriteError> {
        let wrap = |source| WriteError::Write { offset, len: data.len(), source };
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset)).map_err(wrap)?;
        file.write_all(data).map_err(wrap)?;
        Ok(())
    }

    /// Flush everything to stable storage. Called once, on completion.
    pub fn finish(&self) -> Result<(), WriteError> {
        self.file
            .lock()
            .unwrap()
            .sync_all()
            .map_err(|source| WriteError::Sync { source })
    }
}

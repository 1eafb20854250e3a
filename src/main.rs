//! # Remora BitTorrent Client
//!
//! A command-line leeching BitTorrent client written in Rust.
//!
//! ## Features
//!
//! - Base v1 peer wire protocol over TCP
//! - HTTP tracker support with BEP-12 tier failover
//! - Multi-peer concurrent downloading, up to 30 sessions
//! - Piece verification with SHA-1 hashing
//! - Progress tracking with a visual progress bar
//!
//! ## Usage
//!
//! ```bash
//! remora -T <torrent_file>
//! remora -T <torrent_file> -o <output_dir> -p <port>
//! ```
//!
//! ## Architecture
//!
//! The client follows a multi-threaded architecture:
//!
//! - **Coordinator thread**: parses the torrent, announces to the tracker,
//!   owns the piece table and supervises sessions
//! - **Worker threads**: each handles the wire protocol with one peer
//! - **Channels**: carry session lifecycle events and have broadcasts

#[macro_use]
extern crate log;

mod bencode;
mod client;
mod handshake;
mod message;
mod peer;
mod piece;
mod scheduler;
mod torrent;
mod tracker;
mod worker;
mod writer;

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::error::ErrorKind as ClapErrorKind;
use clap::Parser;

use crate::scheduler::Coordinator;
use crate::torrent::{MetaError, Metainfo};
use crate::tracker::TrackerError;

/// Exit codes promised to callers.
const EXIT_BAD_ARGS: i32 = 1;
const EXIT_TORRENT: i32 = 2;
const EXIT_TRACKER: i32 = 3;
const EXIT_ABORTED: i32 = 4;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line leeching BitTorrent client, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    #[arg(short = 'T', long = "torrent")]
    torrent: PathBuf,

    /// Output directory (defaults to the current directory)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Port reported to the tracker
    #[arg(short = 'p', long = "port", default_value_t = 6881)]
    port: u16,

    /// Route the log stream to a file
    #[arg(short = 'l', long = "log-file")]
    log_file: Option<PathBuf>,

    /// Log debug messages
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Log error messages only
    #[arg(short = 'e', long = "errors", conflicts_with = "debug")]
    errors: bool,
}

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

fn init_logger(args: &Args) -> Result<()> {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    } else if args.debug {
        builder.filter_level(log::LevelFilter::Debug);
    } else if args.errors {
        builder.filter_level(log::LevelFilter::Error);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }
    if let Some(path) = &args.log_file {
        let file = std::fs::File::create(path)
            .with_context(|| format!("could not create log file {:?}", path))?;
        builder.target(pretty_env_logger::env_logger::fmt::Target::Pipe(Box::new(
            file,
        )));
    }
    builder.init();
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let meta = Metainfo::open(&args.torrent)
        .with_context(|| format!("could not load torrent {:?}", args.torrent))?;

    let filename = sanitize_filename(meta.name());
    let output_dir = args.output.unwrap_or_else(|| PathBuf::from("."));
    let output_path = output_dir.join(filename);

    let mut coordinator = Coordinator::new(meta, &output_path, args.port)?;
    coordinator.download()?;

    println!("Saved in {:?}.", output_path);
    Ok(())
}

/// Map an error chain to the documented exit codes: 2 for torrent parse
/// errors, 3 for an unreachable tracker, 4 for an aborted download.
fn exit_code_for(error: &anyhow::Error) -> i32 {
    for cause in error.chain() {
        if cause.downcast_ref::<MetaError>().is_some() {
            return EXIT_TORRENT;
        }
        if cause.downcast_ref::<TrackerError>().is_some() {
            return EXIT_TRACKER;
        }
    }
    EXIT_ABORTED
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => 0,
                _ => EXIT_BAD_ARGS,
            };
            let _ = err.print();
            process::exit(code);
        }
    };

    if let Err(err) = init_logger(&args) {
        eprintln!("Error: {:#}", err);
        process::exit(EXIT_BAD_ARGS);
    }

    if let Err(err) = run(args) {
        eprintln!("Error: {:#}", err);
        process::exit(exit_code_for(&err));
    }

    process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_hostile_filenames() {
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("a\\b"), "a_b");
        assert_eq!(sanitize_filename("  "), "download");
        assert_eq!(sanitize_filename("debian.iso"), "debian.iso");
    }

    #[test]
    fn exit_codes_follow_the_error_chain() {
        let parse = anyhow::Error::new(MetaError::MissingField("info")).context("loading");
        assert_eq!(exit_code_for(&parse), EXIT_TORRENT);

        let tracker =
            anyhow::Error::new(TrackerError::Network("refused".into())).context("first announce");
        assert_eq!(exit_code_for(&tracker), EXIT_TRACKER);

        let other = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&other), EXIT_ABORTED);
    }
}

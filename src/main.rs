//! # Remora CLI
//!
//! Entry shell: argument parsing, wiring, progress output.
//!
//! ## Usage
//!
//! ```bash
//! remora <metainfo-path> [output-path] [max-pieces]
//! ```
//!
//! With no output path the content lands in `downloads/<name>`. A bare
//! integer in place of the output path is taken as `max-pieces`, limiting
//! the download to the first N pieces.
//!
//! ## Exit Codes
//!
//! 0 success, 1 metainfo error, 2 tracker failure with no peers, 3 peers
//! exhausted before completion, 4 I/O error.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::Parser;

use remora::coordinator::{Coordinator, DownloadSummary};
use remora::error::Result;
use remora::metainfo::Metainfo;
use remora::scheduler::Scheduler;
use remora::storage::StorageWriter;
use remora::tracker::{self, TrackerClient};

/// Port reported to the tracker; we accept no inbound connections on it.
const PORT: u16 = 6881;

const DOWNLOADS_DIR: &str = "downloads";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line leeching BitTorrent client, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    metainfo: PathBuf,

    /// Output path (defaults to downloads/<name>); a bare integer here is
    /// read as MAX_PIECES instead
    output: Option<String>,

    /// Stop after the first N pieces have been verified
    max_pieces: Option<u32>,
}

/// Replace path separators so a hostile name cannot escape the downloads
/// directory.
fn sanitize_filename(filename: &str) -> String {
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

/// Untangle the optional positionals: an integer-looking output argument
/// with no third argument is a max-pieces count.
fn resolve_args(output: Option<String>, max_pieces: Option<u32>) -> (Option<PathBuf>, Option<u32>) {
    match (output, max_pieces) {
        (Some(text), None) => match text.parse::<u32>() {
            Ok(n) => (None, Some(n)),
            Err(_) => (Some(PathBuf::from(text)), None),
        },
        (output, max_pieces) => (output.map(PathBuf::from), max_pieces),
    }
}

fn run(args: Args) -> Result<DownloadSummary> {
    let meta = Arc::new(Metainfo::load(&args.metainfo)?);
    let (output, max_pieces) = resolve_args(args.output, args.max_pieces);
    let output = output
        .unwrap_or_else(|| Path::new(DOWNLOADS_DIR).join(sanitize_filename(meta.name())));

    println!(
        "Downloading {:?} ({} pieces, {} bytes) to {:?}",
        meta.name(),
        meta.num_pieces(),
        meta.total_length(),
        output
    );

    let writer = StorageWriter::create(&output, meta.files(), meta.is_multi_file())?;
    let storage = Arc::new(Mutex::new(writer));
    let scheduler = Arc::new(Mutex::new(Scheduler::new(Arc::clone(&meta), max_pieces)));

    let peer_id = tracker::generate_peer_id();
    let tracker = TrackerClient::new(&meta, peer_id, PORT)?;

    let coordinator = Coordinator::new(meta, scheduler, storage, tracker, peer_id);
    coordinator.run()
}

fn print_summary(summary: &DownloadSummary) {
    println!("Pieces completed:       {}", summary.pieces_completed);
    println!("Bytes downloaded:       {}", summary.downloaded_bytes);
    println!("Bytes uploaded:         {}", summary.uploaded_bytes);
    println!("Bytes wasted:           {}", summary.wasted_bytes);
    println!("Verification failures:  {}", summary.verification_failures);
    println!(
        "Session errors:         {} wire, {} timeout, {} i/o",
        summary.wire_errors, summary.timeout_errors, summary.io_errors
    );
}

fn main() {
    pretty_env_logger::init_timed();

    let args = Args::parse();

    match run(args) {
        Ok(summary) => {
            print_summary(&summary);
            std::process::exit(0);
        }
        Err(error) => {
            eprintln!("Error: {error}");
            std::process::exit(error.exit_code());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_second_argument_means_max_pieces() {
        let (output, max) = resolve_args(Some("12".into()), None);
        assert_eq!(output, None);
        assert_eq!(max, Some(12));
    }

    #[test]
    fn path_second_argument_is_the_output() {
        let (output, max) = resolve_args(Some("out.bin".into()), None);
        assert_eq!(output, Some(PathBuf::from("out.bin")));
        assert_eq!(max, None);
    }

    #[test]
    fn both_arguments_pass_through() {
        let (output, max) = resolve_args(Some("out.bin".into()), Some(3));
        assert_eq!(output, Some(PathBuf::from("out.bin")));
        assert_eq!(max, Some(3));
    }

    #[test]
    fn hostile_names_are_flattened() {
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("  "), "download");
        assert_eq!(sanitize_filename("plain.iso"), "plain.iso");
    }
}

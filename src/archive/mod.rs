//! Archive Format
//!
//! The custom per-endpoint container format. A data archive is a flat
//! sequence of (local file header, stripe name, stripe payload) triples at
//! monotonically increasing offsets, closed with that endpoint's own
//! central directory entries and one end-of-central-directory record. The
//! aggregate metadata archive concatenates every endpoint's directory
//! entries behind a single EOCD so any reader can locate any stripe without
//! scanning all data archives.
//!
//! # Components
//!
//! - **Records** (`record.rs`): bit-exact encode/decode of the three
//!   fixed-size record kinds (LFH, CDH, EOCD). Decode validates every
//!   constant field and rejects deviations as format violations.
//! - **Directory** (`directory.rs`): the per-endpoint central directory
//!   ledger, directory parsing and the aggregate metadata buffer.

pub mod directory;
pub mod record;

#[cfg(test)]
mod proptest;

pub use directory::{aggregate_metadata, parse_directory, CentralDirectory, DirectoryEntry};
pub use record::{CentralDirectoryHeader, EndOfCentralDirectory, LocalFileHeader};

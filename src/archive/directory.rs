//! Central Directory Ledger
//!
//! Per-endpoint, in-memory accumulating ledger of every stripe written to
//! that endpoint's archive. Appends one CDH+name pair per stripe, tracks the
//! running directory size, entry count and the end offset of the last
//! written stripe, and is consumed once at close to emit the EOCD record.
//!
//! The ledger is not thread-safe by itself; owners serialize access per
//! endpoint.

use bytes::{Bytes, BytesMut};

use crate::archive::record::{CentralDirectoryHeader, EndOfCentralDirectory, LocalFileHeader};
use crate::error::{Error, Result};

// =============================================================================
// Central Directory
// =============================================================================

/// Accumulating central directory of one endpoint's archive.
#[derive(Debug, Default, Clone)]
pub struct CentralDirectory {
    /// Emitted CDH+name pairs, in append order
    buffer: BytesMut,

    /// Number of entries appended
    entries: u16,

    /// End offset of the last written stripe; the next local header goes here
    offset: u32,

    /// Guard against a second finalize
    finalized: bool,
}

impl CentralDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from previously parsed entries, so repair can append
    /// fresh entries to an existing archive.
    ///
    /// The write cursor resumes at `cd_offset`, where the trailing directory
    /// of the existing archive begins.
    pub fn from_entries(entries: &[DirectoryEntry], cd_offset: u32) -> Result<Self> {
        let mut cd = Self::new();
        for entry in entries {
            cd.append_entry(&entry.name, &entry.cdh)?;
        }
        cd.offset = cd_offset;
        Ok(cd)
    }

    /// Append a directory entry for a stripe written at `lfh_offset`,
    /// growing the backing buffer as needed.
    pub fn add(&mut self, name: &str, size: u32, crc32c: u32, lfh_offset: u32) -> Result<()> {
        let lfh = LocalFileHeader::new(size, crc32c, name.len() as u16);
        let cdh = CentralDirectoryHeader::from_lfh(&lfh, lfh_offset);
        self.append_entry(name, &cdh)?;
        self.offset = lfh_offset + LocalFileHeader::SIZE as u32 + name.len() as u32 + size;
        Ok(())
    }

    fn append_entry(&mut self, name: &str, cdh: &CentralDirectoryHeader) -> Result<()> {
        if self.entries == u16::MAX {
            return Err(Error::Internal(
                "central directory entry count exceeds u16".to_string(),
            ));
        }
        if name.len() != cdh.name_len as usize {
            return Err(Error::Internal(format!(
                "directory entry name length {} does not match header {}",
                name.len(),
                cdh.name_len
            )));
        }
        cdh.encode_into(&mut self.buffer);
        self.buffer.extend_from_slice(name.as_bytes());
        self.entries += 1;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Number of entries appended so far.
    pub fn entry_count(&self) -> u16 {
        self.entries
    }

    /// Size in bytes of the accumulated CDH+name pairs.
    pub fn cd_size(&self) -> u32 {
        self.buffer.len() as u32
    }

    /// Offset at which the next local file header will be written; also the
    /// offset of the trailing directory once the archive is finalized.
    pub fn next_offset(&self) -> u32 {
        self.offset
    }

    /// The accumulated CDH+name bytes.
    pub fn cd_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Emit the EOCD record for this directory. Call exactly once per
    /// endpoint per close.
    pub fn finalize(&mut self) -> Bytes {
        debug_assert!(!self.finalized, "central directory finalized twice");
        self.finalized = true;
        EndOfCentralDirectory::new(self.entries, self.cd_size(), self.offset).encode()
    }

    /// The full trailing section of a data archive: CDH+name pairs followed
    /// by the EOCD record.
    pub fn trailing_section(&mut self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.buffer.len() + EndOfCentralDirectory::SIZE);
        out.extend_from_slice(&self.buffer);
        out.extend_from_slice(&self.finalize());
        out.freeze()
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// One parsed central directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub cdh: CentralDirectoryHeader,
}

impl DirectoryEntry {
    /// Archive offset of this entry's payload bytes (past LFH and name).
    pub fn payload_offset(&self) -> u64 {
        self.cdh.lfh_offset as u64 + LocalFileHeader::SIZE as u64 + self.cdh.name_len as u64
    }
}

/// Parse a flat sequence of CDH+name pairs.
pub fn parse_directory(buf: &[u8]) -> Result<Vec<DirectoryEntry>> {
    let mut entries = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        let cdh = CentralDirectoryHeader::decode(rest)?;
        rest = &rest[CentralDirectoryHeader::SIZE..];
        let name_len = cdh.name_len as usize;
        if rest.len() < name_len {
            return Err(Error::format(
                "central directory header",
                format!("name truncated: {} of {name_len} bytes", rest.len()),
            ));
        }
        let name = std::str::from_utf8(&rest[..name_len])
            .map_err(|_| Error::format("central directory header", "name is not valid UTF-8"))?
            .to_string();
        rest = &rest[name_len..];
        entries.push(DirectoryEntry { name, cdh });
    }
    Ok(entries)
}

/// Build the aggregate metadata archive: the concatenation of every
/// endpoint's CDH+name entries terminated by one EOCD record.
pub fn aggregate_metadata(directories: &[&CentralDirectory]) -> Result<Bytes> {
    let mut entries: u32 = 0;
    let mut cd_size: usize = 0;
    for cd in directories {
        entries += cd.entry_count() as u32;
        cd_size += cd.cd_bytes().len();
    }
    let entries = u16::try_from(entries)
        .map_err(|_| Error::Internal("metadata archive entry count exceeds u16".to_string()))?;

    let mut buf = BytesMut::with_capacity(cd_size + EndOfCentralDirectory::SIZE);
    for cd in directories {
        buf.extend_from_slice(cd.cd_bytes());
    }
    EndOfCentralDirectory::new(entries, cd_size as u32, 0).encode_into(&mut buf);
    Ok(buf.freeze())
}

// =============================================================================
// Tests
// =============================================================================

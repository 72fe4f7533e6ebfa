//! Archive Record Codec
//!
//! Encode/decode for the three fixed-size binary records of the archive
//! format: local file header (LFH), central directory header (CDH) and
//! end-of-central-directory (EOCD). Pure and deterministic, no I/O.
//!
//! Every record is an owned value type; encoding appends the exact on-disk
//! byte sequence to a caller-supplied buffer, decoding validates every
//! constant field and rejects any deviation as a format violation rather
//! than coercing it. Round-trip encode -> decode -> encode is byte-exact.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{Datelike, Local, Timelike};

use crate::error::{Error, Result};

// =============================================================================
// DOS Timestamp
// =============================================================================

/// Current local time packed into the DOS 2-second-resolution format
/// used by the mod-time/mod-date fields.
pub(crate) fn dos_datetime() -> (u16, u16) {
    let now = Local::now();
    let time = ((now.hour() as u16 & 0x1f) << 11)
        | ((now.minute() as u16 & 0x3f) << 5)
        | ((now.second() as u16 / 2) & 0x1f);
    let year = (now.year() - 1980).clamp(0, 0x7f) as u16;
    let date = (year << 9) | ((now.month() as u16 & 0x0f) << 5) | (now.day() as u16 & 0x1f);
    (time, date)
}

fn check_const_u16(record: &'static str, field: &'static str, got: u16, want: u16) -> Result<()> {
    if got != want {
        return Err(Error::format(
            record,
            format!("{field} must be {want}, got {got}"),
        ));
    }
    Ok(())
}

fn check_len(record: &'static str, buf: &[u8], want: usize) -> Result<()> {
    if buf.len() < want {
        return Err(Error::format(
            record,
            format!("truncated: {} of {want} bytes", buf.len()),
        ));
    }
    Ok(())
}

// =============================================================================
// Local File Header
// =============================================================================

/// Fixed 30-byte record preceding every stripe payload in a data archive.
///
/// Compression is never used, so compressed and uncompressed size are the
/// same field value and the extra-field length is always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileHeader {
    pub mod_time: u16,
    pub mod_date: u16,
    pub crc32c: u32,
    pub size: u32,
    pub name_len: u16,
}

impl LocalFileHeader {
    pub const SIGNATURE: u32 = 0x0403_4b50;
    pub const SIZE: usize = 30;

    const VERSION: u16 = 0;
    const FLAGS: u16 = 0;
    const COMPRESSION: u16 = 0;
    const EXTRA_LEN: u16 = 0;

    /// New header for a payload of `size` bytes, stamped with the current
    /// local time.
    pub fn new(size: u32, crc32c: u32, name_len: u16) -> Self {
        let (mod_time, mod_date) = dos_datetime();
        Self {
            mod_time,
            mod_date,
            crc32c,
            size,
            name_len,
        }
    }

    /// Append the 30-byte on-disk form to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(Self::SIZE);
        buf.put_u32_le(Self::SIGNATURE);
        buf.put_u16_le(Self::VERSION);
        buf.put_u16_le(Self::FLAGS);
        buf.put_u16_le(Self::COMPRESSION);
        buf.put_u16_le(self.mod_time);
        buf.put_u16_le(self.mod_date);
        buf.put_u32_le(self.crc32c);
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.size);
        buf.put_u16_le(self.name_len);
        buf.put_u16_le(Self::EXTRA_LEN);
    }

    /// The 30-byte on-disk form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Parse and validate a header from the start of `buf`.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        const REC: &str = "local file header";
        check_len(REC, buf, Self::SIZE)?;
        let signature = buf.get_u32_le();
        if signature != Self::SIGNATURE {
            return Err(Error::format(REC, format!("bad signature {signature:#010x}")));
        }
        check_const_u16(REC, "version", buf.get_u16_le(), Self::VERSION)?;
        check_const_u16(REC, "flags", buf.get_u16_le(), Self::FLAGS)?;
        check_const_u16(REC, "compression", buf.get_u16_le(), Self::COMPRESSION)?;
        let mod_time = buf.get_u16_le();
        let mod_date = buf.get_u16_le();
        let crc32c = buf.get_u32_le();
        let comp_size = buf.get_u32_le();
        let uncomp_size = buf.get_u32_le();
        if comp_size != uncomp_size {
            return Err(Error::format(
                REC,
                format!("compressed size {comp_size} != uncompressed size {uncomp_size}"),
            ));
        }
        let name_len = buf.get_u16_le();
        check_const_u16(REC, "extra length", buf.get_u16_le(), Self::EXTRA_LEN)?;
        Ok(Self {
            mod_time,
            mod_date,
            crc32c,
            size: comp_size,
            name_len,
        })
    }

    /// Field-for-field comparison against the corresponding central
    /// directory entry, excluding timestamps (the two records may be
    /// stamped across a DOS 2-second tick).
    pub fn matches(&self, cdh: &CentralDirectoryHeader) -> bool {
        self.crc32c == cdh.crc32c && self.size == cdh.size && self.name_len == cdh.name_len
    }
}

// =============================================================================
// Central Directory Header
// =============================================================================

/// Fixed 46-byte directory record describing one stripe entry, including the
/// byte offset of its local file header within the data archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirectoryHeader {
    pub mod_time: u16,
    pub mod_date: u16,
    pub crc32c: u32,
    pub size: u32,
    pub name_len: u16,
    pub lfh_offset: u32,
}

impl CentralDirectoryHeader {
    pub const SIGNATURE: u32 = 0x0201_4b50;
    pub const SIZE: usize = 46;

    const VERSION: u16 = 10;
    const FLAGS: u16 = 0;
    const COMPRESSION: u16 = 0;
    const EXTRA_LEN: u16 = 0;
    const COMMENT_LEN: u16 = 0;
    const DISK_NUMBER: u16 = 0;
    const INTERNAL_ATTRS: u16 = 0;
    const EXTERNAL_ATTRS: u32 = 0;

    /// Directory record for an entry whose local header was written at
    /// `lfh_offset`. Shares the header's timestamps.
    pub fn from_lfh(lfh: &LocalFileHeader, lfh_offset: u32) -> Self {
        Self {
            mod_time: lfh.mod_time,
            mod_date: lfh.mod_date,
            crc32c: lfh.crc32c,
            size: lfh.size,
            name_len: lfh.name_len,
            lfh_offset,
        }
    }

    /// Append the 46-byte on-disk form to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(Self::SIZE);
        buf.put_u32_le(Self::SIGNATURE);
        buf.put_u16_le(Self::VERSION);
        buf.put_u16_le(Self::VERSION);
        buf.put_u16_le(Self::FLAGS);
        buf.put_u16_le(Self::COMPRESSION);
        buf.put_u16_le(self.mod_time);
        buf.put_u16_le(self.mod_date);
        buf.put_u32_le(self.crc32c);
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.size);
        buf.put_u16_le(self.name_len);
        buf.put_u16_le(Self::EXTRA_LEN);
        buf.put_u16_le(Self::COMMENT_LEN);
        buf.put_u16_le(Self::DISK_NUMBER);
        buf.put_u16_le(Self::INTERNAL_ATTRS);
        buf.put_u32_le(Self::EXTERNAL_ATTRS);
        buf.put_u32_le(self.lfh_offset);
    }

    /// The 46-byte on-disk form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Parse and validate a directory record from the start of `buf`.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        const REC: &str = "central directory header";
        check_len(REC, buf, Self::SIZE)?;
        let signature = buf.get_u32_le();
        if signature != Self::SIGNATURE {
            return Err(Error::format(REC, format!("bad signature {signature:#010x}")));
        }
        check_const_u16(REC, "version made by", buf.get_u16_le(), Self::VERSION)?;
        check_const_u16(REC, "version needed", buf.get_u16_le(), Self::VERSION)?;
        check_const_u16(REC, "flags", buf.get_u16_le(), Self::FLAGS)?;
        check_const_u16(REC, "compression", buf.get_u16_le(), Self::COMPRESSION)?;
        let mod_time = buf.get_u16_le();
        let mod_date = buf.get_u16_le();
        let crc32c = buf.get_u32_le();
        let comp_size = buf.get_u32_le();
        let uncomp_size = buf.get_u32_le();
        if comp_size != uncomp_size {
            return Err(Error::format(
                REC,
                format!("compressed size {comp_size} != uncompressed size {uncomp_size}"),
            ));
        }
        let name_len = buf.get_u16_le();
        check_const_u16(REC, "extra length", buf.get_u16_le(), Self::EXTRA_LEN)?;
        check_const_u16(REC, "comment length", buf.get_u16_le(), Self::COMMENT_LEN)?;
        check_const_u16(REC, "disk number", buf.get_u16_le(), Self::DISK_NUMBER)?;
        check_const_u16(REC, "internal attributes", buf.get_u16_le(), Self::INTERNAL_ATTRS)?;
        let external = buf.get_u32_le();
        if external != Self::EXTERNAL_ATTRS {
            return Err(Error::format(
                REC,
                format!("external attributes must be 0, got {external}"),
            ));
        }
        let lfh_offset = buf.get_u32_le();
        Ok(Self {
            mod_time,
            mod_date,
            crc32c,
            size: comp_size,
            name_len,
            lfh_offset,
        })
    }
}

// =============================================================================
// End Of Central Directory
// =============================================================================

/// Fixed 22-byte terminal record locating the central directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: u32 = 0x0605_4b50;
    pub const SIZE: usize = 22;

    const DISK_NUMBER: u16 = 0;
    const CD_DISK_NUMBER: u16 = 0;
    const COMMENT_LEN: u16 = 0;

    pub fn new(entries: u16, cd_size: u32, cd_offset: u32) -> Self {
        Self {
            entries,
            cd_size,
            cd_offset,
        }
    }

    /// Append the 22-byte on-disk form to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(Self::SIZE);
        buf.put_u32_le(Self::SIGNATURE);
        buf.put_u16_le(Self::DISK_NUMBER);
        buf.put_u16_le(Self::CD_DISK_NUMBER);
        buf.put_u16_le(self.entries);
        buf.put_u16_le(self.entries);
        buf.put_u32_le(self.cd_size);
        buf.put_u32_le(self.cd_offset);
        buf.put_u16_le(Self::COMMENT_LEN);
    }

    /// The 22-byte on-disk form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Parse and validate the terminal record from the start of `buf`.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        const REC: &str = "end of central directory";
        check_len(REC, buf, Self::SIZE)?;
        let signature = buf.get_u32_le();
        if signature != Self::SIGNATURE {
            return Err(Error::format(REC, format!("bad signature {signature:#010x}")));
        }
        check_const_u16(REC, "disk number", buf.get_u16_le(), Self::DISK_NUMBER)?;
        check_const_u16(REC, "cd disk number", buf.get_u16_le(), Self::CD_DISK_NUMBER)?;
        let entries_on_disk = buf.get_u16_le();
        let entries = buf.get_u16_le();
        if entries_on_disk != entries {
            return Err(Error::format(
                REC,
                format!("entries on disk {entries_on_disk} != entries total {entries}"),
            ));
        }
        let cd_size = buf.get_u32_le();
        let cd_offset = buf.get_u32_le();
        check_const_u16(REC, "comment length", buf.get_u16_le(), Self::COMMENT_LEN)?;
        Ok(Self {
            entries,
            cd_size,
            cd_offset,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

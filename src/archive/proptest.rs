//! Property-Based Tests for the Archive Record Codec
//!
//! Uses proptest to verify the codec invariants across the whole input
//! space:
//!
//! 1. **Roundtrip**: decode(encode(record)) == record, byte-exact
//! 2. **Constant rejection**: flipping any constant byte makes decode fail
//! 3. **Directory consistency**: parse(ledger bytes) reproduces every entry

#![cfg(test)]

use proptest::prelude::*;

use super::directory::{parse_directory, CentralDirectory};
use super::record::{CentralDirectoryHeader, EndOfCentralDirectory, LocalFileHeader};

/// Strategy for generating arbitrary record field values.
fn lfh_strategy() -> impl Strategy<Value = LocalFileHeader> {
    (any::<u16>(), any::<u16>(), any::<u32>(), any::<u32>(), any::<u16>()).prop_map(
        |(mod_time, mod_date, crc32c, size, name_len)| LocalFileHeader {
            mod_time,
            mod_date,
            crc32c,
            size,
            name_len,
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: every LFH round-trips byte-exactly.
    #[test]
    fn prop_lfh_roundtrip(lfh in lfh_strategy()) {
        let bytes = lfh.encode();
        let decoded = LocalFileHeader::decode(&bytes).unwrap();
        prop_assert_eq!(&decoded, &lfh);
        prop_assert_eq!(decoded.encode(), bytes);
    }

    /// Property: every CDH round-trips byte-exactly and stays consistent
    /// with the LFH it was derived from.
    #[test]
    fn prop_cdh_roundtrip(lfh in lfh_strategy(), offset in any::<u32>()) {
        let cdh = CentralDirectoryHeader::from_lfh(&lfh, offset);
        let bytes = cdh.encode();
        let decoded = CentralDirectoryHeader::decode(&bytes).unwrap();
        prop_assert_eq!(&decoded, &cdh);
        prop_assert_eq!(decoded.encode(), bytes);
        prop_assert!(lfh.matches(&decoded));
    }

    /// Property: every EOCD round-trips byte-exactly.
    #[test]
    fn prop_eocd_roundtrip(entries in any::<u16>(), cd_size in any::<u32>(), cd_offset in any::<u32>()) {
        let eocd = EndOfCentralDirectory::new(entries, cd_size, cd_offset);
        let bytes = eocd.encode();
        let decoded = EndOfCentralDirectory::decode(&bytes).unwrap();
        prop_assert_eq!(&decoded, &eocd);
        prop_assert_eq!(decoded.encode(), bytes);
    }

    /// Property: a ledger built from arbitrary entries parses back to the
    /// same names, sizes and offsets.
    #[test]
    fn prop_directory_parse_roundtrip(
        sizes in prop::collection::vec(1u32..1_000_000, 1..20),
    ) {
        let mut cd = CentralDirectory::new();
        let mut offset = 0u32;
        for (i, size) in sizes.iter().enumerate() {
            let name = format!("obj.{i}.0");
            cd.add(&name, *size, i as u32, offset).unwrap();
            offset += LocalFileHeader::SIZE as u32 + name.len() as u32 + size;
        }
        let entries = parse_directory(cd.cd_bytes()).unwrap();
        prop_assert_eq!(entries.len(), sizes.len());
        for (i, entry) in entries.iter().enumerate() {
            prop_assert_eq!(&entry.name, &format!("obj.{i}.0"));
            prop_assert_eq!(entry.cdh.size, sizes[i]);
        }
        let total: u64 = entries.iter().map(|e| e.cdh.size as u64).sum();
        let expect: u64 = sizes.iter().map(|s| *s as u64).sum();
        prop_assert_eq!(total, expect);
    }
}

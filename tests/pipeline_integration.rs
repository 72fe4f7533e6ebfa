//! Write Pipeline Integration Tests
//!
//! End-to-end coverage of the streaming write path over file-backed
//! endpoints: layout consistency after close, read-back idempotence and
//! the first-failure-wins terminal status.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;

use common::{fill_pattern, small_cfg, write_object, FailingProvider};
use stripestor::archive::{parse_directory, EndOfCentralDirectory, LocalFileHeader};
use stripestor::endpoint::FileEndpointProvider;
use stripestor::{Error, ObjectConfig, ObjectReader, StreamWriter};

// =============================================================================
// Write / Read Idempotence
// =============================================================================

#[tokio::test]
async fn test_multi_block_roundtrip_with_partial_tail() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FileEndpointProvider::new(dir.path());
    let placement = (0..8).map(|i| format!("ep-{i}")).collect();
    let cfg = Arc::new(ObjectConfig::new("big.object", placement, 4096, 6, 8).unwrap());

    let data = fill_pattern(cfg.block_size() * 5 + 777);
    // feed the writer in uneven slices to exercise block assembly
    let mut writer = StreamWriter::open(Arc::clone(&cfg), &provider).await.unwrap();
    for piece in data.chunks(1000) {
        writer.write(piece).unwrap();
    }
    assert_eq!(writer.close().await.unwrap(), data.len() as u64);

    let reader = ObjectReader::open(Arc::clone(&cfg), &provider).await.unwrap();
    assert_eq!(reader.object_size(), data.len() as u64);
    assert_eq!(reader.read_all().await.unwrap(), data);
}

// =============================================================================
// Central Directory Consistency
// =============================================================================

#[tokio::test]
async fn test_central_directory_consistent_after_close() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FileEndpointProvider::new(dir.path());
    let cfg = small_cfg("consistent");
    let blocks = 4u64;
    let data = fill_pattern(cfg.block_size() * blocks as usize);
    write_object(&cfg, &provider, &data).await;

    for url in &cfg.placement {
        let raw = std::fs::read(dir.path().join(url).join(cfg.data_archive_name())).unwrap();
        let eocd =
            EndOfCentralDirectory::decode(&raw[raw.len() - EndOfCentralDirectory::SIZE..]).unwrap();
        let cd = &raw[eocd.cd_offset as usize..(eocd.cd_offset + eocd.cd_size) as usize];
        let entries = parse_directory(cd).unwrap();

        // the EOCD entry count matches the entries actually emitted
        assert_eq!(eocd.entries as u64, blocks);
        assert_eq!(entries.len() as u64, blocks);
        // the directory size matches the emitted CDH+name pairs
        let pair_len: usize = entries
            .iter()
            .map(|e| 46 + e.cdh.name_len as usize)
            .sum();
        assert_eq!(eocd.cd_size as usize, pair_len);
        // the directory offset sits exactly past the last stripe triple
        let triples: u32 = entries
            .iter()
            .map(|e| LocalFileHeader::SIZE as u32 + e.cdh.name_len as u32 + e.cdh.size)
            .sum();
        assert_eq!(eocd.cd_offset, triples);
        // recorded payload sizes add up to the block count
        let payload: u64 = entries.iter().map(|e| e.cdh.size as u64).sum();
        assert_eq!(payload, blocks * cfg.chunk_size as u64);
    }
}

// =============================================================================
// Failure Semantics
// =============================================================================

#[tokio::test]
async fn test_first_failure_wins_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    // ep-2 fails from its third stripe write (block 2), ep-4 from its
    // fifth (block 4); the terminal status must carry the earlier one
    let provider = FailingProvider::new(
        dir.path(),
        vec![("ep-2".to_string(), 2), ("ep-4".to_string(), 4)],
    );
    let cfg = small_cfg("failing");

    let mut writer = StreamWriter::open(Arc::clone(&cfg), &provider).await.unwrap();
    writer.write(&fill_pattern(cfg.block_size() * 6)).unwrap();
    let err = writer.close().await.unwrap_err();
    assert_matches!(err, Error::Endpoint { ref url, .. } if url == "ep-2");

    // only the first two blocks were confirmed on every stripe
    assert_eq!(writer.get_size(), cfg.block_size() as u64 * 2);
}

#[tokio::test]
async fn test_failed_write_leaves_object_repairable() {
    let dir = tempfile::tempdir().unwrap();
    let placement = (0..6).map(|i| format!("ep-{i}")).collect();
    let cfg = Arc::new(
        ObjectConfig::new("reconcile", placement, 64, 4, 6)
            .unwrap()
            .with_replacement(vec!["spare-0".to_string()]),
    );
    {
        // ep-2 dies after its first stripe write; its archive never gets a
        // trailing directory
        let provider = FailingProvider::new(dir.path(), vec![("ep-2".to_string(), 1)]);
        let mut writer = StreamWriter::open(Arc::clone(&cfg), &provider).await.unwrap();
        writer.write(&fill_pattern(cfg.block_size() * 3)).unwrap();
        assert!(writer.close().await.is_err());
    }

    // healthy endpoints committed their directories; repair retires the
    // broken endpoint and rebuilds every one of its stripes on the spare
    let provider = FileEndpointProvider::new(dir.path());
    let engine = stripestor::RepairEngine::new(
        Arc::clone(&cfg),
        stripestor::RepairOptions::default(),
    );
    let report = engine.repair_object(&provider).await.unwrap();
    assert!(!report.repair_failed);
    assert_eq!(report.chunks_repaired, 3);
    assert_eq!(report.chunk_repairs_written, 3);
    assert_eq!(report.redirections.len(), 1);
    assert_eq!(report.redirections[0].from, "ep-2");
    assert_eq!(report.redirections[0].to, "spare-0");

    // the object reads back whole even through the original placement
    let reader = ObjectReader::open(Arc::clone(&cfg), &provider).await.unwrap();
    assert_eq!(
        reader.read_all().await.unwrap(),
        fill_pattern(cfg.block_size() * 3)
    );
}

// =============================================================================
// Exclusive Create
// =============================================================================

#[tokio::test]
async fn test_second_open_of_same_object_fails() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FileEndpointProvider::new(dir.path());
    let cfg = small_cfg("exclusive");
    write_object(&cfg, &provider, &fill_pattern(10)).await;

    let err = StreamWriter::open(Arc::clone(&cfg), &provider).await.unwrap_err();
    assert_matches!(err, Error::Endpoint { .. });
}

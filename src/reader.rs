//! Object Read Path
//!
//! [`ObjectReader`] opens the placement group of a finalized object, loads
//! every endpoint's central directory (from the archive's own trailing
//! directory, falling back to the replicated metadata archive) and serves
//! whole-object or ranged reads. Stripe payloads are checksum-verified on
//! every read; when at most `parity_chunks()` stripes of a block are
//! unreadable the block is transparently reconstructed from the survivors.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::archive::{parse_directory, DirectoryEntry, EndOfCentralDirectory};
use crate::config::{ObjectConfig, StripeName};
use crate::encode::BlockCodec;
use crate::endpoint::{
    with_timeout, Endpoint, EndpointFile, EndpointProvider, OpenMode, ATTR_OBJECT_SIZE,
};
use crate::error::{Error, Result};
use crate::parallel::run_all;

// =============================================================================
// Object Reader
// =============================================================================

/// Read-side view of one finalized object.
pub struct ObjectReader {
    cfg: Arc<ObjectConfig>,
    codec: BlockCodec,
    object_size: u64,
    /// Open data archive per stripe index; `None` for unreachable endpoints
    archives: Vec<Option<Arc<dyn EndpointFile>>>,
    /// (block, stripe) -> directory entry
    entries: HashMap<(u64, u16), DirectoryEntry>,
}

impl ObjectReader {
    /// Open the placement group and load the stripe directory.
    ///
    /// Endpoints that fail to open or whose trailing directory does not
    /// parse are skipped; their stripes are reconstructed on demand as long
    /// as enough survivors remain.
    #[instrument(skip(cfg, provider), fields(object = %cfg.object_name))]
    pub async fn open(cfg: Arc<ObjectConfig>, provider: &dyn EndpointProvider) -> Result<Self> {
        cfg.validate()?;
        let codec = BlockCodec::new(&cfg)?;
        let endpoints: Vec<Arc<dyn Endpoint>> =
            cfg.placement.iter().map(|url| provider.resolve(url)).collect();
        let timeout = cfg.op_timeout();
        let archive_name = cfg.data_archive_name();

        let opens = endpoints
            .iter()
            .map(|ep| {
                let name = archive_name.clone();
                async move { with_timeout(ep.url(), timeout, ep.open(&name, OpenMode::Read)).await }
            })
            .collect();
        let opened = run_all(opens).await;

        let mut archives: Vec<Option<Arc<dyn EndpointFile>>> = Vec::with_capacity(opened.len());
        for (stripe, result) in opened.into_iter().enumerate() {
            match result {
                Ok(file) => archives.push(Some(file)),
                Err(err) => {
                    warn!(stripe, %err, "data archive unreachable");
                    archives.push(None);
                }
            }
        }

        let mut entries = HashMap::new();
        let mut object_size = None;
        let mut any_directory = false;
        let mut missing_directory = archives.iter().any(Option::is_none);
        for (stripe, archive) in archives.iter().enumerate() {
            let Some(file) = archive else { continue };
            if object_size.is_none() {
                if let Ok(Some(raw)) = file.get_attr(ATTR_OBJECT_SIZE).await {
                    object_size = raw.parse::<u64>().ok();
                }
            }
            match load_trailing_directory(file.as_ref()).await {
                Ok((dir, _eocd)) => {
                    any_directory = true;
                    collect_entries(&cfg, stripe as u16, dir, &mut entries);
                }
                Err(err) => {
                    missing_directory = true;
                    warn!(stripe, %err, "trailing directory unreadable");
                }
            }
        }

        // fall back to the replicated metadata archive for endpoints whose
        // own directory is gone
        if !any_directory || missing_directory {
            if let Some(dir) = load_metadata_directory(&cfg, &endpoints).await {
                any_directory = true;
                for entry in dir {
                    if let Ok(name) = StripeName::parse(&entry.name) {
                        entries
                            .entry((name.block_id, name.stripe_id))
                            .or_insert(entry);
                    }
                }
            }
        }
        if !any_directory {
            return Err(Error::endpoint(
                cfg.placement.join(","),
                "no endpoint yielded a readable central directory",
            ));
        }

        let object_size = match object_size {
            Some(size) => size,
            None => {
                return Err(Error::endpoint(
                    cfg.placement.join(","),
                    "object size attribute unavailable",
                ))
            }
        };

        debug!(object_size, entries = entries.len(), "object opened for reading");
        Ok(Self {
            cfg,
            codec,
            object_size,
            archives,
            entries,
        })
    }

    /// True object size in bytes.
    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    /// Read the whole object back.
    pub async fn read_all(&self) -> Result<Vec<u8>> {
        self.read(0, self.object_size as usize).await
    }

    /// Read `len` bytes at `offset`, clamped to the object size.
    pub async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = (offset + len as u64).min(self.object_size);
        if offset >= end {
            return Ok(Vec::new());
        }
        let block_size = self.cfg.block_size() as u64;
        let first = offset / block_size;
        let last = (end - 1) / block_size;

        let mut out = Vec::with_capacity((end - offset) as usize);
        for block_id in first..=last {
            let block = self.read_block(block_id).await?;
            let block_start = block_id * block_size;
            let from = offset.saturating_sub(block_start) as usize;
            let to = ((end - block_start) as usize).min(block.len());
            out.extend_from_slice(&block[from..to]);
        }
        Ok(out)
    }

    /// Application bytes carried by one block (the final block may be
    /// short).
    fn block_user_bytes(&self, block_id: u64) -> usize {
        let block_size = self.cfg.block_size() as u64;
        let start = block_id * block_size;
        (self.object_size - start).min(block_size) as usize
    }

    /// Read one block, reconstructing it if stripes are unreadable.
    pub async fn read_block(&self, block_id: u64) -> Result<Vec<u8>> {
        let total = self.cfg.total_chunks as usize;
        let data = self.cfg.data_chunks as usize;
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];

        // data stripes first; parity only when something is unreadable
        let data_reads = (0..data as u16).map(|s| self.read_stripe(block_id, s)).collect();
        for (stripe, result) in run_all(data_reads).await.into_iter().enumerate() {
            match result {
                Ok(payload) => shards[stripe] = Some(payload),
                Err(err) => debug!(block_id, stripe, %err, "data stripe unreadable"),
            }
        }

        if shards.iter().take(data).all(Option::is_some) {
            let mut out = Vec::with_capacity(self.cfg.block_size());
            for shard in shards.into_iter().take(data).flatten() {
                out.extend_from_slice(&shard);
            }
            out.truncate(self.block_user_bytes(block_id));
            return Ok(out);
        }

        let parity_reads = (data as u16..total as u16)
            .map(|s| self.read_stripe(block_id, s))
            .collect();
        for (i, result) in run_all(parity_reads).await.into_iter().enumerate() {
            match result {
                Ok(payload) => shards[data + i] = Some(payload),
                Err(err) => debug!(block_id, stripe = data + i, %err, "parity stripe unreadable"),
            }
        }

        let healthy = shards.iter().filter(|s| s.is_some()).count();
        if healthy < data {
            return Err(Error::UnrecoverableBlock {
                block: block_id,
                healthy,
                required: data,
            });
        }
        self.codec
            .decode_block(&mut shards, self.block_user_bytes(block_id))
    }

    /// Read and checksum-verify one stripe payload.
    async fn read_stripe(&self, block_id: u64, stripe_id: u16) -> Result<Vec<u8>> {
        let name = self.cfg.stripe_name(block_id, stripe_id);
        let entry = self
            .entries
            .get(&(block_id, stripe_id))
            .ok_or_else(|| Error::StripeNotFound { name: name.clone() })?;
        let file = self.archives[stripe_id as usize]
            .as_ref()
            .ok_or_else(|| Error::endpoint(self.cfg.endpoint_for(stripe_id), "archive unreachable"))?;

        let payload = with_timeout(
            self.cfg.endpoint_for(stripe_id),
            self.cfg.op_timeout(),
            file.read(entry.payload_offset(), entry.cdh.size as usize),
        )
        .await?;

        let actual = crc32c::crc32c(&payload);
        if actual != entry.cdh.crc32c {
            return Err(Error::ChecksumMismatch {
                name,
                expected: entry.cdh.crc32c,
                actual,
            });
        }
        Ok(payload.to_vec())
    }
}

// =============================================================================
// Directory Loading
// =============================================================================

/// Load an archive's own trailing central directory via its EOCD record.
///
/// Returns the parsed entries together with the EOCD, whose `cd_offset` is
/// the archive's append cursor.
pub(crate) async fn load_trailing_directory(
    file: &dyn EndpointFile,
) -> Result<(Vec<DirectoryEntry>, EndOfCentralDirectory)> {
    let size = file.size().await?;
    if size < EndOfCentralDirectory::SIZE as u64 {
        return Err(Error::format(
            "end of central directory",
            format!("archive too small: {size} bytes"),
        ));
    }
    let eocd_buf = file
        .read(size - EndOfCentralDirectory::SIZE as u64, EndOfCentralDirectory::SIZE)
        .await?;
    let eocd = EndOfCentralDirectory::decode(&eocd_buf)?;
    let cd_end = eocd.cd_offset as u64 + eocd.cd_size as u64;
    if cd_end + EndOfCentralDirectory::SIZE as u64 != size {
        return Err(Error::format(
            "end of central directory",
            format!("directory bounds {cd_end} inconsistent with archive size {size}"),
        ));
    }
    let cd_buf = file.read(eocd.cd_offset as u64, eocd.cd_size as usize).await?;
    let entries = parse_directory(&cd_buf)?;
    if entries.len() != eocd.entries as usize {
        return Err(Error::format(
            "end of central directory",
            format!("{} entries parsed, {} recorded", entries.len(), eocd.entries),
        ));
    }
    Ok((entries, eocd))
}

/// Load the aggregate directory from the first endpoint with a readable
/// metadata archive, trying the placement group in order.
pub(crate) async fn load_metadata_directory(
    cfg: &ObjectConfig,
    endpoints: &[Arc<dyn Endpoint>],
) -> Option<Vec<DirectoryEntry>> {
    let name = cfg.metadata_archive_name();
    for ep in endpoints {
        let Ok(file) = ep.open(&name, OpenMode::Read).await else {
            continue;
        };
        match load_trailing_directory(file.as_ref()).await {
            Ok((entries, _eocd)) => return Some(entries),
            Err(err) => {
                warn!(url = ep.url(), %err, "metadata archive unreadable");
            }
        }
    }
    None
}

/// Keep the entries of one endpoint's directory that actually belong to the
/// expected stripe index, keyed for lookup.
pub(crate) fn collect_entries(
    cfg: &ObjectConfig,
    stripe: u16,
    dir: Vec<DirectoryEntry>,
    entries: &mut HashMap<(u64, u16), DirectoryEntry>,
) {
    for entry in dir {
        match StripeName::parse(&entry.name) {
            Ok(name) if name.object == cfg.object_name && name.stripe_id == stripe => {
                entries.insert((name.block_id, name.stripe_id), entry);
            }
            _ => warn!(name = %entry.name, stripe, "foreign entry in directory"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::FileEndpointProvider;
    use crate::writer::StreamWriter;

    fn test_cfg(name: &str) -> Arc<ObjectConfig> {
        let placement = (0..6).map(|i| format!("ep-{i}")).collect();
        Arc::new(ObjectConfig::new(name, placement, 64, 4, 6).unwrap())
    }

    fn fill_pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn write_object(cfg: &Arc<ObjectConfig>, provider: &FileEndpointProvider, data: &[u8]) {
        let mut writer = StreamWriter::open(Arc::clone(cfg), provider).await.unwrap();
        writer.write(data).unwrap();
        assert_eq!(writer.close().await.unwrap(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_roundtrip_boundary_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileEndpointProvider::new(dir.path());
        let block = 256; // 64 * 4
        for (i, size) in [0usize, 1, block - 1, block, block + 1, 10 * block]
            .into_iter()
            .enumerate()
        {
            let cfg = test_cfg(&format!("obj-{i}"));
            let data = fill_pattern(size);
            write_object(&cfg, &provider, &data).await;

            let reader = ObjectReader::open(Arc::clone(&cfg), &provider).await.unwrap();
            assert_eq!(reader.object_size(), size as u64);
            assert_eq!(reader.read_all().await.unwrap(), data, "size {size}");
        }
    }

    #[tokio::test]
    async fn test_ranged_read_across_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileEndpointProvider::new(dir.path());
        let cfg = test_cfg("ranged");
        let data = fill_pattern(cfg.block_size() * 3 + 17);
        write_object(&cfg, &provider, &data).await;

        let reader = ObjectReader::open(Arc::clone(&cfg), &provider).await.unwrap();
        let from = cfg.block_size() - 5;
        let len = cfg.block_size() + 11;
        assert_eq!(
            reader.read(from as u64, len).await.unwrap(),
            &data[from..from + len]
        );
        // read past the end clamps
        assert_eq!(
            reader.read(data.len() as u64 - 3, 100).await.unwrap(),
            &data[data.len() - 3..]
        );
    }

    #[tokio::test]
    async fn test_read_reconstructs_lost_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileEndpointProvider::new(dir.path());
        let cfg = test_cfg("lost");
        let data = fill_pattern(cfg.block_size() * 2 + 9);
        write_object(&cfg, &provider, &data).await;

        // drop one whole endpoint archive
        std::fs::remove_file(dir.path().join("ep-1").join(cfg.data_archive_name())).unwrap();

        let reader = ObjectReader::open(Arc::clone(&cfg), &provider).await.unwrap();
        assert_eq!(reader.read_all().await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_read_detects_and_survives_payload_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileEndpointProvider::new(dir.path());
        let cfg = test_cfg("bitrot");
        let data = fill_pattern(cfg.block_size());
        write_object(&cfg, &provider, &data).await;

        // flip one payload byte of stripe 0 (first entry payload starts
        // past LFH + name)
        let path = dir.path().join("ep-0").join(cfg.data_archive_name());
        let mut raw = std::fs::read(&path).unwrap();
        let payload_at = 30 + cfg.stripe_name(0, 0).len();
        raw[payload_at] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        let reader = ObjectReader::open(Arc::clone(&cfg), &provider).await.unwrap();
        assert_eq!(reader.read_all().await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_unrecoverable_block_reported() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileEndpointProvider::new(dir.path());
        let cfg = test_cfg("gone");
        let data = fill_pattern(cfg.block_size());
        write_object(&cfg, &provider, &data).await;

        // lose parity_chunks() + 1 endpoints
        for ep in ["ep-0", "ep-1", "ep-2"] {
            std::fs::remove_file(dir.path().join(ep).join(cfg.data_archive_name())).unwrap();
        }

        let reader = ObjectReader::open(Arc::clone(&cfg), &provider).await.unwrap();
        let err = reader.read_all().await.unwrap_err();
        assert!(matches!(err, Error::UnrecoverableBlock { healthy: 3, required: 4, .. }));
    }

    #[tokio::test]
    async fn test_open_falls_back_to_metadata_archive() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileEndpointProvider::new(dir.path());
        let cfg = test_cfg("fallback");
        let data = fill_pattern(cfg.block_size() + 3);
        write_object(&cfg, &provider, &data).await;

        // truncate one archive's trailing directory; its entries must come
        // from the replicated metadata archive instead
        let path = dir.path().join("ep-3").join(cfg.data_archive_name());
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 10]).unwrap();

        let reader = ObjectReader::open(Arc::clone(&cfg), &provider).await.unwrap();
        assert_eq!(reader.read_all().await.unwrap(), data);
    }
}

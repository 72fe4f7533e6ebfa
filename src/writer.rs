//! Streaming Write Pipeline
//!
//! [`StreamWriter`] is the write-path orchestrator. It accepts application
//! writes without ever blocking on encoding, assembles them into blocks,
//! hands full blocks to the [`EncodeStage`](crate::encode::EncodeStage) and
//! drains the encoded results on one dedicated task that fans each block
//! out to the placement group. Per-endpoint central directories grow as
//! stripe writes confirm; close finalizes every data archive and replicates
//! the aggregate metadata archive.
//!
//! The global status tracker is the single serialization point of the
//! pipeline: it carries the outstanding byte count that gates finalization
//! and the first-failure-wins terminal status.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::archive::{aggregate_metadata, CentralDirectory, DirectoryEntry, LocalFileHeader};
use crate::config::ObjectConfig;
use crate::encode::{BlockCodec, EncodeStage, EncodedBlock, WrtBuff};
use crate::endpoint::{
    with_timeout, Endpoint, EndpointFile, EndpointProvider, OpenMode, ATTR_CORRUPTED,
    ATTR_OBJECT_SIZE, ATTR_VERSION,
};
use crate::error::{Error, Result};
use crate::parallel::{run_all, run_with_policy, SuccessPolicy};

/// Default depth of the encode worker pool
const DEFAULT_ENCODE_WORKERS: usize = 4;

// =============================================================================
// Global Write Status
// =============================================================================

/// Shared status of one object write: outstanding byte accounting plus the
/// first-failure-wins terminal status.
#[derive(Debug, Default)]
struct GlobalStatus {
    inner: Mutex<StatusInner>,
}

#[derive(Debug, Default)]
struct StatusInner {
    /// Application bytes handed to the pipeline
    issued: u64,
    /// Application bytes whose block completed processing, pass or fail
    settled: u64,
    /// Application bytes durably written on every stripe
    confirmed: u64,
    /// No more writes will be issued
    stopped: bool,
    /// First non-success status observed; later failures never overwrite it
    first_error: Option<Error>,
}

impl GlobalStatus {
    fn record_issued(&self, bytes: u64) {
        self.inner.lock().issued += bytes;
    }

    fn record_settled(&self, bytes: u64, confirmed: bool) {
        let mut inner = self.inner.lock();
        inner.settled += bytes;
        if confirmed {
            inner.confirmed += bytes;
        }
    }

    fn record_error(&self, err: Error) {
        let mut inner = self.inner.lock();
        if inner.first_error.is_none() {
            inner.first_error = Some(err);
        }
    }

    fn set_stopped(&self) {
        self.inner.lock().stopped = true;
    }

    /// True once no more writes will come and every issued byte settled.
    fn is_drained(&self) -> bool {
        let inner = self.inner.lock();
        inner.stopped && inner.issued == inner.settled
    }

    fn confirmed(&self) -> u64 {
        self.inner.lock().confirmed
    }

    fn issued(&self) -> u64 {
        self.inner.lock().issued
    }

    fn take_error(&self) -> Option<Error> {
        self.inner.lock().first_error.take()
    }
}

// =============================================================================
// Archive Appender
// =============================================================================

/// Append-side view of one endpoint's data archive: the open file, its
/// central directory ledger and the write cursor.
///
/// Appends are serialized per endpoint by the internal lock; the write path
/// has a single drain task anyway, but repair runs `WriteChunk` for
/// multiple blocks concurrently against the same endpoint.
pub struct ArchiveAppender {
    url: String,
    file: Arc<dyn EndpointFile>,
    state: tokio::sync::Mutex<CentralDirectory>,
    timeout: std::time::Duration,
}

impl ArchiveAppender {
    /// Appender over a freshly created archive.
    pub fn new(url: String, file: Arc<dyn EndpointFile>, timeout: std::time::Duration) -> Self {
        Self {
            url,
            file,
            state: tokio::sync::Mutex::new(CentralDirectory::new()),
            timeout,
        }
    }

    /// Appender resuming an existing archive whose directory was already
    /// parsed; fresh entries are appended over the old trailing directory.
    pub fn resume(
        url: String,
        file: Arc<dyn EndpointFile>,
        entries: &[DirectoryEntry],
        cd_offset: u32,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        Ok(Self {
            url,
            file,
            state: tokio::sync::Mutex::new(CentralDirectory::from_entries(entries, cd_offset)?),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn file(&self) -> &Arc<dyn EndpointFile> {
        &self.file
    }

    /// Append one (LFH, name, payload) triple and record its directory
    /// entry once the write confirms.
    pub async fn append(&self, name: &str, payload: Bytes, crc32c: u32) -> Result<()> {
        let mut cd = self.state.lock().await;
        let offset = cd.next_offset();
        let lfh = LocalFileHeader::new(payload.len() as u32, crc32c, name.len() as u16);
        let mut buf =
            BytesMut::with_capacity(LocalFileHeader::SIZE + name.len() + payload.len());
        lfh.encode_into(&mut buf);
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(&payload);
        with_timeout(
            &self.url,
            self.timeout,
            self.file.write(offset as u64, buf.freeze()),
        )
        .await?;
        cd.add(name, payload.len() as u32, crc32c, offset)?;
        Ok(())
    }

    /// Snapshot of the current directory ledger.
    pub async fn directory(&self) -> CentralDirectory {
        self.state.lock().await.clone()
    }

    /// Write the trailing directory and EOCD, stamp the object attributes
    /// and close the archive.
    pub async fn finalize(&self, object_size: u64, version: &str) -> Result<()> {
        let mut cd = self.state.lock().await;
        let offset = cd.next_offset();
        let trailing = cd.trailing_section();
        let end = offset as u64 + trailing.len() as u64;
        with_timeout(&self.url, self.timeout, self.file.write(offset as u64, trailing)).await?;
        with_timeout(&self.url, self.timeout, self.file.truncate(end)).await?;
        self.file
            .set_attr(ATTR_OBJECT_SIZE, &object_size.to_string())
            .await?;
        self.file.set_attr(ATTR_VERSION, version).await?;
        self.file.set_attr(ATTR_CORRUPTED, "0").await?;
        with_timeout(&self.url, self.timeout, self.file.close()).await
    }
}

/// Replicate the aggregate metadata archive to every endpoint; at least
/// `parity_chunks() + 1` replicas must land.
pub(crate) async fn write_metadata_archives(
    cfg: &ObjectConfig,
    endpoints: &[Arc<dyn Endpoint>],
    directories: &[&CentralDirectory],
) -> Result<()> {
    let buf = aggregate_metadata(directories)?;
    let name = cfg.metadata_archive_name();
    let timeout = cfg.op_timeout();
    let ops = endpoints
        .iter()
        .map(|ep| {
            let buf = buf.clone();
            let name = name.clone();
            async move {
                let file = match ep.open(&name, OpenMode::Update).await {
                    Ok(file) => file,
                    Err(_) => ep.open(&name, OpenMode::CreateNew).await?,
                };
                with_timeout(ep.url(), timeout, file.truncate(0)).await?;
                with_timeout(ep.url(), timeout, file.write(0, buf)).await?;
                with_timeout(ep.url(), timeout, file.close()).await
            }
        })
        .collect();
    run_with_policy(ops, SuccessPolicy::AtLeast(cfg.parity_chunks() as usize + 1)).await?;
    Ok(())
}

// =============================================================================
// Stream Writer
// =============================================================================

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("next_block", &self.next_block)
            .finish_non_exhaustive()
    }
}

/// Write-path orchestrator for one object.
pub struct StreamWriter {
    cfg: Arc<ObjectConfig>,
    stage: EncodeStage,
    status: Arc<GlobalStatus>,
    current: Option<WrtBuff>,
    next_block: u64,
    encoded_tx: Option<mpsc::UnboundedSender<oneshot::Receiver<Result<EncodedBlock>>>>,
    drain: Option<JoinHandle<()>>,
}

impl StreamWriter {
    /// Open one data archive per placement endpoint (create, exclusive).
    ///
    /// A write target set with a missing endpoint cannot later be repaired
    /// blindly, so a single failed open fails the whole open.
    #[instrument(skip(cfg, provider), fields(object = %cfg.object_name))]
    pub async fn open(cfg: Arc<ObjectConfig>, provider: &dyn EndpointProvider) -> Result<Self> {
        cfg.validate()?;
        let codec = BlockCodec::new(&cfg)?;
        let stage = EncodeStage::new(codec, DEFAULT_ENCODE_WORKERS);

        let endpoints: Vec<Arc<dyn Endpoint>> =
            cfg.placement.iter().map(|url| provider.resolve(url)).collect();

        let archive_name = cfg.data_archive_name();
        let timeout = cfg.op_timeout();
        let opens = endpoints
            .iter()
            .map(|ep| {
                let name = archive_name.clone();
                async move {
                    let file = with_timeout(
                        ep.url(),
                        timeout,
                        ep.open(&name, OpenMode::CreateNew),
                    )
                    .await?;
                    Ok(ArchiveAppender::new(ep.url().to_string(), file, timeout))
                }
            })
            .collect();
        let results = run_with_policy(opens, SuccessPolicy::All).await?;
        let archives: Vec<ArchiveAppender> = results.into_iter().collect::<Result<_>>()?;

        info!(endpoints = archives.len(), "object opened for writing");

        let status = Arc::new(GlobalStatus::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let drain = tokio::spawn(drain_loop(
            Arc::clone(&cfg),
            endpoints,
            archives,
            rx,
            Arc::clone(&status),
        ));

        Ok(Self {
            cfg,
            stage,
            status,
            current: None,
            next_block: 0,
            encoded_tx: Some(tx),
            drain: Some(drain),
        })
    }

    /// Append application bytes. Never blocks on encoding: a filled block
    /// moves to the encode stage and a fresh buffer starts immediately.
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        let tx = self
            .encoded_tx
            .as_ref()
            .ok_or_else(|| Error::Internal("write after close".to_string()))?;
        self.status.record_issued(data.len() as u64);
        while !data.is_empty() {
            let buff = self.current.get_or_insert_with(|| {
                let buff = WrtBuff::new(&self.cfg, self.next_block);
                self.next_block += 1;
                buff
            });
            let consumed = buff.write(data);
            data = &data[consumed..];
            if buff.is_full() {
                if let Some(full) = self.current.take() {
                    let rx = self.stage.submit(full);
                    if tx.send(rx).is_err() {
                        return Err(Error::Internal("writer drain task gone".to_string()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Cumulative bytes confirmed durably written; monotonic.
    pub fn get_size(&self) -> u64 {
        self.status.confirmed()
    }

    /// Mark that no more writes will be issued and wait for the pipeline to
    /// drain and finalize. Returns the confirmed byte count, or the first
    /// failure observed by any stripe write.
    #[instrument(skip(self), fields(object = %self.cfg.object_name))]
    pub async fn close(&mut self) -> Result<u64> {
        let tx = self
            .encoded_tx
            .take()
            .ok_or_else(|| Error::Internal("close called twice".to_string()))?;
        // force out the final partial block
        if let Some(buff) = self.current.take() {
            if !buff.is_empty() {
                let rx = self.stage.submit(buff);
                tx.send(rx)
                    .map_err(|_| Error::Internal("writer drain task gone".to_string()))?;
            }
        }
        self.status.set_stopped();
        drop(tx);

        if let Some(drain) = self.drain.take() {
            drain
                .await
                .map_err(|e| Error::Internal(format!("drain task panicked: {e}")))?;
        }
        match self.status.take_error() {
            Some(err) => Err(err),
            None => Ok(self.status.confirmed()),
        }
    }
}

// =============================================================================
// Drain Task
// =============================================================================

/// Dedicated task draining encoded blocks in block-number order relative to
/// submission, so every endpoint's directory entries append in ascending
/// offset order. Runs the deferred finalization once the pipeline drains.
async fn drain_loop(
    cfg: Arc<ObjectConfig>,
    endpoints: Vec<Arc<dyn Endpoint>>,
    archives: Vec<ArchiveAppender>,
    mut rx: mpsc::UnboundedReceiver<oneshot::Receiver<Result<EncodedBlock>>>,
    status: Arc<GlobalStatus>,
) {
    while let Some(block_rx) = rx.recv().await {
        match block_rx.await {
            Ok(Ok(block)) => write_block(&cfg, &archives, &status, block).await,
            Ok(Err(err)) => status.record_error(err),
            Err(_) => status.record_error(Error::Internal("encode stage dropped".to_string())),
        }
    }

    // no more writes will come; the outstanding byte count gates the
    // deferred close
    if !status.is_drained() {
        status.record_error(Error::Internal(
            "pipeline closed with outstanding bytes".to_string(),
        ));
        return;
    }
    if let Err(err) = finalize(&cfg, &endpoints, &archives, &status).await {
        status.record_error(err);
    }
}

/// Fan one encoded block out to every endpoint in parallel.
async fn write_block(
    cfg: &ObjectConfig,
    archives: &[ArchiveAppender],
    status: &GlobalStatus,
    block: EncodedBlock,
) {
    let block_id = block.block_id;
    let ops = archives
        .iter()
        .enumerate()
        .map(|(stripe, archive)| {
            let name = cfg.stripe_name(block_id, stripe as u16);
            let payload = block.stripes[stripe].clone();
            let crc = block.checksums[stripe];
            async move { archive.append(&name, payload, crc).await }
        })
        .collect();
    let results = run_all(ops).await;

    let mut confirmed = true;
    for (stripe, result) in results.into_iter().enumerate() {
        if let Err(err) = result {
            error!(block_id, stripe, %err, "stripe write failed");
            confirmed = false;
            // first failure wins; later ones are ignored
            status.record_error(err);
        }
    }
    debug!(block_id, confirmed, "block settled");
    status.record_settled(block.user_bytes as u64, confirmed);
}

/// Emit each endpoint's trailing directory, then replicate the aggregate
/// metadata archive so any reader can locate any stripe.
///
/// Archives are finalized independently: after a stripe failure the healthy
/// endpoints still commit their directories, leaving the object in a state
/// repair can reconcile.
async fn finalize(
    cfg: &ObjectConfig,
    endpoints: &[Arc<dyn Endpoint>],
    archives: &[ArchiveAppender],
    status: &GlobalStatus,
) -> Result<()> {
    let object_size = status.issued();
    let version = chrono::Utc::now().to_rfc3339();

    let closes = archives
        .iter()
        .map(|archive| archive.finalize(object_size, &version))
        .collect();
    let close_results = run_all(closes).await;
    let mut first_close_err = None;
    for (stripe, result) in close_results.into_iter().enumerate() {
        if let Err(err) = result {
            error!(stripe, %err, "archive finalize failed");
            if first_close_err.is_none() {
                first_close_err = Some(err);
            }
        }
    }

    let directories = {
        let mut dirs = Vec::with_capacity(archives.len());
        for archive in archives {
            dirs.push(archive.directory().await);
        }
        dirs
    };
    let dir_refs: Vec<&CentralDirectory> = directories.iter().collect();
    write_metadata_archives(cfg, endpoints, &dir_refs).await?;
    if let Some(err) = first_close_err {
        return Err(err);
    }
    info!(object_size, "object finalized");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

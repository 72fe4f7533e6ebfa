//! Repair And Verification Engine
//!
//! The read/verify/fix orchestrator. A run opens every endpoint of the
//! placement group, validates metadata consistency, classifies each stripe
//! as healthy, corrupted or missing, reconstructs damaged stripes from the
//! survivors and redistributes them, retiring whole endpoints to the
//! replacement list when they are unhealthy as a whole.
//!
//! Per endpoint archive the run moves through `TryOpen`, `ReadMetadata`,
//! `CompareLfhToCdh` and `InvalidateReplaceArchive`; per block it drives
//! the explicit state machine of [`block::BlockCheck`] from a channel of
//! stripe-completed events. One unrecoverable block never aborts the run;
//! it is recorded and every other block is still processed.
//!
//! # Components
//!
//! - **Engine** (this module): phase orchestration, endpoint retirement,
//!   counters and the final archive close.
//! - **Block state machine** (`block.rs`): per-block health census and the
//!   recoverable/unrecoverable decision.

pub mod block;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashSet;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::archive::{CentralDirectory, DirectoryEntry, LocalFileHeader};
use crate::config::ObjectConfig;
use crate::encode::BlockCodec;
use crate::endpoint::{
    with_timeout, Endpoint, EndpointFile, EndpointProvider, OpenMode, ATTR_CORRUPTED,
    ATTR_OBJECT_SIZE,
};
use crate::error::{Error, Result};
use crate::reader::{collect_entries, load_trailing_directory};
use crate::writer::{write_metadata_archives, ArchiveAppender};

use block::{BlockCheck, BlockState, StripeHealth};

// =============================================================================
// Options And Report
// =============================================================================

/// Tuning knobs of a repair or check run.
#[derive(Debug, Clone)]
pub struct RepairOptions {
    /// Upper bound on concurrently allocated stripe read buffers
    pub buffer_limit: usize,

    /// Re-run the whole verification pass once repair completes
    pub check_after_repair: bool,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            buffer_limit: 64,
            check_after_repair: false,
        }
    }
}

/// One endpoint retirement performed during a run.
#[derive(Debug, Clone, Serialize)]
pub struct Redirection {
    pub from: String,
    pub to: String,
}

/// Outcome counters of a repair or check run.
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub blocks_total: u64,
    pub blocks_checked: u64,
    /// Damaged stripes detected (missing or corrupted)
    pub chunks_repaired: u64,
    /// Regenerated stripes durably rewritten
    pub chunk_repairs_written: u64,
    /// Any block proved unrecoverable, or a scheduled repair write failed
    pub repair_failed: bool,
    pub redirections: Vec<Redirection>,
    /// Result of the verification re-run, when requested
    pub recheck_clean: Option<bool>,
}

impl RepairReport {
    /// True when nothing was damaged and nothing failed.
    pub fn is_clean(&self) -> bool {
        self.chunks_repaired == 0 && !self.repair_failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepairMode {
    /// Read-only verification; reports corruption without writing
    Check,
    /// Verification plus reconstruction and rewrite
    Repair,
}

#[derive(Debug, Default)]
struct Counters {
    blocks_checked: AtomicU64,
    chunks_repaired: AtomicU64,
    chunks_scheduled: AtomicU64,
    chunk_repairs_written: AtomicU64,
    repair_failed: AtomicBool,
}

// =============================================================================
// Run State
// =============================================================================

/// One endpoint of the placement group during a run, indexed by stripe id.
struct Slot {
    /// Effective url: the placement entry, or its replacement once retired
    url: String,
    /// Open archive handle for stripe reads
    file: Option<Arc<dyn EndpointFile>>,
    /// Append/finalize handle; present only in repair mode
    appender: Option<Arc<ArchiveAppender>>,
    /// False once the endpoint is retired or unreachable; every one of its
    /// stripes is then known missing
    healthy: bool,
}

struct RunState {
    cfg: Arc<ObjectConfig>,
    codec: Arc<BlockCodec>,
    mode: RepairMode,
    slots: Vec<Slot>,
    endpoints: Vec<Arc<dyn Endpoint>>,
    /// (block, stripe) -> directory entry, from every readable directory
    entries: HashMap<(u64, u16), DirectoryEntry>,
    /// Stripes classified damaged so far; the insert deduplicates the
    /// detection counter
    damaged: DashSet<(u64, u16)>,
    counters: Counters,
    buffers: Arc<Semaphore>,
    redirections: Mutex<Vec<Redirection>>,
    blocks_total: u64,
    object_size: Option<u64>,
}

// =============================================================================
// Repair Engine
// =============================================================================

/// Verification and repair orchestrator for one object.
pub struct RepairEngine {
    cfg: Arc<ObjectConfig>,
    options: RepairOptions,
}

impl RepairEngine {
    pub fn new(cfg: Arc<ObjectConfig>, options: RepairOptions) -> Self {
        Self { cfg, options }
    }

    /// Read-only verification: classify every stripe of every block and
    /// report, writing nothing.
    #[instrument(skip(self, provider), fields(object = %self.cfg.object_name))]
    pub async fn check_object(&self, provider: &dyn EndpointProvider) -> Result<RepairReport> {
        let mut report = self
            .run(provider, RepairMode::Check, &HashMap::new())
            .await?;
        if self.options.check_after_repair {
            // nothing was repaired; the verification pass is the run itself
            report.recheck_clean = Some(report.is_clean());
        }
        Ok(report)
    }

    /// Verification plus reconstruction: damaged stripes are regenerated
    /// from the survivors and rewritten to their (possibly redirected)
    /// endpoints.
    #[instrument(skip(self, provider), fields(object = %self.cfg.object_name))]
    pub async fn repair_object(&self, provider: &dyn EndpointProvider) -> Result<RepairReport> {
        let mut report = self
            .run(provider, RepairMode::Repair, &HashMap::new())
            .await?;
        if self.options.check_after_repair {
            // verify all blocks once repair of all blocks completed, against
            // the redirected layout of this run
            let redirects: HashMap<u16, String> = report
                .redirections
                .iter()
                .filter_map(|r| {
                    self.cfg
                        .placement
                        .iter()
                        .position(|url| *url == r.from)
                        .map(|stripe| (stripe as u16, r.to.clone()))
                })
                .collect();
            let verify = self.run(provider, RepairMode::Check, &redirects).await?;
            let clean = verify.is_clean();
            report.recheck_clean = Some(clean);
            if !clean {
                report.repair_failed = true;
            }
        }
        Ok(report)
    }

    async fn run(
        &self,
        provider: &dyn EndpointProvider,
        mode: RepairMode,
        redirects: &HashMap<u16, String>,
    ) -> Result<RepairReport> {
        self.cfg.validate()?;
        let codec = Arc::new(BlockCodec::new(&self.cfg)?);
        let total = self.cfg.total_chunks as usize;
        // a single block needs `total` buffers at once
        let buffer_limit = self.options.buffer_limit.max(total);

        let mut state = RunState {
            cfg: Arc::clone(&self.cfg),
            codec,
            mode,
            slots: Vec::with_capacity(total),
            endpoints: Vec::with_capacity(total),
            entries: HashMap::new(),
            damaged: DashSet::new(),
            counters: Counters::default(),
            buffers: Arc::new(Semaphore::new(buffer_limit)),
            redirections: Mutex::new(Vec::new()),
            blocks_total: 0,
            object_size: None,
        };

        self.try_open(provider, redirects, &mut state).await?;
        self.read_metadata(provider, &mut state).await?;

        let blocks: Vec<_> = (0..state.blocks_total)
            .map(|block_id| self.process_block(&state, block_id))
            .collect();
        join_all(blocks).await;

        // all blocks evaluated; every scheduled repair must have landed
        let scheduled = state.counters.chunks_scheduled.load(Ordering::SeqCst);
        let written = state.counters.chunk_repairs_written.load(Ordering::SeqCst);
        if mode == RepairMode::Repair && written != scheduled {
            error!(scheduled, written, "scheduled repairs did not all land");
            state.counters.repair_failed.store(true, Ordering::SeqCst);
        }

        self.close_all_archives(&state).await;

        let report = RepairReport {
            blocks_total: state.blocks_total,
            blocks_checked: state.counters.blocks_checked.load(Ordering::SeqCst),
            chunks_repaired: state.counters.chunks_repaired.load(Ordering::SeqCst),
            chunk_repairs_written: written,
            repair_failed: state.counters.repair_failed.load(Ordering::SeqCst),
            redirections: state.redirections.into_inner(),
            recheck_clean: None,
        };
        info!(
            blocks = report.blocks_total,
            damaged = report.chunks_repaired,
            written = report.chunk_repairs_written,
            failed = report.repair_failed,
            "run complete"
        );
        Ok(report)
    }

    // =========================================================================
    // Phase 1: TryOpen
    // =========================================================================

    /// Open every endpoint's data archive and read its health attribute;
    /// endpoints that fail to open or are flagged corrupted are unhealthy.
    async fn try_open(
        &self,
        provider: &dyn EndpointProvider,
        redirects: &HashMap<u16, String>,
        state: &mut RunState,
    ) -> Result<()> {
        let open_mode = match state.mode {
            RepairMode::Check => OpenMode::Read,
            RepairMode::Repair => OpenMode::Update,
        };
        let archive_name = self.cfg.data_archive_name();
        let timeout = self.cfg.op_timeout();

        let urls: Vec<String> = (0..self.cfg.total_chunks)
            .map(|stripe| {
                redirects
                    .get(&stripe)
                    .cloned()
                    .unwrap_or_else(|| self.cfg.placement[stripe as usize].clone())
            })
            .collect();

        let opens = urls
            .iter()
            .map(|url| {
                let ep = provider.resolve(url);
                let name = archive_name.clone();
                async move {
                    let opened =
                        with_timeout(ep.url(), timeout, ep.open(&name, open_mode)).await;
                    (ep, opened)
                }
            })
            .collect::<Vec<_>>();

        for (stripe, (ep, opened)) in join_all(opens).await.into_iter().enumerate() {
            let slot = match opened {
                Ok(file) => {
                    let flagged = matches!(
                        file.get_attr(ATTR_CORRUPTED).await,
                        Ok(Some(v)) if v.parse::<i64>().map(|d| d > 0).unwrap_or(false)
                    );
                    if flagged {
                        warn!(stripe, url = ep.url(), "archive flagged corrupted");
                    }
                    Slot {
                        url: ep.url().to_string(),
                        file: Some(file),
                        appender: None,
                        healthy: !flagged,
                    }
                }
                Err(err) => {
                    warn!(stripe, url = ep.url(), %err, "archive unreachable");
                    Slot {
                        url: ep.url().to_string(),
                        file: None,
                        appender: None,
                        healthy: false,
                    }
                }
            };
            state.endpoints.push(ep);
            state.slots.push(slot);
        }

        // true object size, with per-endpoint fallback
        for slot in state.slots.iter().filter(|s| s.file.is_some()) {
            if let Some(file) = &slot.file {
                if let Ok(Some(raw)) = file.get_attr(ATTR_OBJECT_SIZE).await {
                    if let Ok(size) = raw.parse::<u64>() {
                        state.object_size = Some(size);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Phase 2: ReadMetadata
    // =========================================================================

    /// Populate the stripe directory from every healthy endpoint's trailing
    /// central directory; endpoints whose directory does not parse are
    /// retired like unreachable ones.
    async fn read_metadata(
        &self,
        provider: &dyn EndpointProvider,
        state: &mut RunState,
    ) -> Result<()> {
        let timeout = self.cfg.op_timeout();
        let mut max_block: Option<u64> = None;

        for stripe in 0..state.slots.len() {
            let slot = &mut state.slots[stripe];
            if !slot.healthy {
                continue;
            }
            let file = slot.file.as_ref().map(Arc::clone);
            let Some(file) = file else { continue };
            match load_trailing_directory(file.as_ref()).await {
                Ok((dir, eocd)) => {
                    if state.mode == RepairMode::Repair {
                        slot.appender = Some(Arc::new(ArchiveAppender::resume(
                            slot.url.clone(),
                            file,
                            &dir,
                            eocd.cd_offset,
                            timeout,
                        )?));
                    }
                    collect_entries(&self.cfg, stripe as u16, dir, &mut state.entries);
                }
                Err(err) => {
                    warn!(stripe, url = %slot.url, %err, "damaged archive metadata");
                    slot.healthy = false;
                }
            }
        }
        for &(block, _) in state.entries.keys() {
            max_block = Some(max_block.map_or(block, |m| m.max(block)));
        }

        // retire endpoints that are unhealthy as a whole
        if state.mode == RepairMode::Repair {
            let mut next_replacement = 0usize;
            for stripe in 0..state.slots.len() {
                if !state.slots[stripe].healthy {
                    self.invalidate_replace_archive(provider, state, stripe, &mut next_replacement)
                        .await?;
                }
            }
        }

        state.blocks_total = match state.object_size {
            Some(size) => self.cfg.block_count(size),
            None => max_block.map_or(0, |m| m + 1),
        };
        Ok(())
    }

    // =========================================================================
    // Phase 4: InvalidateReplaceArchive
    // =========================================================================

    /// Retire one endpoint: flag it corrupted, close it, and open a fresh
    /// archive on the next replacement endpoint. Every stripe of the old
    /// archive becomes a redirection candidate for reconstruction.
    async fn invalidate_replace_archive(
        &self,
        provider: &dyn EndpointProvider,
        state: &mut RunState,
        stripe: usize,
        next_replacement: &mut usize,
    ) -> Result<()> {
        let old_url = state.slots[stripe].url.clone();
        let replacement = self
            .cfg
            .replacement
            .get(*next_replacement)
            .cloned()
            .ok_or_else(|| Error::ReplacementExhausted {
                url: old_url.clone(),
            })?;
        *next_replacement += 1;

        // mark the retired archive and close it without further use
        if let Some(file) = state.slots[stripe].file.take() {
            if let Err(err) = file.set_attr(ATTR_CORRUPTED, "1").await {
                warn!(url = %old_url, %err, "failed to flag retired archive");
            }
            let _ = file.close().await;
        }

        let ep = provider.resolve(&replacement);
        let name = self.cfg.data_archive_name();
        let timeout = self.cfg.op_timeout();
        let file = match ep.open(&name, OpenMode::CreateNew).await {
            Ok(file) => file,
            Err(_) => {
                // leftover from an earlier aborted repair; start it over
                let file =
                    with_timeout(ep.url(), timeout, ep.open(&name, OpenMode::Update)).await?;
                with_timeout(ep.url(), timeout, file.truncate(0)).await?;
                file
            }
        };

        info!(from = %old_url, to = %replacement, "endpoint retired");
        state.redirections.lock().push(Redirection {
            from: old_url,
            to: replacement.clone(),
        });
        state.endpoints[stripe] = ep;
        state.slots[stripe] = Slot {
            url: replacement.clone(),
            file: Some(Arc::clone(&file)),
            appender: Some(Arc::new(ArchiveAppender::new(replacement, file, timeout))),
            healthy: false,
        };
        Ok(())
    }

    // =========================================================================
    // Per-Block Error Correction
    // =========================================================================

    /// Drive one block through the check state machine: read every stripe
    /// not already known missing, then reconstruct and rewrite the damaged
    /// ones.
    async fn process_block(&self, state: &RunState, block_id: u64) {
        let total = self.cfg.total_chunks as usize;
        let data = self.cfg.data_chunks as usize;

        // the buffer bound: one permit per in-flight stripe buffer, the
        // whole block's worth acquired up front so blocks cannot deadlock
        // each other
        let Ok(_permits) = state.buffers.acquire_many(total as u32).await else {
            return;
        };

        let mut check = BlockCheck::new(block_id, total, data);
        for stripe in 0..total as u16 {
            let known_missing = !state.slots[stripe as usize].healthy
                || !state.entries.contains_key(&(block_id, stripe));
            if known_missing {
                self.record_damage(state, block_id, stripe);
                check.mark_known(stripe, StripeHealth::Missing);
            }
        }

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];
        let (tx, mut rx) = mpsc::channel::<(u16, StripeHealth, Option<Bytes>)>(total.max(1));
        let reads = check
            .pending_stripes()
            .into_iter()
            .map(|stripe| {
                let tx = tx.clone();
                async move {
                    let (health, payload) = self.verify_stripe(state, block_id, stripe).await;
                    let _ = tx.send((stripe, health, payload)).await;
                }
            })
            .collect::<Vec<_>>();
        drop(tx);

        let driver = async {
            while let Some((stripe, health, payload)) = rx.recv().await {
                if health.is_damaged() {
                    self.record_damage(state, block_id, stripe);
                }
                if let Some(payload) = payload {
                    shards[stripe as usize] = Some(payload.to_vec());
                }
                let transition = check.on_stripe(stripe, health);
                debug!(block_id, stripe, ?health, ?transition, "stripe settled");
            }
        };
        tokio::join!(join_all(reads), driver);

        match check.state() {
            BlockState::Done => {}
            BlockState::Unrecoverable => {
                let err = Error::UnrecoverableBlock {
                    block: block_id,
                    healthy: check.healthy_count(),
                    required: data,
                };
                error!(%err, "block unrecoverable");
                state.counters.repair_failed.store(true, Ordering::SeqCst);
            }
            BlockState::ReconstructMissing => {
                if state.mode == RepairMode::Repair {
                    self.reconstruct_block(state, &mut check, shards).await;
                }
            }
            // every stripe reports exactly once, so the census always ends
            // in a terminal state
            other => {
                error!(block_id, ?other, "census ended in non-terminal state");
                state.counters.repair_failed.store(true, Ordering::SeqCst);
            }
        }
        state.counters.blocks_checked.fetch_add(1, Ordering::SeqCst);
    }

    /// Regenerate every damaged stripe of a recoverable block and rewrite
    /// each one to its (possibly redirected) endpoint as a fresh entry.
    async fn reconstruct_block(
        &self,
        state: &RunState,
        check: &mut BlockCheck,
        shards: Vec<Option<Vec<u8>>>,
    ) {
        let block_id = check.block_id();
        let damaged = check.damaged_stripes();
        state
            .counters
            .chunks_scheduled
            .fetch_add(damaged.len() as u64, Ordering::SeqCst);

        let codec = Arc::clone(&state.codec);
        let mut shards = shards;
        for &stripe in &damaged {
            shards[stripe as usize] = None;
        }
        let reconstructed =
            tokio::task::spawn_blocking(move || -> Result<Vec<Option<Vec<u8>>>> {
                codec.reconstruct(&mut shards)?;
                Ok(shards)
            })
            .await
            .unwrap_or_else(|e| Err(Error::Internal(format!("decode task panicked: {e}"))));

        let shards = match reconstructed {
            Ok(shards) => shards,
            Err(err) => {
                error!(block_id, %err, "reconstruction failed");
                state.counters.repair_failed.store(true, Ordering::SeqCst);
                return;
            }
        };

        for stripe in damaged {
            let Some(payload) = shards[stripe as usize].as_ref() else {
                state.counters.repair_failed.store(true, Ordering::SeqCst);
                continue;
            };
            let Some(appender) = state.slots[stripe as usize].appender.as_ref() else {
                state.counters.repair_failed.store(true, Ordering::SeqCst);
                continue;
            };
            let name = self.cfg.stripe_name(block_id, stripe);
            let payload = Bytes::from(payload.clone());
            let crc = crc32c::crc32c(&payload);
            match appender.append(&name, payload, crc).await {
                Ok(()) => {
                    debug!(block_id, stripe, "stripe rewritten");
                    state
                        .counters
                        .chunk_repairs_written
                        .fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => {
                    error!(block_id, stripe, %err, "repair write failed");
                    state.counters.repair_failed.store(true, Ordering::SeqCst);
                }
            }
        }
        check.complete();
    }

    /// Count a stripe as damaged exactly once across the run.
    fn record_damage(&self, state: &RunState, block_id: u64, stripe: u16) {
        if state.damaged.insert((block_id, stripe)) {
            state.counters.chunks_repaired.fetch_add(1, Ordering::SeqCst);
        }
    }

    // =========================================================================
    // Phase 3: CompareLfhToCdh + payload verification
    // =========================================================================

    /// Re-read one stripe's local header and payload; compare the header
    /// field-for-field against the directory entry and the payload against
    /// a fresh checksum. Header mismatch or checksum mismatch classify the
    /// stripe corrupted, an unreadable stripe is missing.
    async fn verify_stripe(
        &self,
        state: &RunState,
        block_id: u64,
        stripe: u16,
    ) -> (StripeHealth, Option<Bytes>) {
        let Some(entry) = state.entries.get(&(block_id, stripe)) else {
            return (StripeHealth::Missing, None);
        };
        let Some(file) = state.slots[stripe as usize].file.as_ref() else {
            return (StripeHealth::Missing, None);
        };
        let name = self.cfg.stripe_name(block_id, stripe);

        let record_len =
            LocalFileHeader::SIZE + entry.cdh.name_len as usize + entry.cdh.size as usize;
        let raw = match with_timeout(
            &state.slots[stripe as usize].url,
            self.cfg.op_timeout(),
            file.read(entry.cdh.lfh_offset as u64, record_len),
        )
        .await
        {
            Ok(raw) => raw,
            Err(err) => {
                debug!(block_id, stripe, %err, "stripe unreadable");
                return (StripeHealth::Missing, None);
            }
        };

        let lfh = match LocalFileHeader::decode(&raw) {
            Ok(lfh) => lfh,
            Err(err) => {
                debug!(block_id, stripe, %err, "local header damaged");
                return (StripeHealth::Corrupted, None);
            }
        };
        if !lfh.matches(&entry.cdh) {
            debug!(block_id, stripe, "local header disagrees with directory");
            return (StripeHealth::Corrupted, None);
        }
        let stored_name =
            &raw[LocalFileHeader::SIZE..LocalFileHeader::SIZE + entry.cdh.name_len as usize];
        if stored_name != name.as_bytes() {
            debug!(block_id, stripe, "stored name disagrees with directory");
            return (StripeHealth::Corrupted, None);
        }

        let payload = raw.slice(LocalFileHeader::SIZE + entry.cdh.name_len as usize..);
        let actual = crc32c::crc32c(&payload);
        if actual != entry.cdh.crc32c {
            debug!(
                block_id,
                stripe,
                expected = entry.cdh.crc32c,
                actual,
                "payload checksum mismatch"
            );
            return (StripeHealth::Corrupted, None);
        }
        (StripeHealth::Healthy, Some(payload))
    }

    // =========================================================================
    // CloseAllArchives
    // =========================================================================

    /// Finalize every (possibly redirected) archive, clear the corruption
    /// markers and replicate the refreshed metadata archive. Check runs
    /// only release their read handles.
    async fn close_all_archives(&self, state: &RunState) {
        if state.mode == RepairMode::Check {
            for slot in &state.slots {
                if let Some(file) = &slot.file {
                    let _ = file.close().await;
                }
            }
            return;
        }

        let object_size = state
            .object_size
            .unwrap_or(state.blocks_total * self.cfg.block_size() as u64);
        let version = chrono::Utc::now().to_rfc3339();

        let mut directories: Vec<CentralDirectory> = Vec::with_capacity(state.slots.len());
        for slot in &state.slots {
            if let Some(appender) = &slot.appender {
                directories.push(appender.directory().await);
                if let Err(err) = appender.finalize(object_size, &version).await {
                    error!(url = %slot.url, %err, "archive close failed");
                    state.counters.repair_failed.store(true, Ordering::SeqCst);
                }
            }
        }

        let dir_refs: Vec<&CentralDirectory> = directories.iter().collect();
        if let Err(err) = write_metadata_archives(&self.cfg, &state.endpoints, &dir_refs).await {
            error!(%err, "metadata replication failed");
            state.counters.repair_failed.store(true, Ordering::SeqCst);
        }
    }
}

//! Block Encode Stage
//!
//! Takes one filled block buffer, erasure-encodes it into stripes and
//! computes a crc32c checksum per stripe, off the critical write path on a
//! bounded worker pool. The stage is a pure transformation; it knows
//! nothing about endpoints, archives or central directories.

use std::sync::Arc;

use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;
use tokio::sync::{oneshot, Semaphore};
use tracing::debug;

use crate::config::ObjectConfig;
use crate::error::{Error, Result};

// =============================================================================
// Block Buffer
// =============================================================================

/// One block of the object's byte stream being assembled.
///
/// Owns `total_chunks` stripe buffers of `chunk_size` bytes: the data
/// stripes fill sequentially as the application writes, the parity stripes
/// stay zeroed until the encode stage computes them. A partially filled
/// final block keeps its zero padding, so the transform's fixed-size input
/// contract always holds.
#[derive(Debug)]
pub struct WrtBuff {
    block_id: u64,
    chunk_size: usize,
    data_chunks: usize,
    stripes: Vec<Vec<u8>>,
    cursor: usize,
}

impl WrtBuff {
    pub fn new(cfg: &ObjectConfig, block_id: u64) -> Self {
        let chunk_size = cfg.chunk_size as usize;
        let stripes = (0..cfg.total_chunks as usize)
            .map(|_| vec![0u8; chunk_size])
            .collect();
        Self {
            block_id,
            chunk_size,
            data_chunks: cfg.data_chunks as usize,
            stripes,
            cursor: 0,
        }
    }

    /// Append bytes into the data stripes, returning how many were
    /// consumed (less than `data.len()` once the block is full).
    pub fn write(&mut self, data: &[u8]) -> usize {
        let mut consumed = 0;
        while consumed < data.len() && !self.is_full() {
            let stripe = self.cursor / self.chunk_size;
            let at = self.cursor % self.chunk_size;
            let take = (self.chunk_size - at).min(data.len() - consumed);
            self.stripes[stripe][at..at + take].copy_from_slice(&data[consumed..consumed + take]);
            self.cursor += take;
            consumed += take;
        }
        consumed
    }

    pub fn is_full(&self) -> bool {
        self.cursor == self.chunk_size * self.data_chunks
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Application bytes currently held by this block.
    pub fn user_bytes(&self) -> usize {
        self.cursor
    }

    pub fn block_id(&self) -> u64 {
        self.block_id
    }
}

// =============================================================================
// Encoded Block
// =============================================================================

/// A block after erasure encoding: one payload and one crc32c checksum per
/// stripe, ready to fan out to the placement group.
#[derive(Debug)]
pub struct EncodedBlock {
    pub block_id: u64,
    /// Application bytes the block carries (without zero padding)
    pub user_bytes: usize,
    pub stripes: Vec<Bytes>,
    pub checksums: Vec<u32>,
}

// =============================================================================
// Block Codec
// =============================================================================

/// Reed-Solomon transform over a block's stripes with a fixed data/parity
/// split. Infallible for well-formed input: fixed-size, fully populated
/// blocks.
pub struct BlockCodec {
    rs: Arc<ReedSolomon>,
    data_chunks: usize,
    total_chunks: usize,
    chunk_size: usize,
}

impl BlockCodec {
    pub fn new(cfg: &ObjectConfig) -> Result<Self> {
        let data = cfg.data_chunks as usize;
        let parity = cfg.parity_chunks() as usize;
        let rs = ReedSolomon::new(data, parity)
            .map_err(|e| Error::Config(format!("failed to create Reed-Solomon codec: {e}")))?;
        Ok(Self {
            rs: Arc::new(rs),
            data_chunks: data,
            total_chunks: data + parity,
            chunk_size: cfg.chunk_size as usize,
        })
    }

    pub fn data_chunks(&self) -> usize {
        self.data_chunks
    }

    /// Fill the parity stripes of a block in place.
    fn encode_stripes(&self, stripes: &mut [Vec<u8>]) -> Result<()> {
        self.rs
            .encode(stripes)
            .map_err(|e| Error::Internal(format!("Reed-Solomon encoding failed: {e}")))
    }

    /// Regenerate every `None` stripe from the survivors. At least
    /// `data_chunks` stripes must be present.
    pub fn reconstruct(&self, stripes: &mut [Option<Vec<u8>>]) -> Result<()> {
        if stripes.len() != self.total_chunks {
            return Err(Error::Internal(format!(
                "expected {} stripes, got {}",
                self.total_chunks,
                stripes.len()
            )));
        }
        let available = stripes.iter().filter(|s| s.is_some()).count();
        if available < self.data_chunks {
            return Err(Error::InsufficientStripes {
                available,
                required: self.data_chunks,
            });
        }
        self.rs
            .reconstruct(stripes)
            .map_err(|e| Error::Internal(format!("Reed-Solomon reconstruction failed: {e}")))
    }

    /// Reconstruct missing data stripes and concatenate them back into the
    /// block's application bytes, trimmed to `user_bytes`.
    pub fn decode_block(
        &self,
        stripes: &mut [Option<Vec<u8>>],
        user_bytes: usize,
    ) -> Result<Vec<u8>> {
        self.reconstruct(stripes)?;
        let mut data = Vec::with_capacity(user_bytes);
        for stripe in stripes.iter().take(self.data_chunks).flatten() {
            data.extend_from_slice(stripe);
        }
        data.truncate(user_bytes);
        Ok(data)
    }

    /// Encode one block buffer into its final stripe set with checksums.
    pub fn encode_block(&self, buff: WrtBuff) -> Result<EncodedBlock> {
        debug_assert_eq!(buff.stripes.len(), self.total_chunks);
        debug_assert_eq!(buff.chunk_size, self.chunk_size);
        let WrtBuff {
            block_id,
            mut stripes,
            cursor,
            ..
        } = buff;
        self.encode_stripes(&mut stripes)?;
        let checksums = stripes.iter().map(|s| crc32c::crc32c(s)).collect();
        let stripes = stripes.into_iter().map(Bytes::from).collect();
        Ok(EncodedBlock {
            block_id,
            user_bytes: cursor,
            stripes,
            checksums,
        })
    }
}

// =============================================================================
// Encode Stage
// =============================================================================

/// Bounded worker pool running the CPU-bound encode off any I/O thread.
///
/// Submission returns immediately with a completion handle; the pool depth
/// is the implicit backpressure bound of the encode-to-write pipeline.
pub struct EncodeStage {
    codec: Arc<BlockCodec>,
    permits: Arc<Semaphore>,
}

impl EncodeStage {
    pub fn new(codec: BlockCodec, workers: usize) -> Self {
        Self {
            codec: Arc::new(codec),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn codec(&self) -> Arc<BlockCodec> {
        Arc::clone(&self.codec)
    }

    /// Hand a filled block to the pool. The returned receiver resolves once
    /// the block is encoded; receivers complete in whatever order the pool
    /// finishes, callers that need submission order await them in sequence.
    pub fn submit(&self, buff: WrtBuff) -> oneshot::Receiver<Result<EncodedBlock>> {
        let (tx, rx) = oneshot::channel();
        let codec = Arc::clone(&self.codec);
        let permits = Arc::clone(&self.permits);
        let block_id = buff.block_id();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let result = tokio::task::spawn_blocking(move || codec.encode_block(buff))
                .await
                .unwrap_or_else(|e| Err(Error::Internal(format!("encode task panicked: {e}"))));
            debug!(block_id, "block encoded");
            // receiver dropped means the writer is gone; nothing to do
            let _ = tx.send(result);
        });
        rx
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> ObjectConfig {
        let placement = (0..6).map(|i| format!("ep-{i}")).collect();
        ObjectConfig::new("obj", placement, 64, 4, 6).unwrap()
    }

    fn fill_pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_wrt_buff_sequential_fill() {
        let cfg = test_cfg();
        let mut buff = WrtBuff::new(&cfg, 0);
        assert!(buff.is_empty());

        let data = fill_pattern(100);
        assert_eq!(buff.write(&data), 100);
        assert_eq!(buff.user_bytes(), 100);
        // first stripe holds the first chunk_size bytes
        assert_eq!(&buff.stripes[0][..], &data[..64]);
        assert_eq!(&buff.stripes[1][..36], &data[64..]);

        // fill to the brim; excess is not consumed
        let more = fill_pattern(cfg.block_size());
        assert_eq!(buff.write(&more), cfg.block_size() - 100);
        assert!(buff.is_full());
        assert_eq!(buff.write(b"x"), 0);
    }

    #[test]
    fn test_encode_block_checksums() {
        let cfg = test_cfg();
        let codec = BlockCodec::new(&cfg).unwrap();
        let mut buff = WrtBuff::new(&cfg, 3);
        buff.write(&fill_pattern(cfg.block_size()));

        let block = codec.encode_block(buff).unwrap();
        assert_eq!(block.block_id, 3);
        assert_eq!(block.stripes.len(), 6);
        assert_eq!(block.user_bytes, cfg.block_size());
        for (stripe, cksum) in block.stripes.iter().zip(&block.checksums) {
            assert_eq!(stripe.len(), 64);
            assert_eq!(crc32c::crc32c(stripe), *cksum);
        }
    }

    #[test]
    fn test_reconstruct_from_parity_losses() {
        let cfg = test_cfg();
        let codec = BlockCodec::new(&cfg).unwrap();
        let mut buff = WrtBuff::new(&cfg, 0);
        let data = fill_pattern(cfg.block_size());
        buff.write(&data);
        let block = codec.encode_block(buff).unwrap();

        // lose parity_chunks() stripes, one data one parity
        let mut shards: Vec<Option<Vec<u8>>> =
            block.stripes.iter().map(|s| Some(s.to_vec())).collect();
        shards[1] = None;
        shards[5] = None;

        let recovered = codec.decode_block(&mut shards, cfg.block_size()).unwrap();
        assert_eq!(recovered, data);
    }

    #[test]
    fn test_reconstruct_insufficient_stripes() {
        let cfg = test_cfg();
        let codec = BlockCodec::new(&cfg).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> = vec![Some(vec![0u8; 64]); 6];
        shards[0] = None;
        shards[1] = None;
        shards[2] = None;
        let err = codec.reconstruct(&mut shards).unwrap_err();
        assert!(matches!(err, Error::InsufficientStripes { available: 3, required: 4 }));
    }

    #[test]
    fn test_partial_block_zero_padded() {
        let cfg = test_cfg();
        let codec = BlockCodec::new(&cfg).unwrap();
        let mut buff = WrtBuff::new(&cfg, 0);
        buff.write(&fill_pattern(10));
        let block = codec.encode_block(buff).unwrap();
        assert_eq!(block.user_bytes, 10);
        // padding survives the transform
        assert!(block.stripes[0][10..].iter().all(|&b| b == 0));

        let mut shards: Vec<Option<Vec<u8>>> =
            block.stripes.iter().map(|s| Some(s.to_vec())).collect();
        shards[0] = None;
        let recovered = codec.decode_block(&mut shards, 10).unwrap();
        assert_eq!(recovered, fill_pattern(10));
    }

    #[tokio::test]
    async fn test_stage_submit_resolves() {
        let cfg = test_cfg();
        let stage = EncodeStage::new(BlockCodec::new(&cfg).unwrap(), 2);
        let mut rxs = Vec::new();
        for block_id in 0..8 {
            let mut buff = WrtBuff::new(&cfg, block_id);
            buff.write(&fill_pattern(cfg.block_size()));
            rxs.push(stage.submit(buff));
        }
        // drain in submission order regardless of pool completion order
        for (block_id, rx) in rxs.into_iter().enumerate() {
            let block = rx.await.unwrap().unwrap();
            assert_eq!(block.block_id, block_id as u64);
        }
    }
}

//! Per-Block Check State Machine
//!
//! One [`BlockCheck`] tracks the verification of a single block: which
//! stripes reported healthy, which are missing or corrupted, and whether
//! the block can be reconstructed. It is a plain state machine driven by
//! stripe-completed events, so the terminal transitions are testable
//! without any I/O.

/// Health classification of one stripe within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripeHealth {
    /// Read not yet reported
    Unknown,
    /// Present, headers consistent, payload checksum verified
    Healthy,
    /// Absent or unreadable on its endpoint
    Missing,
    /// Present but failed header comparison or checksum verification
    Corrupted,
}

impl StripeHealth {
    pub fn is_damaged(&self) -> bool {
        matches!(self, StripeHealth::Missing | StripeHealth::Corrupted)
    }
}

/// State of one block's verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Stripe reads are outstanding
    ReadingStripes,
    /// Enough stripes reported to decide recoverability; census incomplete
    Evaluating,
    /// All stripes reported; damaged stripes must be regenerated
    ReconstructMissing,
    /// All stripes confirmed healthy, or every damaged stripe rewritten
    Done,
    /// Fewer than `data_chunks` healthy stripes survive
    Unrecoverable,
}

/// Verification progress of one block.
#[derive(Debug)]
pub struct BlockCheck {
    block_id: u64,
    data_chunks: usize,
    stripes: Vec<StripeHealth>,
    reported: usize,
    state: BlockState,
}

impl BlockCheck {
    /// Start a check with stripes already known absent (unreachable or
    /// retired endpoints, entries missing from the directory) pre-marked.
    pub fn new(block_id: u64, total_chunks: usize, data_chunks: usize) -> Self {
        Self {
            block_id,
            data_chunks,
            stripes: vec![StripeHealth::Unknown; total_chunks],
            reported: 0,
            state: BlockState::ReadingStripes,
        }
    }

    pub fn block_id(&self) -> u64 {
        self.block_id
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn stripe(&self, stripe_id: u16) -> StripeHealth {
        self.stripes[stripe_id as usize]
    }

    /// Mark a stripe as known damaged before any read is issued.
    pub fn mark_known(&mut self, stripe_id: u16, health: StripeHealth) {
        self.on_stripe(stripe_id, health);
    }

    /// Stripe ids that still need a read issued.
    pub fn pending_stripes(&self) -> Vec<u16> {
        self.stripes
            .iter()
            .enumerate()
            .filter(|(_, h)| **h == StripeHealth::Unknown)
            .map(|(i, _)| i as u16)
            .collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.stripes
            .iter()
            .filter(|h| **h == StripeHealth::Healthy)
            .count()
    }

    /// Stripe ids classified missing or corrupted.
    pub fn damaged_stripes(&self) -> Vec<u16> {
        self.stripes
            .iter()
            .enumerate()
            .filter(|(_, h)| h.is_damaged())
            .map(|(i, _)| i as u16)
            .collect()
    }

    /// Record one stripe-completed event and re-evaluate the block.
    pub fn on_stripe(&mut self, stripe_id: u16, health: StripeHealth) -> BlockState {
        debug_assert_ne!(health, StripeHealth::Unknown);
        let slot = &mut self.stripes[stripe_id as usize];
        if *slot == StripeHealth::Unknown {
            *slot = health;
            self.reported += 1;
        }
        self.evaluate()
    }

    /// Decide what the block needs. Recoverability is decided as soon as
    /// enough stripes reported: `data_chunks` healthy stripes make
    /// reconstruction possible, too many damaged stripes make the block
    /// unrecoverable; the full census is still awaited before entering
    /// reconstruction so every damaged stripe is regenerated.
    fn evaluate(&mut self) -> BlockState {
        let total = self.stripes.len();
        let healthy = self.healthy_count();
        let damaged = self.reported - healthy;
        let parity = total - self.data_chunks;

        self.state = if damaged > parity {
            BlockState::Unrecoverable
        } else if self.reported == total {
            if damaged == 0 {
                BlockState::Done
            } else {
                BlockState::ReconstructMissing
            }
        } else if healthy >= self.data_chunks {
            BlockState::Evaluating
        } else {
            BlockState::ReadingStripes
        };
        self.state
    }

    /// Mark the block terminal once every damaged stripe was rewritten.
    pub fn complete(&mut self) {
        debug_assert_eq!(self.state, BlockState::ReconstructMissing);
        self.state = BlockState::Done;
    }
}

// =============================================================================
// Tests
// =============================================================================

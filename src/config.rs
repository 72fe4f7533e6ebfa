//! Object Layout Configuration
//!
//! An [`ObjectConfig`] is the immutable description of one object's layout:
//! its name, the ordered placement group of endpoints its stripes are
//! distributed across, the stripe geometry (chunk size, data/parity split)
//! and the optional replacement endpoints consulted only during repair.
//!
//! Stripe `i` of every block always lands on `placement[i]`; a repair run
//! may redirect a retired endpoint through its own redirection map, which is
//! owned by the repair engine and never part of this config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default per-call endpoint operation timeout in seconds
const DEFAULT_OP_TIMEOUT_SECS: u64 = 30;

fn default_op_timeout() -> u64 {
    DEFAULT_OP_TIMEOUT_SECS
}

// =============================================================================
// Object Configuration
// =============================================================================

/// Immutable layout description of one erasure-coded object.
///
/// Shared by reference (`Arc`) between the writer, reader and repair engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectConfig {
    /// Object name (may itself contain dots)
    pub object_name: String,

    /// Ordered placement group; stripe `i` maps to `placement[i]`
    pub placement: Vec<String>,

    /// Replacement endpoints, consumed in order when an endpoint is
    /// abandoned during repair
    #[serde(default)]
    pub replacement: Vec<String>,

    /// Bytes per stripe
    pub chunk_size: u32,

    /// Number of data stripes per block (k)
    pub data_chunks: u16,

    /// Total stripes per block (k + m)
    pub total_chunks: u16,

    /// Per-call endpoint operation timeout in seconds
    #[serde(default = "default_op_timeout")]
    pub op_timeout_secs: u64,
}

impl ObjectConfig {
    /// Create a new configuration, validating the layout invariants.
    pub fn new(
        object_name: impl Into<String>,
        placement: Vec<String>,
        chunk_size: u32,
        data_chunks: u16,
        total_chunks: u16,
    ) -> Result<Self> {
        let cfg = Self {
            object_name: object_name.into(),
            placement,
            replacement: Vec::new(),
            chunk_size,
            data_chunks,
            total_chunks,
            op_timeout_secs: DEFAULT_OP_TIMEOUT_SECS,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Attach replacement endpoints used for repair-time redirection.
    pub fn with_replacement(mut self, replacement: Vec<String>) -> Self {
        self.replacement = replacement;
        self
    }

    /// Check the layout invariants.
    pub fn validate(&self) -> Result<()> {
        if self.object_name.is_empty() {
            return Err(Error::Config("object_name must not be empty".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than 0".to_string()));
        }
        if self.data_chunks == 0 {
            return Err(Error::Config("data_chunks must be greater than 0".to_string()));
        }
        if self.total_chunks <= self.data_chunks {
            return Err(Error::Config(format!(
                "total_chunks ({}) must exceed data_chunks ({})",
                self.total_chunks, self.data_chunks
            )));
        }
        if self.placement.len() != self.total_chunks as usize {
            return Err(Error::Config(format!(
                "placement group size ({}) must equal total_chunks ({})",
                self.placement.len(),
                self.total_chunks
            )));
        }
        Ok(())
    }

    /// Bytes of application data per block.
    pub fn block_size(&self) -> usize {
        self.chunk_size as usize * self.data_chunks as usize
    }

    /// Number of parity stripes per block (m).
    pub fn parity_chunks(&self) -> u16 {
        self.total_chunks - self.data_chunks
    }

    /// Endpoint url holding stripe `stripe_id` (before any redirection).
    pub fn endpoint_for(&self, stripe_id: u16) -> &str {
        &self.placement[stripe_id as usize]
    }

    /// Derived name of one stripe: `"{object}.{block}.{stripe}"`.
    pub fn stripe_name(&self, block_id: u64, stripe_id: u16) -> String {
        format!("{}.{}.{}", self.object_name, block_id, stripe_id)
    }

    /// Name of the per-endpoint data archive.
    pub fn data_archive_name(&self) -> String {
        format!("{}.zip", self.object_name)
    }

    /// Name of the per-endpoint aggregate metadata archive.
    pub fn metadata_archive_name(&self) -> String {
        format!("{}.metadata.zip", self.object_name)
    }

    /// Number of blocks an object of `size` bytes occupies.
    pub fn block_count(&self, size: u64) -> u64 {
        size.div_ceil(self.block_size() as u64)
    }

    /// Per-call endpoint operation timeout.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

// =============================================================================
// Stripe Names
// =============================================================================

/// Parsed form of a stripe name `"{object}.{block}.{stripe}"`.
///
/// Object names may themselves contain dots, so parsing splits on the *last*
/// two dot-separated suffixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeName {
    pub object: String,
    pub block_id: u64,
    pub stripe_id: u16,
}

impl StripeName {
    /// Parse a stripe name, recovering block and stripe ids.
    pub fn parse(name: &str) -> Result<Self> {
        let bad = || Error::Config(format!("malformed stripe name: {name}"));
        let (rest, stripe) = name.rsplit_once('.').ok_or_else(bad)?;
        let (object, block) = rest.rsplit_once('.').ok_or_else(bad)?;
        if object.is_empty() {
            return Err(bad());
        }
        Ok(Self {
            object: object.to_string(),
            block_id: block.parse().map_err(|_| bad())?,
            stripe_id: stripe.parse().map_err(|_| bad())?,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn placement(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("ep-{i}")).collect()
    }

    #[test]
    fn test_config_derived_values() {
        let cfg = ObjectConfig::new("obj", placement(6), 1024, 4, 6).unwrap();
        assert_eq!(cfg.block_size(), 4096);
        assert_eq!(cfg.parity_chunks(), 2);
        assert_eq!(cfg.endpoint_for(5), "ep-5");
        assert_eq!(cfg.block_count(0), 0);
        assert_eq!(cfg.block_count(1), 1);
        assert_eq!(cfg.block_count(4096), 1);
        assert_eq!(cfg.block_count(4097), 2);
    }

    #[test]
    fn test_config_rejects_mismatched_placement() {
        let err = ObjectConfig::new("obj", placement(5), 1024, 4, 6).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_config_rejects_degenerate_geometry() {
        assert!(ObjectConfig::new("obj", placement(4), 1024, 4, 4).is_err());
        assert!(ObjectConfig::new("obj", placement(6), 0, 4, 6).is_err());
        assert!(ObjectConfig::new("", placement(6), 1024, 4, 6).is_err());
    }

    #[test]
    fn test_stripe_name_roundtrip() {
        let cfg = ObjectConfig::new("obj", placement(6), 1024, 4, 6).unwrap();
        let name = cfg.stripe_name(17, 3);
        let parsed = StripeName::parse(&name).unwrap();
        assert_eq!(parsed.object, "obj");
        assert_eq!(parsed.block_id, 17);
        assert_eq!(parsed.stripe_id, 3);
    }

    #[test]
    fn test_stripe_name_with_dotted_object() {
        let parsed = StripeName::parse("data.2024.backup.42.11").unwrap();
        assert_eq!(parsed.object, "data.2024.backup");
        assert_eq!(parsed.block_id, 42);
        assert_eq!(parsed.stripe_id, 11);
    }

    #[test]
    fn test_stripe_name_rejects_garbage() {
        assert!(StripeName::parse("noseparators").is_err());
        assert!(StripeName::parse("obj.x.1").is_err());
        assert!(StripeName::parse("obj.1.x").is_err());
        assert!(StripeName::parse(".1.2").is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let cfg = ObjectConfig::new("obj", placement(6), 1024, 4, 6)
            .unwrap()
            .with_replacement(vec!["spare-0".to_string()]);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ObjectConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.object_name, "obj");
        assert_eq!(back.replacement, vec!["spare-0".to_string()]);
        assert_eq!(back.op_timeout_secs, 30);
    }
}

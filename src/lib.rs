//! StripeStor - Erasure-Coded Object Storage Layer
//!
//! Splits a byte stream into fixed-size blocks, erasure-encodes each block
//! into a fixed number of stripes and durably distributes the stripes
//! across a placement group of independent storage endpoints. Each stripe
//! is wrapped in a bit-exact archive record format so data and per-endpoint
//! metadata co-exist in one container per endpoint.
//!
//! # Architecture
//!
//! ```text
//! application bytes
//!        │
//!        ▼
//! ┌──────────────┐   ┌──────────────────┐   ┌───────────────────────────┐
//! │ StreamWriter │──▶│ BlockEncodeStage │──▶│ per-endpoint archive      │
//! │ (block fill) │   │ (RS + crc32c)    │   │ writes + central          │
//! └──────────────┘   └──────────────────┘   │ directories               │
//!                                           └───────────────────────────┘
//!        read / verify / fix
//! ┌──────────────┐   ┌──────────────────┐
//! │ ObjectReader │   │   RepairEngine   │
//! └──────────────┘   └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`archive`] - Bit-exact archive record codec and central directories
//! - [`config`] - Object layout configuration and stripe naming
//! - [`encode`] - Block buffers and the bounded erasure-encode stage
//! - [`endpoint`] - Storage endpoint port and local-filesystem adapter
//! - [`error`] - Error types
//! - [`parallel`] - Success-policy fan-out combinator
//! - [`reader`] - Read path with transparent reconstruction
//! - [`repair`] - Verification and repair engine
//! - [`writer`] - Streaming write pipeline

pub mod archive;
pub mod config;
pub mod encode;
pub mod endpoint;
pub mod error;
pub mod parallel;
pub mod reader;
pub mod repair;
pub mod writer;

// Re-export commonly used types
pub use config::{ObjectConfig, StripeName};
pub use endpoint::{Endpoint, EndpointFile, EndpointProvider, FileEndpointProvider, OpenMode};
pub use error::{Error, Result};
pub use reader::ObjectReader;
pub use repair::{RepairEngine, RepairOptions, RepairReport};
pub use writer::StreamWriter;

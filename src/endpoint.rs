//! Storage Endpoint Abstraction
//!
//! The engine never talks to storage directly; it goes through the
//! [`Endpoint`] port. An endpoint is one member of a placement group and
//! can open named archive files for positional reads and writes, expose
//! their size and carry named extended attributes (the out-of-band health
//! and object-size signals). All operations are asynchronous; callers
//! register continuations and never block a thread on a round-trip.
//!
//! [`FileEndpoint`] is the local-filesystem adapter used by the CLI and the
//! test suites. Network adapters implement the same trait.

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task;

use crate::error::{Error, Result};

/// Attribute carrying the object's true byte size
pub const ATTR_OBJECT_SIZE: &str = "stripestor.objsize";

/// Attribute flagging a known-corrupted archive; consulted before repair
/// and cleared once all archives close healthy
pub const ATTR_CORRUPTED: &str = "stripestor.corrupted";

/// Attribute recording the close timestamp of the last successful write
pub const ATTR_VERSION: &str = "stripestor.version";

// =============================================================================
// Ports
// =============================================================================

/// How an archive file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create exclusively for writing; fails if the file exists
    CreateNew,
    /// Read-only; fails if the file does not exist
    Read,
    /// Read-write on an existing file
    Update,
}

/// One storage endpoint of a placement group.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Stable identifier of this endpoint (the placement url)
    fn url(&self) -> &str;

    /// Open the named archive file on this endpoint.
    async fn open(&self, name: &str, mode: OpenMode) -> Result<Arc<dyn EndpointFile>>;
}

impl std::fmt::Debug for dyn EndpointFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn EndpointFile")
    }
}

/// An open archive file on one endpoint.
#[async_trait]
pub trait EndpointFile: Send + Sync {
    /// Current file size in bytes
    async fn size(&self) -> Result<u64>;

    /// Read exactly `len` bytes at `offset`
    async fn read(&self, offset: u64, len: usize) -> Result<Bytes>;

    /// Write all of `data` at `offset`
    async fn write(&self, offset: u64, data: Bytes) -> Result<()>;

    /// Truncate the file to `len` bytes
    async fn truncate(&self, len: u64) -> Result<()>;

    /// Read a named extended attribute, `None` if absent
    async fn get_attr(&self, name: &str) -> Result<Option<String>>;

    /// Set a named extended attribute
    async fn set_attr(&self, name: &str, value: &str) -> Result<()>;

    /// Flush and close the file
    async fn close(&self) -> Result<()>;
}

/// Resolves placement urls to endpoint instances.
pub trait EndpointProvider: Send + Sync {
    fn resolve(&self, url: &str) -> Arc<dyn Endpoint>;
}

/// Await `fut` under the per-call endpoint timeout; expiry is reported as a
/// failed operation against `url`.
pub(crate) async fn with_timeout<T>(
    url: &str,
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout {
            url: url.to_string(),
            seconds: timeout.as_secs(),
        }),
    }
}

// =============================================================================
// Local Filesystem Adapter
// =============================================================================

/// Endpoint backed by a local directory.
pub struct FileEndpoint {
    url: String,
    root: PathBuf,
}

impl FileEndpoint {
    pub fn new(url: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            root: root.into(),
        }
    }
}

#[async_trait]
impl Endpoint for FileEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    async fn open(&self, name: &str, mode: OpenMode) -> Result<Arc<dyn EndpointFile>> {
        let path = self.root.join(name);
        let url = self.url.clone();
        let file = task::spawn_blocking(move || -> io::Result<std::fs::File> {
            let mut opts = std::fs::OpenOptions::new();
            match mode {
                OpenMode::CreateNew => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    opts.read(true).write(true).create_new(true)
                }
                OpenMode::Read => opts.read(true),
                OpenMode::Update => opts.read(true).write(true),
            };
            opts.open(&path)
        })
        .await
        .map_err(|e| Error::Internal(format!("open task panicked: {e}")))?
        .map_err(|e| Error::endpoint(&url, format!("open {name}: {e}")))?;

        Ok(Arc::new(FileEndpointFile {
            url: self.url.clone(),
            name: name.to_string(),
            attrs_path: self.root.join(format!("{name}.attrs")),
            file: Arc::new(file),
        }))
    }
}

/// Open file on a [`FileEndpoint`]. Positional I/O runs on the blocking
/// pool; extended attributes live in a JSON sidecar next to the file.
pub struct FileEndpointFile {
    url: String,
    name: String,
    attrs_path: PathBuf,
    file: Arc<std::fs::File>,
}

impl FileEndpointFile {
    fn ep_err(&self, op: &str, e: impl std::fmt::Display) -> Error {
        Error::endpoint(&self.url, format!("{op} {}: {e}", self.name))
    }

    fn load_attrs(path: &Path) -> io::Result<HashMap<String, String>> {
        match std::fs::read(path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl EndpointFile for FileEndpointFile {
    async fn size(&self) -> Result<u64> {
        let file = Arc::clone(&self.file);
        task::spawn_blocking(move || file.metadata().map(|m| m.len()))
            .await
            .map_err(|e| Error::Internal(format!("stat task panicked: {e}")))?
            .map_err(|e| self.ep_err("stat", e))
    }

    async fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        let file = Arc::clone(&self.file);
        let data = task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut buf = vec![0u8; len];
            file.read_exact_at(&mut buf, offset)?;
            Ok(buf)
        })
        .await
        .map_err(|e| Error::Internal(format!("read task panicked: {e}")))?
        .map_err(|e| self.ep_err("read", e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, offset: u64, data: Bytes) -> Result<()> {
        let file = Arc::clone(&self.file);
        task::spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(|e| Error::Internal(format!("write task panicked: {e}")))?
            .map_err(|e| self.ep_err("write", e))
    }

    async fn truncate(&self, len: u64) -> Result<()> {
        let file = Arc::clone(&self.file);
        task::spawn_blocking(move || file.set_len(len))
            .await
            .map_err(|e| Error::Internal(format!("truncate task panicked: {e}")))?
            .map_err(|e| self.ep_err("truncate", e))
    }

    async fn get_attr(&self, name: &str) -> Result<Option<String>> {
        let path = self.attrs_path.clone();
        let name = name.to_string();
        task::spawn_blocking(move || Self::load_attrs(&path).map(|a| a.get(&name).cloned()))
            .await
            .map_err(|e| Error::Internal(format!("attr task panicked: {e}")))?
            .map_err(|e| self.ep_err("get_attr", e))
    }

    async fn set_attr(&self, name: &str, value: &str) -> Result<()> {
        let path = self.attrs_path.clone();
        let name = name.to_string();
        let value = value.to_string();
        task::spawn_blocking(move || -> io::Result<()> {
            let mut attrs = Self::load_attrs(&path)?;
            attrs.insert(name, value);
            let raw = serde_json::to_vec(&attrs)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            std::fs::write(&path, raw)
        })
        .await
        .map_err(|e| Error::Internal(format!("attr task panicked: {e}")))?
        .map_err(|e| self.ep_err("set_attr", e))
    }

    async fn close(&self) -> Result<()> {
        let file = Arc::clone(&self.file);
        task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(|e| Error::Internal(format!("close task panicked: {e}")))?
            .map_err(|e| self.ep_err("close", e))
    }
}

/// Provider mapping every placement url to a directory under one base path.
pub struct FileEndpointProvider {
    base: PathBuf,
}

impl FileEndpointProvider {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl EndpointProvider for FileEndpointProvider {
    fn resolve(&self, url: &str) -> Arc<dyn Endpoint> {
        Arc::new(FileEndpoint::new(url, self.base.join(url)))
    }
}

// =============================================================================
// Tests
// =============================================================================

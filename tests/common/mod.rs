//! Shared helpers for the integration suites: object setup over file-backed
//! endpoints, archive surgery for corruption injection, and instrumented
//! endpoint wrappers.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use stripestor::archive::{parse_directory, EndOfCentralDirectory, LocalFileHeader};
use stripestor::endpoint::{
    Endpoint, EndpointFile, EndpointProvider, FileEndpointProvider, OpenMode,
};
use stripestor::error::{Error, Result};
use stripestor::{ObjectConfig, StreamWriter};

pub fn fill_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn small_cfg(name: &str) -> Arc<ObjectConfig> {
    let placement = (0..6).map(|i| format!("ep-{i}")).collect();
    Arc::new(ObjectConfig::new(name, placement, 64, 4, 6).unwrap())
}

pub async fn write_object(cfg: &Arc<ObjectConfig>, provider: &dyn EndpointProvider, data: &[u8]) {
    let mut writer = StreamWriter::open(Arc::clone(cfg), provider).await.unwrap();
    writer.write(data).unwrap();
    assert_eq!(writer.close().await.unwrap(), data.len() as u64);
}

/// Flip one payload byte of the named stripe inside an endpoint's data
/// archive, locating it through the archive's own trailing directory.
pub fn corrupt_stripe(base: &Path, url: &str, cfg: &ObjectConfig, stripe_name: &str) {
    let path = base.join(url).join(cfg.data_archive_name());
    let mut raw = std::fs::read(&path).unwrap();

    let eocd =
        EndOfCentralDirectory::decode(&raw[raw.len() - EndOfCentralDirectory::SIZE..]).unwrap();
    let cd = &raw[eocd.cd_offset as usize..(eocd.cd_offset + eocd.cd_size) as usize];
    let entry = parse_directory(cd)
        .unwrap()
        .into_iter()
        .find(|e| e.name == stripe_name)
        .unwrap_or_else(|| panic!("stripe {stripe_name} not found in {url}"));

    let payload_at =
        entry.cdh.lfh_offset as usize + LocalFileHeader::SIZE + entry.cdh.name_len as usize;
    raw[payload_at] ^= 0xff;
    std::fs::write(&path, raw).unwrap();
}

// =============================================================================
// Failure Injection
// =============================================================================

/// Provider that makes writes against selected endpoints fail after a
/// per-endpoint budget of successful writes.
pub struct FailingProvider {
    inner: FileEndpointProvider,
    rules: Arc<Vec<(String, AtomicUsize)>>,
}

impl FailingProvider {
    /// `rules`: (endpoint url, number of writes that still succeed).
    pub fn new(base: impl Into<std::path::PathBuf>, rules: Vec<(String, usize)>) -> Self {
        Self {
            inner: FileEndpointProvider::new(base),
            rules: Arc::new(
                rules
                    .into_iter()
                    .map(|(url, n)| (url, AtomicUsize::new(n)))
                    .collect(),
            ),
        }
    }
}

impl EndpointProvider for FailingProvider {
    fn resolve(&self, url: &str) -> Arc<dyn Endpoint> {
        Arc::new(FailingEndpoint {
            inner: self.inner.resolve(url),
            url: url.to_string(),
            rules: Arc::clone(&self.rules),
        })
    }
}

struct FailingEndpoint {
    inner: Arc<dyn Endpoint>,
    url: String,
    rules: Arc<Vec<(String, AtomicUsize)>>,
}

#[async_trait]
impl Endpoint for FailingEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    async fn open(&self, name: &str, mode: OpenMode) -> Result<Arc<dyn EndpointFile>> {
        let file = self.inner.open(name, mode).await?;
        Ok(Arc::new(FailingFile {
            inner: file,
            url: self.url.clone(),
            rules: Arc::clone(&self.rules),
        }))
    }
}

struct FailingFile {
    inner: Arc<dyn EndpointFile>,
    url: String,
    rules: Arc<Vec<(String, AtomicUsize)>>,
}

#[async_trait]
impl EndpointFile for FailingFile {
    async fn size(&self) -> Result<u64> {
        self.inner.size().await
    }

    async fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        self.inner.read(offset, len).await
    }

    async fn write(&self, offset: u64, data: Bytes) -> Result<()> {
        if let Some((_, budget)) = self.rules.iter().find(|(url, _)| *url == self.url) {
            let allowed = budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !allowed {
                return Err(Error::endpoint(&self.url, "injected write failure"));
            }
        }
        self.inner.write(offset, data).await
    }

    async fn truncate(&self, len: u64) -> Result<()> {
        self.inner.truncate(len).await
    }

    async fn get_attr(&self, name: &str) -> Result<Option<String>> {
        self.inner.get_attr(name).await
    }

    async fn set_attr(&self, name: &str, value: &str) -> Result<()> {
        self.inner.set_attr(name, value).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

// =============================================================================
// Read Instrumentation
// =============================================================================

/// High-water mark of concurrently in-flight stripe reads.
#[derive(Debug, Default)]
pub struct ReadGauge {
    current: AtomicIsize,
    max: AtomicIsize,
}

impl ReadGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> isize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Provider counting concurrently allocated read buffers across all
/// endpoints.
pub struct CountingProvider {
    inner: FileEndpointProvider,
    pub gauge: Arc<ReadGauge>,
}

impl CountingProvider {
    pub fn new(base: impl Into<std::path::PathBuf>) -> Self {
        Self {
            inner: FileEndpointProvider::new(base),
            gauge: Arc::new(ReadGauge::default()),
        }
    }
}

impl EndpointProvider for CountingProvider {
    fn resolve(&self, url: &str) -> Arc<dyn Endpoint> {
        Arc::new(CountingEndpoint {
            inner: self.inner.resolve(url),
            url: url.to_string(),
            gauge: Arc::clone(&self.gauge),
        })
    }
}

struct CountingEndpoint {
    inner: Arc<dyn Endpoint>,
    url: String,
    gauge: Arc<ReadGauge>,
}

#[async_trait]
impl Endpoint for CountingEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    async fn open(&self, name: &str, mode: OpenMode) -> Result<Arc<dyn EndpointFile>> {
        let file = self.inner.open(name, mode).await?;
        Ok(Arc::new(CountingFile {
            inner: file,
            gauge: Arc::clone(&self.gauge),
        }))
    }
}

struct CountingFile {
    inner: Arc<dyn EndpointFile>,
    gauge: Arc<ReadGauge>,
}

#[async_trait]
impl EndpointFile for CountingFile {
    async fn size(&self) -> Result<u64> {
        self.inner.size().await
    }

    async fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        self.gauge.enter();
        let result = self.inner.read(offset, len).await;
        self.gauge.exit();
        result
    }

    async fn write(&self, offset: u64, data: Bytes) -> Result<()> {
        self.inner.write(offset, data).await
    }

    async fn truncate(&self, len: u64) -> Result<()> {
        self.inner.truncate(len).await
    }

    async fn get_attr(&self, name: &str) -> Result<Option<String>> {
        self.inner.get_attr(name).await
    }

    async fn set_attr(&self, name: &str, value: &str) -> Result<()> {
        self.inner.set_attr(name, value).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

//! Two-tier image cache: a bounded LRU in memory over one file per key on disk.
//!
//! Disk is the durable copy and is never evicted. Memory is rebuilt from disk
//! on demand, so losing it only costs a read. Every write is best-effort: a
//! failing disk degrades to "not cached" and never reaches the caller.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::CacheLimits;

const FILE_EXTENSION: &str = "img";

/// SHA-256 fingerprint of a request: prompt plus optional input image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(prompt: &str, input_image: Option<&[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"prompt");
        hasher.update((prompt.len() as u64).to_be_bytes());
        hasher.update(prompt.as_bytes());
        if let Some(image) = input_image {
            hasher.update(b"image");
            hasher.update((image.len() as u64).to_be_bytes());
            hasher.update(image);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn file_name(&self) -> String {
        format!("{}.{FILE_EXTENSION}", self.0)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What happened to a write. Only used for logging and tests.
#[derive(Debug)]
pub enum StoreOutcome {
    Stored,
    /// Kept in memory, but the disk copy could not be written.
    MemoryOnly(io::Error),
}

struct MemoryTier {
    entries: LruCache<CacheKey, Vec<u8>>,
    cost: usize,
    limits: CacheLimits,
}

impl MemoryTier {
    fn new(limits: CacheLimits) -> Self {
        Self {
            entries: LruCache::unbounded(),
            cost: 0,
            limits,
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: CacheKey, bytes: Vec<u8>) {
        if let Some(previous) = self.entries.pop(&key) {
            self.cost -= previous.len();
        }
        if bytes.len() > self.limits.max_bytes || self.limits.max_entries == 0 {
            debug!(key = %key, bytes = bytes.len(), "entry exceeds memory tier bounds; disk only");
            return;
        }
        self.cost += bytes.len();
        self.entries.put(key, bytes);
        self.evict();
    }

    fn evict(&mut self) {
        while self.entries.len() > self.limits.max_entries || self.cost > self.limits.max_bytes {
            let Some((key, bytes)) = self.entries.pop_lru() else {
                break;
            };
            self.cost -= bytes.len();
            debug!(key = %key, bytes = bytes.len(), "evicted from memory tier");
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.cost = 0;
    }
}

pub struct ImageCache {
    dir: PathBuf,
    memory: Mutex<MemoryTier>,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl ImageCache {
    /// Opens (and creates, if needed) the cache directory.
    pub fn open(dir: impl Into<PathBuf>, limits: CacheLimits) -> Self {
        let dir = dir.into();
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %err, "cache directory unavailable; disk tier disabled until writable");
        }
        Self {
            dir,
            memory: Mutex::new(MemoryTier::new(limits)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lookup(&self, prompt: &str, input_image: Option<&[u8]>) -> Option<Vec<u8>> {
        self.lookup_key(&CacheKey::new(prompt, input_image))
    }

    pub fn lookup_key(&self, key: &CacheKey) -> Option<Vec<u8>> {
        if let Some(bytes) = self.memory().get(key) {
            debug!(key = %key, "memory tier hit");
            return Some(bytes);
        }

        let path = self.dir.join(key.file_name());
        match fs::read(&path) {
            Ok(bytes) => {
                debug!(key = %key, bytes = bytes.len(), "disk tier hit; promoting to memory");
                self.memory().put(key.clone(), bytes.clone());
                Some(bytes)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cache read failed; treating as miss");
                None
            }
        }
    }

    pub fn store(&self, prompt: &str, input_image: Option<&[u8]>, image_bytes: &[u8]) {
        let key = CacheKey::new(prompt, input_image);
        if let StoreOutcome::MemoryOnly(err) = self.store_key(&key, image_bytes) {
            warn!(key = %key, error = %err, "cache disk write failed; result kept in memory only");
        }
    }

    pub fn store_key(&self, key: &CacheKey, image_bytes: &[u8]) -> StoreOutcome {
        self.memory().put(key.clone(), image_bytes.to_vec());
        match self.write_file(key, image_bytes) {
            Ok(()) => StoreOutcome::Stored,
            Err(err) => StoreOutcome::MemoryOnly(err),
        }
    }

    /// Drops both tiers and leaves an empty, usable directory behind.
    pub fn clear(&self) {
        self.memory().clear();
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(dir = %self.dir.display(), error = %err, "cache directory removal failed"),
        }
        if let Err(err) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %err, "cache directory recreation failed");
        }
    }

    /// Bytes used on disk. Files vanishing mid-scan are skipped.
    pub fn size(&self) -> u64 {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.metadata().ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum()
    }

    pub fn memory_len(&self) -> usize {
        self.memory().entries.len()
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory().cost
    }

    fn write_file(&self, key: &CacheKey, image_bytes: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(key.file_name());
        let staging = self.dir.join(format!("{}.tmp", key.file_name()));
        fs::write(&staging, image_bytes)?;
        fs::rename(&staging, &path).inspect_err(|_| {
            let _ = fs::remove_file(&staging);
        })
    }

    fn memory(&self) -> MutexGuard<'_, MemoryTier> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

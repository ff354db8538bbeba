//! Two-tier translation cache.
//! L1: in-memory LRU of hot entries, bounded only to cap memory.
//! L2: SQLite, the durable source of truth; nothing is ever evicted from it.
//! Key: blake3 digest of the normalized source text.

use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::sqlite_cache::{CacheError, SqliteCache, StoreOutcome};

pub const DEFAULT_L1_CAPACITY: usize = 512;

pub struct TranslationCache {
    l1: Mutex<LruCache<[u8; 32], String>>,
    l2: SqliteCache,
}

impl TranslationCache {
    pub fn new(l2: SqliteCache, l1_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(l1_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            l1: Mutex::new(LruCache::new(capacity)),
            l2,
        }
    }

    pub fn open(db_path: &Path, l1_capacity: usize) -> Result<Self, CacheError> {
        Ok(Self::new(SqliteCache::open(db_path)?, l1_capacity))
    }

    /// Open the durable cache, degrading to an in-memory database when the
    /// file cannot be opened.
    pub fn open_or_memory(db_path: &Path, l1_capacity: usize) -> Result<Self, CacheError> {
        match SqliteCache::open(db_path) {
            Ok(l2) => Ok(Self::new(l2, l1_capacity)),
            Err(e) => {
                warn!(path = %db_path.display(), error = %e, "cache file unavailable, using in-memory cache");
                Ok(Self::new(SqliteCache::open_in_memory()?, l1_capacity))
            }
        }
    }

    pub fn compute_key(normalized_text: &str) -> [u8; 32] {
        *blake3::hash(normalized_text.as_bytes()).as_bytes()
    }

    /// Look up a translation. Never touches the network; a storage error is
    /// logged and treated as a miss.
    pub fn lookup(&self, normalized_text: &str) -> Option<String> {
        let key = Self::compute_key(normalized_text);
        if let Some(hit) = self.l1.lock().get(&key) {
            return Some(hit.clone());
        }
        match self.l2.get(&key) {
            Ok(Some(translation)) => {
                debug!("L2 cache hit");
                self.l1.lock().put(key, translation.clone());
                Some(translation)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "cache lookup failed");
                None
            }
        }
    }

    /// Durably store a translation. The first value written for a key wins;
    /// a conflicting value is reported, not stored. On error nothing is
    /// cached, so the key stays unresolved.
    pub fn store(&self, normalized_text: &str, translation: &str) -> Result<StoreOutcome, CacheError> {
        if translation.trim().is_empty() {
            return Ok(StoreOutcome::SkippedEmpty);
        }
        let key = Self::compute_key(normalized_text);
        let outcome = self.l2.insert(&key, normalized_text, translation)?;
        let resolved = match &outcome {
            StoreOutcome::Conflict { existing } => {
                warn!(
                    key_len = normalized_text.len(),
                    "conflicting cache write rejected, keeping first value"
                );
                existing.clone()
            }
            _ => translation.to_string(),
        };
        self.l1.lock().put(key, resolved);
        Ok(outcome)
    }

    /// Number of durable entries.
    pub fn len(&self) -> usize {
        self.l2.len().unwrap_or_else(|e| {
            warn!(error = %e, "cache count failed");
            0
        })
    }

    pub fn is_empty(&self) -> bool {
        self.l2.is_empty().unwrap_or_else(|e| {
            warn!(error = %e, "cache count failed");
            true
        })
    }
}

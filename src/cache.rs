use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::types::{OutputSpec, ProcessedImage, ProcessingMode, SourceImage, TargetSize};

/// Identity of a processing request: same file, model and output -> same result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub file_name: String,
    pub size: u64,
    pub last_modified: Option<i64>,
    pub model: String,
    pub target: Option<TargetSize>,
    pub mode: Option<ProcessingMode>,
}

impl CacheKey {
    pub fn new(source: &SourceImage, model: &str, spec: &OutputSpec) -> Self {
        Self {
            file_name: source.name.clone(),
            size: source.size,
            last_modified: source.last_modified,
            model: model.to_string(),
            target: spec.target,
            mode: spec.mode,
        }
    }
}

/// Memoized results, bounded with least-recently-used eviction.
pub struct ResultCache {
    entries: Mutex<LruCache<CacheKey, ProcessedImage>>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("len", &self.len())
            .finish()
    }
}

impl ResultCache {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<ProcessedImage> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    pub fn insert(&self, key: CacheKey, value: ProcessedImage) {
        match self.entries.lock() {
            Ok(mut entries) => {
                entries.put(key, value);
            }
            Err(e) => {
                tracing::warn!("Result cache mutex poisoned: {}", e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

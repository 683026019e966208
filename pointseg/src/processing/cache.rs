//! Single-entry cache for the most recent image encoding

use crate::models::EmbeddingBundle;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Identity of an image: SHA-256 of its encoded bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageId(String);

impl ImageId {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        ImageId(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough for logs
        write!(f, "{}", &self.0[..self.0.len().min(12)])
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Holds at most one embedding bundle
#[derive(Default)]
pub struct EmbeddingCache {
    entry: Option<(ImageId, Arc<EmbeddingBundle>)>,
    stats: CacheStats,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle for `id`, if it is the cached image
    pub fn get(&mut self, id: &ImageId) -> Option<Arc<EmbeddingBundle>> {
        match &self.entry {
            Some((cached, bundle)) if cached == id => {
                self.stats.hits += 1;
                debug!("Embedding cache hit for image {}", id);
                Some(bundle.clone())
            }
            _ => {
                self.stats.misses += 1;
                debug!("Embedding cache miss for image {}", id);
                None
            }
        }
    }

    /// Store a bundle, evicting whatever was cached
    pub fn set(&mut self, id: ImageId, bundle: Arc<EmbeddingBundle>) {
        self.entry = Some((id, bundle));
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    pub fn cached_id(&self) -> Option<&ImageId> {
        self.entry.as_ref().map(|(id, _)| id)
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

//! Cache key for persisted frames

use std::fmt;

/// Identifies one frame of one stream origin in the frame cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// Stream origin (the address the session connects to)
    pub origin: String,

    /// Logical frame index within that origin
    pub index: u64,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(origin: impl Into<String>, index: u64) -> Self {
        Self { origin: origin.into(), index }
    }

    /// Flat string form used by string-keyed stores
    pub fn storage_key(&self) -> String {
        format!("{}#{}", self.origin, self.index)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_combines_origin_and_index() {
        let key = CacheKey::new("http://127.0.0.1:8080/stream", 42);
        assert_eq!(key.storage_key(), "http://127.0.0.1:8080/stream#42");
        assert_eq!(key.to_string(), key.storage_key());
    }

    #[test]
    fn different_origins_never_collide() {
        let a = CacheKey::new("http://a/stream", 7);
        let b = CacheKey::new("http://b/stream", 7);
        assert_ne!(a, b);
        assert_ne!(a.storage_key(), b.storage_key());
    }
}

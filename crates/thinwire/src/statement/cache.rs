//! Per-session LRU cache of parsed server cursors, keyed by SQL text.
//!
//! Closing a statement parks its server cursor here; the next `prepare` of
//! the same SQL takes it back and skips the parse. Evicted cursors must be
//! closed on the server by the caller.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::codec::{BindDescriptor, ColumnInfo};

/// A parsed server cursor waiting for reuse.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CachedCursor {
    pub cursor_id: u32,
    pub columns: Option<Vec<ColumnInfo>>,
    pub binds: Vec<BindDescriptor>,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub capacity: usize,
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStatistics {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
pub(crate) struct StatementCache {
    // `None` when caching is disabled.
    cache: Option<LruCache<String, CachedCursor>>,
    hits: u64,
    misses: u64,
}

impl StatementCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            cache: NonZeroUsize::new(capacity).map(LruCache::new),
            hits: 0,
            misses: 0,
        }
    }

    /// Remove and return the cursor parsed for `sql`.
    pub(crate) fn take(&mut self, sql: &str) -> Option<CachedCursor> {
        let cache = self.cache.as_mut()?;
        let found = cache.pop(sql);
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    /// Park a cursor. Returns the id of a cursor that no longer fits (the
    /// evicted one, a replaced duplicate, or `cursor` itself when caching is
    /// disabled); the caller must close it on the server.
    pub(crate) fn put(&mut self, sql: String, cursor: CachedCursor) -> Option<u32> {
        let Some(cache) = self.cache.as_mut() else {
            return Some(cursor.cursor_id);
        };
        cache.push(sql, cursor).map(|(_, evicted)| evicted.cursor_id)
    }

    pub(crate) fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            capacity: self.cache.as_ref().map_or(0, |c| c.cap().get()),
            len: self.cache.as_ref().map_or(0, LruCache::len),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(id: u32) -> CachedCursor {
        CachedCursor {
            cursor_id: id,
            columns: None,
            binds: Vec::new(),
        }
    }

    #[test]
    fn test_take_after_put() {
        let mut cache = StatementCache::new(2);
        assert!(cache.take("SELECT 1 FROM dual").is_none());
        assert_eq!(cache.put("SELECT 1 FROM dual".into(), cursor(7)), None);
        assert_eq!(cache.take("SELECT 1 FROM dual").unwrap().cursor_id, 7);
        assert!(cache.take("SELECT 1 FROM dual").is_none());

        let stats = cache.statistics();
        assert_eq!((stats.hits, stats.misses), (1, 2));
        assert!((stats.hit_rate() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_eviction_returns_lru_cursor() {
        let mut cache = StatementCache::new(2);
        cache.put("a".into(), cursor(1));
        cache.put("b".into(), cursor(2));
        assert_eq!(cache.put("c".into(), cursor(3)), Some(1));
        assert_eq!(cache.statistics().len, 2);
    }

    #[test]
    fn test_duplicate_sql_returns_replaced_cursor() {
        let mut cache = StatementCache::new(4);
        cache.put("a".into(), cursor(1));
        assert_eq!(cache.put("a".into(), cursor(2)), Some(1));
        assert_eq!(cache.take("a").unwrap().cursor_id, 2);
    }

    #[test]
    fn test_disabled_cache() {
        let mut cache = StatementCache::new(0);
        assert_eq!(cache.put("a".into(), cursor(5)), Some(5));
        assert!(cache.take("a").is_none());
        assert_eq!(cache.statistics(), CacheStatistics::default());
    }
}

use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::CompileError;
use crate::template::{RenderRoutine, TemplateCompiler};

/// Routines kept when no capacity is configured.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// In-memory cache of compiled render routines keyed by a hash of the markup.
/// Only successful compiles are stored. Entries are kept in recency order and
/// the least recently used one is evicted once `capacity` is reached.
#[derive(Debug)]
pub struct RenderCache {
    entries: IndexMap<String, RenderRoutine>,
    capacity: usize,
}

impl Default for RenderCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl RenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A capacity of 0 stores nothing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            capacity,
        }
    }

    pub fn compute_hash(source: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Looks up a routine without refreshing its recency.
    pub fn get(&self, markup: &str) -> Option<RenderRoutine> {
        self.entries.get(&Self::compute_hash(markup)).cloned()
    }

    pub fn get_or_compile(
        &mut self,
        markup: &str,
        compiler: &dyn TemplateCompiler,
    ) -> Result<RenderRoutine, CompileError> {
        let hash = Self::compute_hash(markup);
        if let Some(routine) = self.entries.shift_remove(&hash) {
            debug!(hash = &hash[..12], "render routine cache hit");
            self.entries.insert(hash, routine.clone());
            return Ok(routine);
        }
        let routine = compiler.compile(markup)?;
        if self.capacity == 0 {
            return Ok(routine);
        }
        while self.entries.len() >= self.capacity {
            if let Some((evicted, _)) = self.entries.shift_remove_index(0) {
                debug!(hash = &evicted[..12], "evicted render routine");
            }
        }
        self.entries.insert(hash, routine.clone());
        Ok(routine)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{HtmlTemplateCompiler, RenderProgram};
    use std::cell::Cell;

    struct CountingCompiler(Cell<usize>);

    impl TemplateCompiler for CountingCompiler {
        fn compile(&self, markup: &str) -> Result<RenderRoutine, CompileError> {
            self.0.set(self.0.get() + 1);
            if markup.is_empty() {
                return Err(CompileError::template("empty"));
            }
            Ok(RenderRoutine::new(RenderProgram::default()))
        }
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let hash = RenderCache::compute_hash("<div></div>");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, RenderCache::compute_hash("<div></div>"));
        assert_ne!(hash, RenderCache::compute_hash("<div> </div>"));
    }

    #[test]
    fn test_reuses_compiled_routines() {
        let compiler = CountingCompiler(Cell::new(0));
        let mut cache = RenderCache::new();
        cache.get_or_compile("<p></p>", &compiler).unwrap();
        cache.get_or_compile("<p></p>", &compiler).unwrap();
        assert_eq!(compiler.0.get(), 1);
        assert_eq!(cache.len(), 1);

        assert!(cache.get_or_compile("", &compiler).is_err());
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let compiler = CountingCompiler(Cell::new(0));
        let mut cache = RenderCache::with_capacity(2);
        cache.get_or_compile("<a></a>", &compiler).unwrap();
        cache.get_or_compile("<b></b>", &compiler).unwrap();
        cache.get_or_compile("<a></a>", &compiler).unwrap();
        cache.get_or_compile("<c></c>", &compiler).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.get("<a></a>").is_some());
        assert!(cache.get("<b></b>").is_none());
        assert!(cache.get("<c></c>").is_some());
        assert_eq!(compiler.0.get(), 3);
    }

    #[test]
    fn test_edits_do_not_grow_the_cache() {
        let compiler = CountingCompiler(Cell::new(0));
        let mut cache = RenderCache::new();
        for revision in 0..500 {
            cache
                .get_or_compile(&format!("<p>revision {}</p>", revision), &compiler)
                .unwrap();
        }
        assert_eq!(cache.len(), DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let compiler = CountingCompiler(Cell::new(0));
        let mut cache = RenderCache::with_capacity(0);
        cache.get_or_compile("<p></p>", &compiler).unwrap();
        cache.get_or_compile("<p></p>", &compiler).unwrap();
        assert!(cache.is_empty());
        assert_eq!(compiler.0.get(), 2);
    }

    #[test]
    fn test_cached_routine_is_shared() {
        let mut cache = RenderCache::new();
        let first = cache.get_or_compile("<b></b>", &HtmlTemplateCompiler).unwrap();
        let second = cache.get("<b></b>").unwrap();
        assert!(std::ptr::eq(first.program(), second.program()));
    }
}

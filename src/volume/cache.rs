//! The volume page cache.
//!
//! Caches recently used volume pages keyed by physical page number. Entries
//! are admitted to a small probationary queue and promoted to the main
//! queue once re-referenced; entries evicted from the probationary queue
//! before a second access leave a ghost key behind so that a quick return
//! is admitted straight to the main queue. Eviction decrements a small
//! per-entry frequency counter and gives frequently hit pages another lap.
//!
//! Chapter rotation invalidates whole chapters at a time
//! ([`PageCache::forget_chapter_pages`]); the queues are cleaned lazily, so
//! invalidation is cheap.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;

use crate::delta_index::page::DeltaIndexPage;

/// Maximum frequency credit for an entry.
const MAX_FREQUENCY: u8 = 3;

/// A decoded page resident in the cache.
pub enum CachedPage {
    /// A chapter index page, decoded and verified.
    Index(DeltaIndexPage),
    /// A raw record page.
    Record(Vec<u8>),
}

struct Entry {
    page: Arc<CachedPage>,
    freq: u8,
}

/// Cache hit/miss counters, exposed through the index statistics.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

pub struct PageCache {
    max_cache_size: usize,
    max_main_size: usize,
    /// New entries are added to this queue.
    small: VecDeque<u32>,
    /// Entries that have been accessed again are moved to this queue.
    main: VecDeque<u32>,
    /// Keys evicted from small before a second access.
    ghost: VecDeque<u32>,
    entries: HashMap<u32, Entry>,
    stats: CacheStats,
}

impl PageCache {
    pub fn new(max_cache_size: usize) -> Self {
        let max_small_size = (max_cache_size / 10).max(1);
        PageCache {
            max_cache_size,
            max_main_size: max_cache_size - max_small_size,
            small: VecDeque::new(),
            main: VecDeque::new(),
            ghost: VecDeque::new(),
            entries: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Look up a page by physical page number.
    pub fn get(&mut self, physical_page: u32) -> Option<Arc<CachedPage>> {
        if let Some(entry) = self.entries.get_mut(&physical_page) {
            entry.freq = (entry.freq + 1).min(MAX_FREQUENCY);
            self.stats.hits += 1;
            Some(entry.page.clone())
        } else {
            self.stats.misses += 1;
            None
        }
    }

    /// Insert a page. An existing entry for the page is replaced.
    pub fn insert(&mut self, physical_page: u32, page: Arc<CachedPage>) {
        if let Some(entry) = self.entries.get_mut(&physical_page) {
            entry.page = page;
            return;
        }
        self.evict();
        let was_ghost = self.ghost.contains(&physical_page);
        self.entries.insert(physical_page, Entry { page, freq: 0 });
        if was_ghost {
            self.main.push_back(physical_page);
        } else {
            self.small.push_back(physical_page);
        }
    }

    /// Drop every cached page of a physical chapter.
    pub fn forget_chapter_pages(&mut self, first_page: u32, page_count: u32) {
        for page in first_page..first_page + page_count {
            if self.entries.remove(&page).is_some() {
                self.stats.invalidations += 1;
            }
        }
        // Queue entries for removed keys are skipped lazily by evict.
    }

    fn live_len(&self) -> usize {
        self.entries.len()
    }

    fn evict(&mut self) {
        while self.live_len() >= self.max_cache_size {
            let main_live = self
                .main
                .iter()
                .filter(|key| self.entries.contains_key(*key))
                .count();
            if main_live >= self.max_main_size || self.small.is_empty() {
                if !self.evict_main() {
                    break;
                }
            } else if !self.evict_small() {
                break;
            }
        }
    }

    /// Evict one entry from the main queue, giving recently hit pages
    /// another lap. Returns false when nothing could be evicted.
    fn evict_main(&mut self) -> bool {
        let mut budget = self.main.len();
        while let Some(key) = self.main.pop_front() {
            let Some(entry) = self.entries.get_mut(&key) else {
                // Stale key from an invalidation; drop it.
                continue;
            };
            if entry.freq > 0 && budget > 0 {
                entry.freq -= 1;
                self.main.push_back(key);
                budget -= 1;
                continue;
            }
            self.entries.remove(&key);
            return true;
        }
        false
    }

    /// Evict one entry from the probationary queue, promoting re-referenced
    /// pages to main instead.
    fn evict_small(&mut self) -> bool {
        while let Some(key) = self.small.pop_front() {
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            if entry.freq > 1 {
                self.main.push_back(key);
                continue;
            }
            self.entries.remove(&key);
            self.push_ghost(key);
            return true;
        }
        false
    }

    fn push_ghost(&mut self, key: u32) {
        if self.ghost.len() >= self.max_cache_size {
            self.ghost.pop_front();
        }
        self.ghost.push_back(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_page(byte: u8) -> Arc<CachedPage> {
        Arc::new(CachedPage::Record(vec![byte; 64]))
    }

    fn page_byte(page: &CachedPage) -> u8 {
        match page {
            CachedPage::Record(data) => data[0],
            CachedPage::Index(_) => panic!("expected record page"),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let mut cache = PageCache::new(4);
        cache.insert(1, record_page(1));
        cache.insert(2, record_page(2));
        assert_eq!(page_byte(&cache.get(1).unwrap()), 1);
        assert_eq!(page_byte(&cache.get(2).unwrap()), 2);
        assert!(cache.get(3).is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_eviction_bounds_size() {
        let mut cache = PageCache::new(4);
        for page in 0..32u32 {
            cache.insert(page, record_page(page as u8));
        }
        assert!(cache.entries.len() <= 4);
        // The most recent insertion must still be resident.
        assert!(cache.get(31).is_some());
    }

    #[test]
    fn test_hot_pages_survive() {
        let mut cache = PageCache::new(8);
        cache.insert(100, record_page(0));
        for _ in 0..3 {
            cache.get(100);
        }
        for page in 0..32u32 {
            cache.insert(page, record_page(0));
            cache.get(page);
        }
        // 100 was hit repeatedly before the scan, so it should have been
        // promoted and survived the churn.
        assert!(cache.get(100).is_some());
    }

    #[test]
    fn test_forget_chapter_pages() {
        let mut cache = PageCache::new(16);
        for page in 0..10u32 {
            cache.insert(page, record_page(page as u8));
        }
        cache.forget_chapter_pages(2, 5);
        for page in 2..7u32 {
            assert!(cache.get(page).is_none(), "page {page} must be forgotten");
        }
        assert!(cache.get(0).is_some());
        assert!(cache.get(8).is_some());
        assert_eq!(cache.stats().invalidations, 5);
        // The cache must keep functioning with stale queue keys present.
        for page in 20..40u32 {
            cache.insert(page, record_page(0));
        }
        assert!(cache.get(39).is_some());
    }

    #[test]
    fn test_replacing_existing_page() {
        let mut cache = PageCache::new(4);
        cache.insert(5, record_page(1));
        cache.insert(5, record_page(2));
        assert_eq!(page_byte(&cache.get(5).unwrap()), 2);
    }
}

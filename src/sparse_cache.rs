//! The sparse chapter index cache.
//!
//! A small LRU of decoded sparse-chapter indexes, shared by all zones and
//! keyed by virtual chapter number. The cache is small enough that lookup
//! is a linear scan and LRU order is an array shuffle.
//!
//! The important property is that the read path takes no per-page locks:
//! membership only changes inside [`SparseCache::update`], which every
//! zone calls via a barrier message before any request that needs the
//! chapter. Between two barriers for the same chapter, every zone observes
//! identical membership, so zone threads may search concurrently under a
//! shared lock while admission takes the exclusive one.
//!
//! A chapter that keeps missing searches is flagged `skip_search` and is
//! passed over by full-cache scans until a targeted (hook) probe hits it
//! again. Chapters that fall out of the volume window stay members until
//! evicted but are never searched.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tracing::debug;

use crate::chapter_index::search_chapter_index_page;
use crate::delta_index::page::DeltaIndexPage;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::name::ChunkName;
use crate::volume::cache::CachedPage;
use crate::volume::Volume;

/// Consecutive search misses after which a chapter is skipped by
/// full-cache scans.
const SKIP_SEARCH_THRESHOLD: u64 = 20_000;

struct CachedChapter {
    virtual_chapter: u64,
    index_pages: Vec<DeltaIndexPage>,
    skip_search: AtomicBool,
    consecutive_misses: AtomicU64,
}

impl CachedChapter {
    fn score_miss(&self) {
        if self.consecutive_misses.fetch_add(1, Ordering::Relaxed) + 1 >= SKIP_SEARCH_THRESHOLD {
            self.skip_search.store(true, Ordering::Relaxed);
        }
    }

    fn score_hit(&self) {
        self.consecutive_misses.store(0, Ordering::Relaxed);
        self.skip_search.store(false, Ordering::Relaxed);
    }
}

/// Sparse cache counters, exposed through the index statistics.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct SparseCacheStats {
    pub chapter_hits: u64,
    pub chapter_misses: u64,
    pub search_hits: u64,
    pub search_misses: u64,
    pub invalidations: u64,
    pub evictions: u64,
}

pub struct SparseCache {
    capacity: usize,
    /// Most-recently admitted first.
    chapters: Vec<CachedChapter>,
    search_hits: AtomicU64,
    search_misses: AtomicU64,
    chapter_hits: AtomicU64,
    chapter_misses: AtomicU64,
    invalidations: u64,
    evictions: u64,
}

impl SparseCache {
    pub fn new(capacity: usize) -> Self {
        SparseCache {
            capacity: capacity.max(1),
            chapters: Vec::new(),
            search_hits: AtomicU64::new(0),
            search_misses: AtomicU64::new(0),
            chapter_hits: AtomicU64::new(0),
            chapter_misses: AtomicU64::new(0),
            invalidations: 0,
            evictions: 0,
        }
    }

    pub fn stats(&self) -> SparseCacheStats {
        SparseCacheStats {
            chapter_hits: self.chapter_hits.load(Ordering::Relaxed),
            chapter_misses: self.chapter_misses.load(Ordering::Relaxed),
            search_hits: self.search_hits.load(Ordering::Relaxed),
            search_misses: self.search_misses.load(Ordering::Relaxed),
            invalidations: self.invalidations,
            evictions: self.evictions,
        }
    }

    /// Whether `virtual_chapter` is a cache member. Safe under the shared
    /// lock: membership is stable between barriers.
    pub fn contains(&self, virtual_chapter: u64) -> bool {
        let contained = self
            .chapters
            .iter()
            .any(|chapter| chapter.virtual_chapter == virtual_chapter);
        if contained {
            self.chapter_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.chapter_misses.fetch_add(1, Ordering::Relaxed);
        }
        contained
    }

    /// Admit `virtual_chapter`, reading and decoding its chapter index
    /// pages from the volume. Driven by barrier messages under the
    /// exclusive lock.
    pub fn update(&mut self, volume: &Volume, virtual_chapter: u64, oldest_vcn: u64) -> Result<()> {
        if let Some(position) = self
            .chapters
            .iter()
            .position(|chapter| chapter.virtual_chapter == virtual_chapter)
        {
            // Already cached; refresh its LRU position.
            let chapter = self.chapters.remove(position);
            self.chapters.insert(0, chapter);
            return Ok(());
        }

        let geometry = &volume.geometry;
        let chapter = geometry.physical_chapter(virtual_chapter);
        let mut index_pages = Vec::with_capacity(geometry.index_pages_per_chapter as usize);
        for index_page_number in 0..geometry.index_pages_per_chapter {
            let physical_page = geometry.physical_page(chapter, index_page_number);
            let page = volume.get_page_blocking(physical_page)?;
            match &*page {
                CachedPage::Index(index_page) => index_pages.push(index_page.clone()),
                CachedPage::Record(_) => {
                    return Err(Error::CorruptData(format!(
                        "page {physical_page} is not a chapter index page"
                    )))
                }
            }
        }

        while self.chapters.len() >= self.capacity {
            let Some(victim) = self.chapters.pop() else {
                break;
            };
            if victim.virtual_chapter < oldest_vcn {
                self.invalidations += 1;
            } else {
                self.evictions += 1;
            }
            debug!(
                chapter = victim.virtual_chapter,
                "sparse cache evicted chapter"
            );
        }
        self.chapters.insert(
            0,
            CachedChapter {
                virtual_chapter,
                index_pages,
                skip_search: AtomicBool::new(false),
                consecutive_misses: AtomicU64::new(0),
            },
        );
        debug!(chapter = virtual_chapter, "sparse cache admitted chapter");
        Ok(())
    }

    /// Search the cache for `name`. With `virtual_chapter` set, only that
    /// chapter is searched (a hook probe); otherwise every live,
    /// non-skipped chapter is. Returns the owning VCN and record page.
    pub fn search(
        &self,
        geometry: &Geometry,
        name: &ChunkName,
        virtual_chapter: Option<u64>,
        oldest_vcn: u64,
    ) -> Result<Option<(u64, u32)>> {
        for chapter in &self.chapters {
            // Chapters that fell off the volume stay members but are not
            // searchable.
            if chapter.virtual_chapter < oldest_vcn {
                continue;
            }
            match virtual_chapter {
                Some(vcn) if vcn != chapter.virtual_chapter => continue,
                None if chapter.skip_search.load(Ordering::Relaxed) => continue,
                _ => {}
            }

            let list = name.chapter_delta_list(geometry);
            for page in &chapter.index_pages {
                if list < page.lowest_list || list > page.highest_list {
                    continue;
                }
                if let Some(record_page) = search_chapter_index_page(page, geometry, name)? {
                    chapter.score_hit();
                    self.search_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some((chapter.virtual_chapter, record_page)));
                }
            }
            chapter.score_miss();
        }
        self.search_misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chapter_index::OpenChapterIndex;
    use crate::geometry::testing::small_sparse;
    use crate::record_page::ChunkRecord;
    use crate::region::Region;
    use std::sync::Arc;
    use tempfile::tempfile;

    fn test_volume(geometry: &Geometry) -> Volume {
        let file = tempfile().unwrap();
        file.set_len(geometry.bytes_per_volume).unwrap();
        let region = Region::new(Arc::new(file), 0, geometry.bytes_per_volume);
        Volume::new(region, geometry.clone(), 0x5eed, 64).unwrap()
    }

    fn write_chapter(volume: &Volume, virtual_chapter: u64) -> Vec<ChunkRecord> {
        let geometry = volume.geometry.clone();
        let records: Vec<ChunkRecord> = (0..geometry.records_per_chapter)
            .map(|i| {
                let mut name = ChunkName::new([0u8; 16]);
                name.set_chapter_index_bytes(virtual_chapter * 100_000 + i as u64 * 31);
                ChunkRecord::new(name, [i as u8; 16])
            })
            .collect();
        let mut chapter_index = OpenChapterIndex::new(&geometry, volume.nonce());
        chapter_index.empty(virtual_chapter);
        for (i, record) in records.iter().enumerate() {
            chapter_index
                .put_record(&geometry, &record.name, i as u32 / geometry.records_per_page)
                .unwrap();
        }
        volume.write_chapter(&mut chapter_index, &records).unwrap();
        records
    }

    #[test]
    fn test_admission_and_search() {
        let geometry = small_sparse();
        let volume = test_volume(&geometry);
        let records = write_chapter(&volume, 2);

        let mut cache = SparseCache::new(3);
        assert!(!cache.contains(2));
        cache.update(&volume, 2, 0).unwrap();
        assert!(cache.contains(2));

        let (vcn, record_page) = cache
            .search(&geometry, &records[5].name, Some(2), 0)
            .unwrap()
            .expect("record must be present in the cached chapter index");
        assert_eq!(vcn, 2);
        assert!(record_page < geometry.record_pages_per_chapter);

        // A full-cache search finds it too.
        assert!(cache
            .search(&geometry, &records[5].name, None, 0)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_lru_eviction() {
        let geometry = small_sparse();
        let volume = test_volume(&geometry);
        for vcn in 0..4u64 {
            write_chapter(&volume, vcn);
        }
        let mut cache = SparseCache::new(2);
        cache.update(&volume, 0, 0).unwrap();
        cache.update(&volume, 1, 0).unwrap();
        cache.update(&volume, 2, 0).unwrap();
        assert!(!cache.contains(0), "oldest entry must be evicted");
        assert!(cache.contains(1));
        assert!(cache.contains(2));
        assert_eq!(cache.stats().evictions, 1);

        // Re-admitting a member refreshes it instead of evicting.
        cache.update(&volume, 1, 0).unwrap();
        cache.update(&volume, 3, 0).unwrap();
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
    }

    #[test]
    fn test_expired_chapters_not_searched() {
        let geometry = small_sparse();
        let volume = test_volume(&geometry);
        let records = write_chapter(&volume, 1);

        let mut cache = SparseCache::new(2);
        cache.update(&volume, 1, 0).unwrap();
        // With the window advanced past chapter 1, the member must not be
        // searched even though it is still cached.
        assert!(cache
            .search(&geometry, &records[0].name, None, 5)
            .unwrap()
            .is_none());
        assert!(cache
            .search(&geometry, &records[0].name, None, 0)
            .unwrap()
            .is_some());
    }
}

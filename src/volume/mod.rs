//! The volume: circular on-disk storage of chapters, with cached reads.
//!
//! The volume region holds `chapters_per_volume` chapters back to back,
//! each `index_pages_per_chapter` chapter-index pages followed by
//! `record_pages_per_chapter` record pages. Pages are cached in a shared
//! [`PageCache`] keyed by physical page number.
//!
//! Reads for request processing never block a zone worker: on a cache miss
//! the request is parked with the background read pool
//! ([`PageProbe::Parked`]), the zone moves on, and the request is
//! re-enqueued to its zone's retry lane once the page is resident. Load
//! and rebuild use the blocking read path instead, since they own the
//! calling thread.

pub mod cache;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::chapter_index::{decode_chapter_index_page, search_chapter_index_page, OpenChapterIndex};
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::index_page_map::IndexPageMap;
use crate::name::ChunkData;
use crate::queue::ZoneQueues;
use crate::record_page::{encode_record_page, search_record_page, ChunkRecord};
use crate::region::Region;
use crate::request::Request;
use cache::{CacheStats, CachedPage, PageCache};

/// The outcome of a non-blocking page probe on behalf of a request.
pub enum PageProbe {
    /// The page was resident; the request continues.
    Ready(Box<Request>, Arc<CachedPage>),
    /// The request was handed to the read pool and will be re-enqueued.
    Parked,
    /// The read pool is shutting down; the caller owns the request again.
    Rejected(Box<Request>),
}

/// The outcome of a chapter search on behalf of a request.
pub enum VolumeSearch {
    /// The search completed; the metadata is present on a hit.
    Hit(Box<Request>, Option<ChunkData>),
    /// The request was parked pending a page read.
    Parked,
    /// The read pool is shutting down.
    Rejected(Box<Request>),
    /// The search failed; the caller owns the request and the error.
    Failed(Box<Request>, Error),
}

struct PageRead {
    physical_page: u32,
    waiters: Vec<Box<Request>>,
}

struct ReadState {
    pending: VecDeque<PageRead>,
    stop: bool,
}

struct ReadPool {
    state: Mutex<ReadState>,
    wakeup: Condvar,
}

pub struct Volume {
    pub geometry: Geometry,
    nonce: u64,
    region: Region,
    cache: Mutex<PageCache>,
    pub index_page_map: RwLock<IndexPageMap>,
    reads: ReadPool,
}

impl Volume {
    pub fn new(region: Region, geometry: Geometry, nonce: u64, cache_pages: usize) -> Result<Self> {
        if region.len() < geometry.bytes_per_volume {
            return Err(Error::OutOfRange(format!(
                "volume region of {} bytes cannot hold {} bytes of chapters",
                region.len(),
                geometry.bytes_per_volume
            )));
        }
        let index_page_map = IndexPageMap::new(&geometry);
        Ok(Volume {
            geometry,
            nonce,
            region,
            cache: Mutex::new(PageCache::new(cache_pages.max(2))),
            index_page_map: RwLock::new(index_page_map),
            reads: ReadPool {
                state: Mutex::new(ReadState {
                    pending: VecDeque::new(),
                    stop: false,
                }),
                wakeup: Condvar::new(),
            },
        })
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().unwrap().stats()
    }

    /// Start the background read threads. The handles are joined by the
    /// index on shutdown, after `stop_readers`.
    pub fn start_readers(
        volume: &Arc<Volume>,
        thread_count: usize,
        queues: Arc<ZoneQueues>,
    ) -> Vec<JoinHandle<()>> {
        (0..thread_count.max(1))
            .map(|_| {
                let volume = Arc::clone(volume);
                let queues = Arc::clone(&queues);
                std::thread::spawn(move || reader_loop(volume, queues))
            })
            .collect()
    }

    pub fn stop_readers(&self) {
        let mut state = self.reads.state.lock().unwrap();
        state.stop = true;
        self.reads.wakeup.notify_all();
    }

    fn page_bytes(&self) -> u64 {
        self.geometry.bytes_per_page as u64
    }

    fn read_page_data(&self, physical_page: u32) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.geometry.bytes_per_page];
        self.region
            .read_at(physical_page as u64 * self.page_bytes(), &mut data)?;
        Ok(data)
    }

    fn decode_page(&self, physical_page: u32, data: Vec<u8>) -> Result<CachedPage> {
        let page_in_chapter = physical_page % self.geometry.pages_per_chapter;
        if page_in_chapter < self.geometry.index_pages_per_chapter {
            let page = decode_chapter_index_page(data, &self.geometry, self.nonce)?;
            Ok(CachedPage::Index(page))
        } else {
            Ok(CachedPage::Record(data))
        }
    }

    fn read_and_cache(&self, physical_page: u32) -> Result<Arc<CachedPage>> {
        let data = self.read_page_data(physical_page)?;
        let page = Arc::new(self.decode_page(physical_page, data)?);
        self.cache
            .lock()
            .unwrap()
            .insert(physical_page, page.clone());
        Ok(page)
    }

    /// Fetch a page, reading it synchronously on a miss. The load and
    /// rebuild paths use this; zone workers use the probing variant.
    pub fn get_page_blocking(&self, physical_page: u32) -> Result<Arc<CachedPage>> {
        if let Some(page) = self.cache.lock().unwrap().get(physical_page) {
            return Ok(page);
        }
        self.read_and_cache(physical_page)
    }

    /// Fetch a page on behalf of a request without blocking: on a miss the
    /// request is parked with the read pool.
    pub fn probe_page(&self, physical_page: u32, request: Box<Request>) -> PageProbe {
        if let Some(page) = self.cache.lock().unwrap().get(physical_page) {
            return PageProbe::Ready(request, page);
        }
        let mut state = self.reads.state.lock().unwrap();
        if state.stop {
            return PageProbe::Rejected(request);
        }
        if let Some(read) = state
            .pending
            .iter_mut()
            .find(|read| read.physical_page == physical_page)
        {
            read.waiters.push(request);
        } else {
            state.pending.push_back(PageRead {
                physical_page,
                waiters: vec![request],
            });
            self.reads.wakeup.notify_one();
        }
        PageProbe::Parked
    }

    /// Search the cited chapter for the request's name: index page map →
    /// chapter index page → record page.
    pub fn search_for_request(&self, request: Box<Request>, virtual_chapter: u64) -> VolumeSearch {
        let chapter = self.geometry.physical_chapter(virtual_chapter);
        let index_page_number = self
            .index_page_map
            .read()
            .unwrap()
            .find_index_page(&self.geometry, chapter, &request.name);
        let physical_page = self.geometry.physical_page(chapter, index_page_number);

        let (request, page) = match self.probe_page(physical_page, request) {
            PageProbe::Ready(request, page) => (request, page),
            PageProbe::Parked => return VolumeSearch::Parked,
            PageProbe::Rejected(request) => return VolumeSearch::Rejected(request),
        };
        let CachedPage::Index(index_page) = &*page else {
            return VolumeSearch::Failed(
                request,
                crate::errdata!("page {physical_page} is not a chapter index page"),
            );
        };
        match search_chapter_index_page(index_page, &self.geometry, &request.name) {
            Err(e) => VolumeSearch::Failed(request, e),
            Ok(None) => VolumeSearch::Hit(request, None),
            Ok(Some(record_page)) => {
                self.search_record_page_for_request(request, chapter, record_page)
            }
        }
    }

    /// Search one record page of a chapter for the request's name. Also
    /// used directly by the sparse-cache path, which has already resolved
    /// the record page number.
    pub fn search_record_page_for_request(
        &self,
        request: Box<Request>,
        chapter: u32,
        record_page_number: u32,
    ) -> VolumeSearch {
        if record_page_number >= self.geometry.record_pages_per_chapter {
            return VolumeSearch::Failed(
                request,
                crate::errdata!("record page {record_page_number} out of range"),
            );
        }
        let physical_page = self.geometry.physical_page(
            chapter,
            self.geometry.index_pages_per_chapter + record_page_number,
        );
        let (request, page) = match self.probe_page(physical_page, request) {
            PageProbe::Ready(request, page) => (request, page),
            PageProbe::Parked => return VolumeSearch::Parked,
            PageProbe::Rejected(request) => return VolumeSearch::Rejected(request),
        };
        let CachedPage::Record(data) = &*page else {
            return VolumeSearch::Failed(
                request,
                crate::errdata!("page {physical_page} is not a record page"),
            );
        };
        let found = search_record_page(data, &request.name, self.geometry.records_per_page);
        VolumeSearch::Hit(request, found)
    }

    /// Write a closed chapter: pack and write its index pages, update the
    /// index page map, then write the sorted record pages.
    pub fn write_chapter(
        &self,
        chapter_index: &mut OpenChapterIndex,
        records: &[ChunkRecord],
    ) -> Result<()> {
        let geometry = &self.geometry;
        let virtual_chapter = chapter_index.virtual_chapter;
        let chapter = geometry.physical_chapter(virtual_chapter);

        // Any stale cached pages of the physical chapter being reused must
        // not be visible once the new chapter is searchable.
        self.forget_physical_chapter(chapter);

        let mut first_list = 0u32;
        {
            let mut page_map = self.index_page_map.write().unwrap();
            for index_page_number in 0..geometry.index_pages_per_chapter {
                let mut memory = vec![0u8; geometry.bytes_per_page];
                let last_page = index_page_number + 1 == geometry.index_pages_per_chapter;
                let packed =
                    chapter_index.pack_page(geometry, &mut memory, first_list, last_page)?;
                let physical_page = geometry.physical_page(chapter, index_page_number);
                self.region
                    .write_at(physical_page as u64 * self.page_bytes(), &memory)?;
                let highest_list = first_list.wrapping_add(packed).wrapping_sub(1);
                page_map.update(virtual_chapter, chapter, index_page_number, highest_list)?;
                first_list += packed;
            }
        }

        let per_page = geometry.records_per_page as usize;
        let mut memory = vec![0u8; geometry.bytes_per_page];
        for record_page_number in 0..geometry.record_pages_per_chapter {
            let start = record_page_number as usize * per_page;
            encode_record_page(&records[start..start + per_page], &mut memory)?;
            let physical_page = geometry.physical_page(
                chapter,
                geometry.index_pages_per_chapter + record_page_number,
            );
            self.region
                .write_at(physical_page as u64 * self.page_bytes(), &memory)?;
        }
        self.region.sync()?;
        debug!(
            chapter = virtual_chapter,
            physical = chapter,
            records = records.len(),
            "wrote chapter"
        );
        Ok(())
    }

    /// Forget all cached pages of the chapter holding `virtual_chapter`,
    /// as it expires from the window.
    pub fn forget_chapter(&self, virtual_chapter: u64) {
        self.forget_physical_chapter(self.geometry.physical_chapter(virtual_chapter));
    }

    fn forget_physical_chapter(&self, chapter: u32) {
        let first = self.geometry.physical_page(chapter, 0);
        self.cache
            .lock()
            .unwrap()
            .forget_chapter_pages(first, self.geometry.pages_per_chapter);
    }

    /// Read the first index page of a physical chapter and return the VCN
    /// it claims, if the page is valid and maps back to this chapter.
    fn probe_chapter_vcn(&self, chapter: u32) -> Option<u64> {
        let physical_page = self.geometry.physical_page(chapter, 0);
        let data = match self.read_page_data(physical_page) {
            Ok(data) => data,
            Err(Error::ShortRead(_)) | Err(Error::EndOfFile) => return None,
            Err(_) => return None,
        };
        let page = decode_chapter_index_page(data, &self.geometry, self.nonce).ok()?;
        if page.lowest_list != 0 {
            return None;
        }
        if self.geometry.physical_chapter(page.virtual_chapter) != chapter {
            return None;
        }
        Some(page.virtual_chapter)
    }

    /// Determine the `[lowest, highest]` VCN range present on the volume
    /// by scanning each chapter's first index page. Returns `None` for an
    /// empty volume. Chapters that fail to read or verify are treated as
    /// absent.
    pub fn find_chapter_boundaries(&self) -> Result<Option<(u64, u64)>> {
        let chapter_count = self.geometry.chapters_per_volume;
        let vcns: Vec<Option<u64>> = (0..chapter_count)
            .map(|chapter| self.probe_chapter_vcn(chapter))
            .collect();

        let Some(highest) = vcns.iter().flatten().copied().max() else {
            return Ok(None);
        };
        // Chapters from an older lap of the circle (overwritten later in
        // physical order but lower in virtual order) are still valid; only
        // VCNs within one volume length of the highest belong to the
        // current window.
        let floor = (highest + 1).saturating_sub(chapter_count as u64);
        let lowest = vcns
            .iter()
            .flatten()
            .copied()
            .filter(|&vcn| vcn >= floor)
            .min()
            .unwrap_or(highest);
        Ok(Some((lowest, highest)))
    }
}

fn reader_loop(volume: Arc<Volume>, queues: Arc<ZoneQueues>) {
    debug!("volume reader starting");
    loop {
        let read = {
            let mut state = volume.reads.state.lock().unwrap();
            loop {
                if let Some(read) = state.pending.pop_front() {
                    break Some(read);
                }
                if state.stop {
                    break None;
                }
                state = volume.reads.wakeup.wait(state).unwrap();
            }
        };
        let Some(read) = read else {
            break;
        };

        let result = volume.read_and_cache(read.physical_page);
        if let Err(e) = &result {
            warn!(page = read.physical_page, error = %e, "volume page read failed");
        }
        for mut request in read.waiters {
            if let Err(e) = &result {
                request.status = Err(e.clone());
            }
            request.requeued = true;
            queues.requeue(request);
        }
    }
    debug!("volume reader stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::testing::small_dense;
    use crate::name::ChunkName;
    use std::fs::File;
    use tempfile::tempfile;

    fn test_volume(geometry: Geometry) -> Volume {
        let file = tempfile().unwrap();
        file.set_len(geometry.bytes_per_volume).unwrap();
        let region = Region::new(Arc::new(file), 0, geometry.bytes_per_volume);
        Volume::new(region, geometry, 0xabcd, 64).unwrap()
    }

    fn chapter_records(geometry: &Geometry, virtual_chapter: u64) -> Vec<ChunkRecord> {
        (0..geometry.records_per_chapter)
            .map(|i| {
                let mut name = ChunkName::new([0u8; 16]);
                name.set_chapter_index_bytes((virtual_chapter << 32) | (i as u64 * 97 + 13));
                name.set_volume_index_bytes(virtual_chapter * 10_000 + i as u64);
                ChunkRecord::new(name, [(i % 251) as u8; 16])
            })
            .collect()
    }

    fn write_test_chapter(volume: &Volume, virtual_chapter: u64) -> Vec<ChunkRecord> {
        let geometry = volume.geometry.clone();
        let records = chapter_records(&geometry, virtual_chapter);
        let mut chapter_index = OpenChapterIndex::new(&geometry, volume.nonce());
        chapter_index.empty(virtual_chapter);
        for (i, record) in records.iter().enumerate() {
            let page = i as u32 / geometry.records_per_page;
            chapter_index.put_record(&geometry, &record.name, page).unwrap();
        }
        volume.write_chapter(&mut chapter_index, &records).unwrap();
        records
    }

    #[test]
    fn test_write_and_search_chapter() {
        let volume = test_volume(small_dense());
        let records = write_test_chapter(&volume, 0);

        for record in &records {
            let mut request =
                Request::new(record.name, crate::request::RequestKind::Query { update: false }, [0; 16]);
            request.zone = 0;
            match volume.search_for_request(request, 0) {
                VolumeSearch::Hit(_, Some(data)) => assert_eq!(data, record.data),
                VolumeSearch::Hit(_, None) => panic!("record not found"),
                _ => panic!("unexpected parked search on blocking cache"),
            }
        }

        // An unknown name must miss without error.
        let mut absent = ChunkName::new([0u8; 16]);
        absent.set_chapter_index_bytes(0xffff_0000);
        let request = Request::new(absent, crate::request::RequestKind::Query { update: false }, [0; 16]);
        match volume.search_for_request(request, 0) {
            VolumeSearch::Hit(_, found) => assert!(found.is_none()),
            _ => panic!("unexpected parked search"),
        }
    }

    #[test]
    fn test_find_chapter_boundaries() {
        let volume = test_volume(small_dense());
        assert_eq!(volume.find_chapter_boundaries().unwrap(), None);

        for vcn in 0..5u64 {
            write_test_chapter(&volume, vcn);
        }
        assert_eq!(volume.find_chapter_boundaries().unwrap(), Some((0, 4)));

        // Wrap the volume: vcns 8 and 9 overwrite physical chapters 0, 1.
        for vcn in [8u64, 9] {
            write_test_chapter(&volume, vcn);
        }
        // Chapters 2..=4 plus 8..=9 are present; 9 - 8 + 1 window keeps
        // everything within one volume length of 9.
        assert_eq!(volume.find_chapter_boundaries().unwrap(), Some((2, 9)));
    }

    #[test]
    fn test_forget_chapter_evicts_pages() {
        let volume = test_volume(small_dense());
        let records = write_test_chapter(&volume, 0);
        let record = &records[0];

        let request = Request::new(record.name, crate::request::RequestKind::Query { update: false }, [0; 16]);
        let VolumeSearch::Hit(..) = volume.search_for_request(request, 0) else {
            panic!("search did not complete");
        };
        let hits_before = volume.cache_stats().hits;
        assert!(hits_before > 0 || volume.cache_stats().misses > 0);

        volume.forget_chapter(0);
        assert!(volume.cache_stats().invalidations > 0);
    }

    #[test]
    fn test_read_pool_parks_and_requeues() {
        use crate::request::RequestKind;

        let geometry = small_dense();
        let volume = Arc::new(test_volume(geometry.clone()));
        let records = write_test_chapter(&volume, 0);

        let queues = Arc::new(ZoneQueues::new(1));
        let handles = Volume::start_readers(&volume, 2, queues.clone());

        let mut request = Request::new(records[3].name, RequestKind::Query { update: false }, [0; 16]);
        request.zone = 0;
        // The cache is cold, so the first probe must park the request.
        let physical_page = geometry.physical_page(0, 0);
        match volume.probe_page(physical_page, request) {
            PageProbe::Parked => {}
            _ => panic!("expected cold-cache probe to park"),
        }

        // The read pool re-enqueues it on the zone's retry lane.
        let request = queues.zone(0).dequeue().expect("request never requeued");
        assert!(request.requeued);
        assert!(request.status.is_ok());

        // The page is now resident.
        match volume.probe_page(physical_page, request) {
            PageProbe::Ready(..) => {}
            _ => panic!("page should be cached after the pool read it"),
        }

        volume.stop_readers();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_volume_region_too_small() {
        let geometry = small_dense();
        let file: File = tempfile().unwrap();
        file.set_len(1024).unwrap();
        let region = Region::new(Arc::new(file), 0, 1024);
        assert!(Volume::new(region, geometry, 1, 8).is_err());
    }
}

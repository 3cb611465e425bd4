//! The assembled index: zones, queues, worker threads, and the
//! load/save/rebuild lifecycle.
//!
//! ## Request flow
//!
//! ```text
//! session -> [triage queue] -> zone queue -> zone worker
//!                                  |            |
//!                     barrier messages       volume read pool
//!                     to every zone             (QUEUED requests)
//!                                               |
//!                                          retry lane -> zone worker
//!                                                           |
//!                                                     callback queue
//! ```
//!
//! The triage stage exists only for sparse multi-zone indexes: it resolves
//! each name read-only in the volume index and, when the name is a hook
//! resolving to a sparse chapter, broadcasts a sparse-cache barrier to
//! every zone queue ahead of the request. Everything else routes straight
//! to the owning zone's queue.
//!
//! ## Chapter closure
//!
//! When a zone's open chapter fills it runs the closure protocol: wait for
//! the chapter writer to finish the previous chapter, swap open and
//! writing chapters, advance its window, reap the volume index, run
//! checkpointing, submit the writing chapter image, announce the closure
//! to peer zones (first closer only), and expire the oldest chapter. The
//! writer packs and writes the chapter once every zone has submitted.

pub mod checkpoint;
pub mod writer;
pub mod zone;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::layout::{
    open_chapter_component, volume_index_component, Layout, SaveKind, COMPONENT_PAGE_MAP,
};
use crate::name::ChunkName;
use crate::queue::{RequestQueue, ZoneQueues};
use crate::record_page::records_on_page;
use crate::request::Request;
use crate::sparse_cache::{SparseCache, SparseCacheStats};
use crate::volume::cache::{CacheStats, CachedPage};
use crate::volume::Volume;
use crate::volume_index::{VolumeIndex, VolumeIndexStats};

use checkpoint::Checkpoint;
use writer::{writer_loop, ChapterWriter};
use zone::{Disposition, IndexZone};

/// How an index is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Initialize a fresh index, clobbering any existing state.
    Create,
    /// Load from the latest clean save; fail if none exists.
    Load,
    /// Load if possible, otherwise rebuild from the volume contents.
    Rebuild,
}

/// What actually happened when the index was opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LoadType {
    Create,
    Load,
    Rebuild,
    Empty,
}

/// The state machine consulted by the rebuild loop so that a long replay
/// can be suspended, resumed, or abandoned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    Opening,
    Ready,
    Suspending,
    Suspended,
    Freeing,
}

pub struct LoadContext {
    state: Mutex<LoadState>,
    cond: Condvar,
}

impl LoadContext {
    pub fn new() -> Self {
        LoadContext {
            state: Mutex::new(LoadState::Opening),
            cond: Condvar::new(),
        }
    }

    /// Called between replayed chapters. Parks the caller while suspended;
    /// returns true if the load should be abandoned.
    pub fn check_for_suspend(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != LoadState::Suspending {
            return false;
        }
        *state = LoadState::Suspended;
        self.cond.notify_all();
        while !matches!(*state, LoadState::Opening | LoadState::Freeing) {
            state = self.cond.wait(state).unwrap();
        }
        *state == LoadState::Freeing
    }

    pub fn set_ready(&self) {
        let mut state = self.state.lock().unwrap();
        *state = LoadState::Ready;
        self.cond.notify_all();
    }

    /// Ask a load in progress to suspend; returns once it has (or if no
    /// load was in progress).
    pub fn suspend(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != LoadState::Opening {
            return;
        }
        *state = LoadState::Suspending;
        self.cond.notify_all();
        while *state == LoadState::Suspending {
            state = self.cond.wait(state).unwrap();
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == LoadState::Suspended {
            *state = LoadState::Opening;
            self.cond.notify_all();
        }
    }

    pub fn free(&self) {
        let mut state = self.state.lock().unwrap();
        *state = LoadState::Freeing;
        self.cond.notify_all();
    }
}

impl Default for LoadContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Index statistics, merged from every component.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct IndexStats {
    pub entries_indexed: u64,
    pub collisions: u64,
    pub entries_discarded: u64,
    pub overflows: u64,
    pub oldest_chapter: u64,
    pub newest_chapter: u64,
    pub checkpoints: u64,
    pub page_cache: CacheStats,
    pub sparse_cache: SparseCacheStats,
    pub dense_index: VolumeIndexStats,
    pub sparse_index: VolumeIndexStats,
}

/// Everything the worker threads share.
///
/// Lock ordering: a zone mutex may be held while taking the checkpoint
/// mutex, which may be held while taking the layout mutex, which may be
/// held while taking volume-index shard mutexes. Nothing takes them in
/// any other order.
pub struct IndexCore {
    pub geometry: Geometry,
    pub layout: Mutex<Layout>,
    pub volume: Arc<Volume>,
    pub volume_index: VolumeIndex,
    pub zones: Vec<Mutex<IndexZone>>,
    pub writer: ChapterWriter,
    pub checkpoint: Checkpoint,
    pub queues: Arc<ZoneQueues>,
    pub triage_queue: Option<Arc<RequestQueue>>,
    pub callback_queue: Arc<RequestQueue>,
    pub sparse_cache: RwLock<SparseCache>,
    pub load_context: Arc<LoadContext>,
    /// Set by any request execution; cleared by a successful save.
    pub need_to_save: AtomicBool,
    /// The latest save slot holds an open chapter that has not yet been
    /// written to the volume.
    pub has_saved_open_chapter: AtomicBool,
    /// Set when a chapter write fails; further writes are rejected until
    /// the index is rebuilt.
    pub disabled: AtomicBool,
}

impl IndexCore {
    pub fn zone_count(&self) -> u32 {
        self.zones.len() as u32
    }

    pub fn stats(&self) -> IndexStats {
        let (dense_index, sparse_index) = self.volume_index.stats();
        let (oldest_chapter, newest_chapter) = self.writer.window();
        IndexStats {
            entries_indexed: dense_index.record_count + sparse_index.record_count,
            collisions: dense_index.collision_count + sparse_index.collision_count,
            entries_discarded: dense_index.discard_count + sparse_index.discard_count,
            overflows: dense_index.overflow_count + sparse_index.overflow_count,
            oldest_chapter,
            newest_chapter,
            checkpoints: self.checkpoint.count(),
            page_cache: self.volume.cache_stats(),
            sparse_cache: self.sparse_cache.read().unwrap().stats(),
            dense_index,
            sparse_index,
        }
    }
}

/// The running index: the core plus its threads.
pub struct Index {
    core: Arc<IndexCore>,
    zone_workers: Vec<JoinHandle<()>>,
    reader_threads: Vec<JoinHandle<()>>,
    writer_thread: Option<JoinHandle<()>>,
    triage_thread: Option<JoinHandle<()>>,
    pub loaded_type: LoadType,
}

impl Index {
    /// Assemble and start an index over an opened layout.
    pub fn open(
        layout: Layout,
        runtime: &IndexConfig,
        mode: OpenMode,
        load_context: Arc<LoadContext>,
    ) -> Result<Index> {
        let geometry = layout.geometry().clone();
        let stored = layout.config().clone();
        let zone_count = runtime.zone_count;
        if zone_count == 0 || zone_count > 16 {
            return Err(crate::errinput!("zone count {zone_count} out of range 1..=16"));
        }

        let queues = Arc::new(ZoneQueues::new(zone_count));
        let cache_pages =
            (stored.cache_chapters as usize + 1) * geometry.pages_per_chapter as usize;
        let volume = Arc::new(Volume::new(
            layout.volume_region(),
            geometry.clone(),
            layout.nonce(),
            cache_pages,
        )?);
        let volume_index = VolumeIndex::new(
            &geometry,
            zone_count,
            stored.volume_index_mean_delta,
            stored.sparse_sample_rate,
        )?;
        let zones = (0..zone_count)
            .map(|id| Ok(Mutex::new(IndexZone::new(&geometry, zone_count, id)?)))
            .collect::<Result<Vec<_>>>()?;
        let triage_queue = (geometry.is_sparse() && zone_count > 1)
            .then(|| Arc::new(RequestQueue::new()));

        let core = Arc::new(IndexCore {
            sparse_cache: RwLock::new(SparseCache::new(stored.cache_chapters as usize)),
            checkpoint: Checkpoint::new(zone_count, stored.checkpoint_frequency),
            writer: ChapterWriter::new(zone_count),
            layout: Mutex::new(layout),
            volume: volume.clone(),
            volume_index,
            zones,
            queues: queues.clone(),
            triage_queue,
            callback_queue: Arc::new(RequestQueue::new()),
            load_context,
            need_to_save: AtomicBool::new(false),
            has_saved_open_chapter: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            geometry,
        });

        let loaded_type = match mode {
            OpenMode::Create => {
                core.need_to_save.store(true, Ordering::SeqCst);
                LoadType::Create
            }
            OpenMode::Load => {
                load_index(&core)?;
                LoadType::Load
            }
            OpenMode::Rebuild => match load_index(&core) {
                Ok(()) => LoadType::Load,
                Err(e) => {
                    info!(error = %e, "index could not be loaded, rebuilding");
                    // A failed load may have partially restored state.
                    for zone in &core.zones {
                        zone.lock().unwrap().open_chapter.reset();
                    }
                    rebuild_index(&core)?
                }
            },
        };

        // The window is now known; every zone adopts it before any request
        // can be processed.
        let (oldest, newest) = core.writer.window();
        for zone in &core.zones {
            zone.lock().unwrap().set_active_chapters(oldest, newest);
        }
        core.load_context.set_ready();

        // Start the machinery: readers, writer, zone workers, triage.
        let reader_threads =
            Volume::start_readers(&volume, runtime.read_threads as usize, queues.clone());
        let writer_thread = {
            let core = core.clone();
            std::thread::spawn(move || writer_loop(core))
        };
        let zone_workers = (0..zone_count)
            .map(|zone_id| {
                let core = core.clone();
                std::thread::spawn(move || zone_worker_loop(core, zone_id))
            })
            .collect();
        let triage_thread = core.triage_queue.clone().map(|queue| {
            let core = core.clone();
            std::thread::spawn(move || triage_loop(core, queue))
        });

        info!(?loaded_type, oldest, newest, "index open");
        Ok(Index {
            core,
            zone_workers,
            reader_threads,
            writer_thread: Some(writer_thread),
            triage_thread,
            loaded_type,
        })
    }

    pub fn core(&self) -> &Arc<IndexCore> {
        &self.core
    }

    /// Route a request into the pipeline.
    pub fn enqueue(&self, mut request: Box<Request>) {
        request.zone = self.core.volume_index.zone_for_name(&request.name);
        match &self.core.triage_queue {
            Some(triage) => triage.enqueue(request),
            None => self.core.queues.enqueue(request),
        }
    }

    /// Save the index state to a clean save slot. The caller must have
    /// drained outstanding requests first.
    pub fn save(&self) -> Result<()> {
        save_index(&self.core)
    }

    pub fn set_checkpoint_frequency(&self, frequency: u32) -> u32 {
        self.core.checkpoint.set_frequency(frequency)
    }

    pub fn stats(&self) -> IndexStats {
        self.core.stats()
    }

    /// Stop all threads and tear the index down. Does not save.
    pub fn close(mut self) -> Result<()> {
        let core = &self.core;
        if let Some(queue) = &core.triage_queue {
            queue.finish();
        }
        if let Some(handle) = self.triage_thread.take() {
            let _ = handle.join();
        }

        core.queues.finish_all();
        for handle in self.zone_workers.drain(..) {
            let _ = handle.join();
        }
        // A zone worker may have enqueued a control message to a peer in
        // the instant that peer's worker was exiting; drain leftovers
        // inline so the writer is not left waiting for a zone. Handling a
        // leftover can itself enqueue messages, so sweep until quiet.
        loop {
            let mut handled = false;
            for zone_id in 0..core.zone_count() {
                while let Some(request) = core.queues.zone(zone_id).dequeue() {
                    handled = true;
                    if let Some(message) = request.message {
                        let mut zone = core.zones[zone_id as usize].lock().unwrap();
                        if let Err(e) = zone::handle_message(core, &mut zone, message) {
                            error!(zone = zone_id, error = %e, "error executing leftover message");
                        }
                    }
                }
            }
            if !handled {
                break;
            }
        }

        core.writer.stop();
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
        core.volume.stop_readers();
        for handle in self.reader_threads.drain(..) {
            let _ = handle.join();
        }
        core.callback_queue.finish();
        Ok(())
    }
}

fn zone_worker_loop(core: Arc<IndexCore>, zone_id: u32) {
    let queue = core.queues.zone(zone_id).clone();
    while let Some(mut request) = queue.dequeue() {
        if let Some(message) = request.message {
            let mut zone = core.zones[zone_id as usize].lock().unwrap();
            if let Err(e) = zone::handle_message(&core, &mut zone, message) {
                error!(zone = zone_id, ?message, error = %e, "error executing message");
            }
            // Control messages are complete once executed.
            continue;
        }

        core.need_to_save.store(true, Ordering::SeqCst);
        if request.requeued && request.status.is_err() {
            // The page read this request was waiting on failed.
            core.callback_queue.enqueue(request);
            continue;
        }

        let disposition = {
            let mut zone = core.zones[zone_id as usize].lock().unwrap();
            zone::dispatch(&core, &mut zone, request)
        };
        match disposition {
            Disposition::Complete(request) => core.callback_queue.enqueue(request),
            // The request was parked; the read pool will re-enqueue it.
            Disposition::Suspended => {}
        }
    }
}

fn triage_loop(core: Arc<IndexCore>, queue: Arc<RequestQueue>) {
    while let Some(mut request) = queue.dequeue() {
        match core.volume_index.lookup(&request.name) {
            Ok(triage) => {
                request.zone = triage.zone;
                if triage.in_sampled_chapter {
                    let needs_barrier = {
                        let zone = core.zones[triage.zone as usize].lock().unwrap();
                        zone.is_chapter_sparse(&core, triage.virtual_chapter)
                    };
                    if needs_barrier {
                        // Every zone must admit the chapter before this
                        // request can be delivered to its own zone.
                        for peer in 0..core.zone_count() {
                            core.queues.zone(peer).enqueue(Request::message(
                                peer,
                                crate::request::ZoneMessage::SparseCacheBarrier {
                                    virtual_chapter: triage.virtual_chapter,
                                },
                            ));
                        }
                    }
                }
                core.queues.enqueue(request);
            }
            Err(e) => {
                request.status = Err(e);
                core.callback_queue.enqueue(request);
            }
        }
    }
}

/// Restore the index from the latest clean save.
fn load_index(core: &IndexCore) -> Result<()> {
    let layout = core.layout.lock().unwrap();
    let (slot, header) = layout
        .find_latest_save(Some(SaveKind::Save))
        .ok_or(Error::NotSavedCleanly)?;
    let header = header.clone();
    if header.zone_count != core.zone_count() {
        // Shards are partitioned by zone; a different zone count cannot
        // adopt these snapshots.
        return Err(Error::NotSavedCleanly);
    }

    for zone in 0..core.zone_count() {
        let mut reader = layout.open_component(slot, volume_index_component(zone))?;
        core.volume_index.read_zone_from(zone, &mut reader)?;
    }
    let mut reader = layout.open_component(slot, COMPONENT_PAGE_MAP)?;
    core.volume
        .index_page_map
        .write()
        .unwrap()
        .read_from(&mut reader)?;
    for zone in 0..core.zone_count() {
        let mut reader = layout.open_component(slot, open_chapter_component(zone))?;
        core.zones[zone as usize]
            .lock()
            .unwrap()
            .open_chapter
            .read_from(&mut reader)?;
    }
    drop(layout);

    core.writer
        .set_window(header.oldest_chapter, header.newest_chapter);
    core.has_saved_open_chapter.store(true, Ordering::SeqCst);
    core.need_to_save.store(false, Ordering::SeqCst);
    info!(
        oldest = header.oldest_chapter,
        newest = header.newest_chapter,
        "loaded index from clean save"
    );
    Ok(())
}

/// Save the current state into the next rotating save slot.
pub(crate) fn save_index(core: &IndexCore) -> Result<()> {
    if !core.need_to_save.load(Ordering::SeqCst) {
        return Ok(());
    }
    core.writer.wait_idle();
    core.checkpoint.abort();

    let (oldest, newest) = core.writer.window();
    info!(newest, "beginning save");

    // Snapshot open chapters to memory first, so the layout lock is never
    // held while taking a zone lock.
    let mut open_chapters = Vec::with_capacity(core.zone_count() as usize);
    for zone in 0..core.zone_count() {
        let mut buffer = Vec::new();
        core.zones[zone as usize]
            .lock()
            .unwrap()
            .open_chapter
            .write_to(&mut buffer)?;
        open_chapters.push(buffer);
    }

    let mut layout = core.layout.lock().unwrap();
    // Abandon any checkpoint left half-finished by quiesced zones.
    layout.cancel_save();

    let result = (|| -> Result<()> {
        layout.begin_save(SaveKind::Save, oldest, newest, core.zone_count())?;
        for zone in 0..core.zone_count() {
            layout.save_component(volume_index_component(zone), |writer| {
                let mut writer = writer;
                core.volume_index.write_zone_to(zone, &mut writer)
            })?;
        }
        layout.save_component(COMPONENT_PAGE_MAP, |writer| {
            let mut writer = writer;
            core.volume.index_page_map.read().unwrap().write_to(&mut writer)
        })?;
        for (zone, buffer) in open_chapters.iter().enumerate() {
            layout.save_component(open_chapter_component(zone as u32), |writer| {
                writer.write_all(buffer)?;
                Ok(())
            })?;
        }
        layout.commit_save()
    })();

    match result {
        Ok(()) => {
            core.has_saved_open_chapter.store(true, Ordering::SeqCst);
            core.need_to_save.store(false, Ordering::SeqCst);
            info!(newest, "finished save");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "save failed");
            layout.cancel_save();
            Err(e)
        }
    }
}

/// Reconstruct the volume index by scanning the on-disk chapters.
fn rebuild_index(core: &IndexCore) -> Result<LoadType> {
    let Some((lowest, highest)) = core.volume.find_chapter_boundaries()? else {
        info!("rebuilding an empty volume");
        core.volume_index.set_open_chapter(0)?;
        core.writer.set_window(0, 0);
        core.need_to_save.store(true, Ordering::SeqCst);
        return Ok(LoadType::Empty);
    };

    let chapter_count = core.geometry.chapters_per_volume as u64;
    let newest = highest + 1;
    let mut oldest = lowest;
    if newest == oldest + chapter_count {
        // The newest chapter is about to shadow the oldest.
        oldest += 1;
    }
    if newest - oldest > chapter_count {
        return Err(Error::CorruptComponent(format!(
            "volume chapter boundaries [{lowest}, {highest}] are too wide"
        )));
    }

    // A complete checkpoint within the discovered range is a baseline that
    // bounds how much must be replayed.
    let mut from = oldest;
    let baseline = {
        let layout = core.layout.lock().unwrap();
        layout
            .find_latest_save(Some(SaveKind::Checkpoint))
            .map(|(slot, header)| (slot, header.clone()))
    };
    let mut restored = false;
    if let Some((slot, header)) = baseline {
        if header.zone_count == core.zone_count()
            && header.newest_chapter > oldest
            && header.newest_chapter <= newest
        {
            match restore_checkpoint(core, slot) {
                Ok(()) => {
                    from = header.newest_chapter;
                    restored = true;
                    info!(
                        checkpoint = header.newest_chapter,
                        "rebuild starting from checkpoint baseline"
                    );
                }
                Err(e) => warn!(error = %e, "ignoring unusable checkpoint"),
            }
        }
    }
    if !restored {
        // Reap anything a partial load may have left, then rewind the
        // window to the replay start.
        core.volume_index.set_open_chapter(newest)?;
        core.volume_index.set_open_chapter(from)?;
    }

    replay_volume(core, from, newest)?;
    core.volume_index.set_open_chapter(newest)?;
    core.writer.set_window(oldest, newest);
    core.need_to_save.store(true, Ordering::SeqCst);
    Ok(LoadType::Rebuild)
}

fn restore_checkpoint(core: &IndexCore, slot: usize) -> Result<()> {
    let layout = core.layout.lock().unwrap();
    for zone in 0..core.zone_count() {
        let mut reader = layout.open_component(slot, volume_index_component(zone))?;
        core.volume_index.read_zone_from(zone, &mut reader)?;
    }
    let mut reader = layout.open_component(slot, COMPONENT_PAGE_MAP)?;
    core.volume
        .index_page_map
        .write()
        .unwrap()
        .read_from(&mut reader)?;
    Ok(())
}

/// Replay every record page of every chapter in `[from, upto)` into the
/// volume index.
fn replay_volume(core: &IndexCore, from: u64, upto: u64) -> Result<()> {
    info!(from, upto, "replaying volume chapters");
    let geometry = &core.geometry;
    for virtual_chapter in from..upto {
        if core.load_context.check_for_suspend() {
            info!(
                chapter = virtual_chapter,
                "replay interrupted by index shutdown"
            );
            return Err(Error::Busy);
        }

        let will_be_sparse = geometry.is_chapter_sparse(from, upto, virtual_chapter);
        let chapter = geometry.physical_chapter(virtual_chapter);
        core.volume_index.set_open_chapter(virtual_chapter)?;

        if let Err(e) = rebuild_index_page_map(core, virtual_chapter, chapter) {
            // A chapter that cannot be decoded is treated as absent, as a
            // partially written chapter would be.
            warn!(chapter = virtual_chapter, error = %e, "skipping unreadable chapter");
            continue;
        }

        for record_page_number in 0..geometry.record_pages_per_chapter {
            let physical_page = geometry
                .physical_page(chapter, geometry.index_pages_per_chapter + record_page_number);
            let page = core.volume.get_page_blocking(physical_page)?;
            let CachedPage::Record(data) = &*page else {
                return Err(crate::errdata!("page {physical_page} is not a record page"));
            };
            for record in records_on_page(data, geometry.records_per_page) {
                if let Err(e) = replay_record(core, &record.name, virtual_chapter, will_be_sparse)
                {
                    error!(
                        chapter = virtual_chapter,
                        name = %record.name.to_hex(),
                        error = %e,
                        "could not replay record"
                    );
                    return Err(e);
                }
            }
        }
    }
    Ok(())
}

fn rebuild_index_page_map(core: &IndexCore, virtual_chapter: u64, chapter: u32) -> Result<()> {
    let geometry = &core.geometry;
    let mut expected_list = 0u32;
    for index_page_number in 0..geometry.index_pages_per_chapter {
        let physical_page = geometry.physical_page(chapter, index_page_number);
        let page = core.volume.get_page_blocking(physical_page)?;
        let CachedPage::Index(index_page) = &*page else {
            return Err(crate::errdata!(
                "page {physical_page} is not a chapter index page"
            ));
        };
        if index_page.virtual_chapter != virtual_chapter {
            return Err(crate::errdata!(
                "chapter {chapter} index page {index_page_number} belongs to chapter {}",
                index_page.virtual_chapter
            ));
        }
        if index_page.lowest_list != expected_list {
            return Err(crate::errdata!(
                "chapter {chapter} index page {index_page_number} is discontinuous"
            ));
        }
        crate::chapter_index::validate_chapter_index_page(index_page, geometry)?;
        core.volume.index_page_map.write().unwrap().update(
            virtual_chapter,
            chapter,
            index_page_number,
            index_page.highest_list,
        )?;
        expected_list = index_page.highest_list.wrapping_add(1);
    }
    Ok(())
}

/// Add one replayed record to the volume index, mirroring the decisions a
/// live index would have made.
fn replay_record(
    core: &IndexCore,
    name: &ChunkName,
    virtual_chapter: u64,
    will_be_sparse: bool,
) -> Result<()> {
    if will_be_sparse && !core.volume_index.is_sample(name) {
        // This chapter will be sparse when the rebuild finishes, and the
        // name is not a hook, so it is not tracked.
        return Ok(());
    }

    let record = core.volume_index.get_record(name)?;
    let update_record = if record.found {
        if record.is_collision {
            if record.virtual_chapter == virtual_chapter {
                // Already correct.
                return Ok(());
            }
            true
        } else if record.virtual_chapter == virtual_chapter {
            // An entry points at this chapter, but it may be for another
            // name sharing the address; assume it is and add a collision.
            false
        } else {
            // An entry cites a different chapter; only that chapter's
            // record page can tell whether it is the same name.
            chapter_contains(core, record.virtual_chapter, name)?
        }
    } else {
        false
    };

    let result = if update_record {
        core.volume_index.set_record_chapter(name, virtual_chapter)
    } else {
        core.volume_index.put_record(name, virtual_chapter)
    };
    match result {
        // Duplicates and overflowing lists are expected during replay.
        Err(Error::DuplicateName) | Err(Error::Overflow) => Ok(()),
        other => other,
    }
}

/// Blocking search of a chapter for `name`, for replay decisions only.
fn chapter_contains(core: &IndexCore, virtual_chapter: u64, name: &ChunkName) -> Result<bool> {
    let geometry = &core.geometry;
    let chapter = geometry.physical_chapter(virtual_chapter);
    let index_page_number = core
        .volume
        .index_page_map
        .read()
        .unwrap()
        .find_index_page(geometry, chapter, name);
    let page = match core
        .volume
        .get_page_blocking(geometry.physical_page(chapter, index_page_number))
    {
        Ok(page) => page,
        // An unreadable chapter cannot contain the name.
        Err(Error::CorruptComponent(_)) | Err(Error::CorruptData(_)) => return Ok(false),
        Err(e) => return Err(e),
    };
    let CachedPage::Index(index_page) = &*page else {
        return Ok(false);
    };
    let Some(record_page_number) =
        crate::chapter_index::search_chapter_index_page(index_page, geometry, name)?
    else {
        return Ok(false);
    };

    let physical_page =
        geometry.physical_page(chapter, geometry.index_pages_per_chapter + record_page_number);
    let page = core.volume.get_page_blocking(physical_page)?;
    let CachedPage::Record(data) = &*page else {
        return Ok(false);
    };
    Ok(crate::record_page::search_record_page(data, name, geometry.records_per_page).is_some())
}

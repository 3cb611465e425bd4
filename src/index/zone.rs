//! Index zones: per-zone state and request execution.
//!
//! Each zone owns an open chapter, the writing chapter it most recently
//! closed, and its view of the active window. A zone's requests are
//! serialized by its queue, so nothing here takes locks beyond the shared
//! structures (volume index shards, sparse cache, page cache) that are
//! internally synchronized. A zone never touches another zone's open
//! chapter.

use tracing::debug;

use crate::error::{Error, Result};
use crate::name::ChunkData;
use crate::open_chapter::OpenChapter;
use crate::request::{Location, Request, RequestKind, ZoneMessage};
use crate::volume::VolumeSearch;

use super::checkpoint::process_checkpointing;
use super::writer::ChapterImage;
use super::IndexCore;

/// The outcome of executing a request on its zone.
pub enum Disposition {
    /// The request finished (successfully or not) and is ready for its
    /// callback.
    Complete(Box<Request>),
    /// The request was parked with the read pool; it will return through
    /// the zone's retry lane.
    Suspended,
}

/// The progress of a chapter search on behalf of a request.
enum ZoneSearch {
    Done(Box<Request>, bool),
    Parked,
}

pub struct IndexZone {
    pub id: u32,
    pub open_chapter: OpenChapter,
    pub writing_chapter: OpenChapter,
    pub oldest_virtual_chapter: u64,
    pub newest_virtual_chapter: u64,
}

impl IndexZone {
    pub fn new(core_geometry: &crate::geometry::Geometry, zone_count: u32, id: u32) -> Result<Self> {
        Ok(IndexZone {
            id,
            open_chapter: OpenChapter::new(core_geometry, zone_count)?,
            writing_chapter: OpenChapter::new(core_geometry, zone_count)?,
            oldest_virtual_chapter: 0,
            newest_virtual_chapter: 0,
        })
    }

    /// Adopt the index's active window, after load or rebuild.
    pub fn set_active_chapters(&mut self, oldest: u64, newest: u64) {
        self.oldest_virtual_chapter = oldest;
        self.newest_virtual_chapter = newest;
    }

    pub fn is_chapter_sparse(&self, core: &IndexCore, virtual_chapter: u64) -> bool {
        core.geometry.is_chapter_sparse(
            self.oldest_virtual_chapter,
            self.newest_virtual_chapter,
            virtual_chapter,
        )
    }

    fn compute_location(&self, core: &IndexCore, virtual_chapter: u64) -> Location {
        if virtual_chapter == self.newest_virtual_chapter {
            Location::InOpenChapter
        } else if self.is_chapter_sparse(core, virtual_chapter) {
            Location::InSparse
        } else {
            Location::InDense
        }
    }
}

/// Handle an inter-zone control message on this zone.
pub fn handle_message(core: &IndexCore, zone: &mut IndexZone, message: ZoneMessage) -> Result<()> {
    match message {
        ZoneMessage::SparseCacheBarrier { virtual_chapter } => {
            update_sparse_cache(core, zone, virtual_chapter)
        }
        ZoneMessage::AnnounceChapterClosed { virtual_chapter } => {
            // If the chapter another zone closed is still open here, close
            // it now to bound zone skew.
            if zone.newest_virtual_chapter == virtual_chapter {
                open_next_chapter(core, zone)?;
            }
            Ok(())
        }
    }
}

/// Admit a chapter to the shared sparse cache on behalf of this zone.
pub fn update_sparse_cache(
    core: &IndexCore,
    zone: &IndexZone,
    virtual_chapter: u64,
) -> Result<()> {
    if !zone.is_chapter_sparse(core, virtual_chapter) {
        return Ok(());
    }
    let mut cache = core.sparse_cache.write().unwrap();
    cache.update(&core.volume, virtual_chapter, zone.oldest_virtual_chapter)
}

/// For a single-zone sparse index there is no triage queue, so the barrier
/// a triage stage would have issued is applied inline.
fn simulate_barrier(core: &IndexCore, zone: &mut IndexZone, request: &Request) -> Result<()> {
    if core.zone_count() > 1 || !core.geometry.is_sparse() {
        return Ok(());
    }
    let triage = core.volume_index.lookup(&request.name)?;
    if !triage.in_sampled_chapter || !zone.is_chapter_sparse(core, triage.virtual_chapter) {
        return Ok(());
    }
    update_sparse_cache(core, zone, triage.virtual_chapter)
}

/// Execute one request on its zone.
pub fn dispatch(core: &IndexCore, zone: &mut IndexZone, mut request: Box<Request>) -> Disposition {
    request.location = Location::Unknown;

    if !request.requeued {
        if let Err(e) = simulate_barrier(core, zone, &request) {
            return fail(request, e);
        }
    }

    let disposition = match request.kind {
        RequestKind::Delete => remove_from_zone(core, zone, request),
        _ => search_zone(core, zone, request),
    };
    match disposition {
        Disposition::Complete(mut request) => {
            if request.location == Location::Unknown {
                request.location = Location::Unavailable;
            }
            Disposition::Complete(request)
        }
        parked => parked,
    }
}

fn fail(mut request: Box<Request>, error: Error) -> Disposition {
    request.status = Err(error);
    Disposition::Complete(request)
}

/// Search this zone for the request's name and update the index
/// accordingly. Correct only for the LRU behavior of the open chapter.
fn search_zone(core: &IndexCore, zone: &mut IndexZone, mut request: Box<Request>) -> Disposition {
    let record = match core.volume_index.get_record(&request.name) {
        Ok(record) => record,
        Err(e) => return fail(request, e),
    };

    let mut found = false;
    if record.found {
        match get_record_from_zone(core, zone, request, record.virtual_chapter) {
            Ok(ZoneSearch::Parked) => return Disposition::Suspended,
            Ok(ZoneSearch::Done(returned, was_found)) => {
                request = returned;
                found = was_found;
            }
            Err((returned, e)) => return fail(returned, e),
        }
        if found {
            request.found = true;
            request.location = zone.compute_location(core, record.virtual_chapter);
        }
    }

    // A record that overflowed a chapter index (or collided and was then
    // dropped) exists as a collision entry in the volume index but cannot
    // be found in the volume; treat it as present-but-unavailable and
    // rebind it on any write.
    let overflow_record = record.found && record.is_collision && !found;
    let open_chapter = zone.newest_virtual_chapter;
    let index_result: Result<()>;
    if found || overflow_record {
        if let RequestKind::Query { update } = request.kind {
            if !update || overflow_record {
                return Disposition::Complete(request);
            }
        }
        if record.virtual_chapter != open_chapter {
            // Update the volume index to cite the open chapter. If the
            // record had been deleted or dropped from the chapter index,
            // this brings it back.
            index_result = core
                .volume_index
                .set_record_chapter(&request.name, open_chapter);
        } else if request.kind != RequestKind::Update {
            // The record is already in the open chapter.
            return Disposition::Complete(request);
        } else {
            index_result = Ok(());
        }
    } else {
        // Not in the volume index. A non-hook name in a sparse index may
        // still be in a cached sparse chapter.
        if !core.volume_index.is_sample(&request.name) && core.geometry.is_sparse() {
            match search_sparse_cache_in_zone(core, zone, request, None) {
                Ok(ZoneSearch::Parked) => return Disposition::Suspended,
                Ok(ZoneSearch::Done(returned, was_found)) => {
                    request = returned;
                    found = was_found;
                }
                Err((returned, e)) => return fail(returned, e),
            }
            if found {
                request.found = true;
                request.location = Location::InSparse;
            }
        }

        if let RequestKind::Query { update } = request.kind {
            if !found || !update {
                return Disposition::Complete(request);
            }
        }

        // Add a new entry citing the open chapter, both for new records
        // and for records resurfacing from cached sparse chapters.
        index_result = core.volume_index.put_record(&request.name, open_chapter);
    }

    match index_result {
        Ok(()) => {}
        // A delta list overflow was already counted; the put is dropped.
        Err(Error::Overflow) => return Disposition::Complete(request),
        Err(e) => return fail(request, e),
    }

    let metadata = if !found || request.kind == RequestKind::Update {
        request.new_metadata
    } else {
        // A duplicate: refresh it in the open chapter for LRU.
        request.old_metadata
    };
    put_record_in_zone(core, zone, request, &metadata)
}

/// Find the request's name in the chapter the volume index cited.
fn get_record_from_zone(
    core: &IndexCore,
    zone: &mut IndexZone,
    mut request: Box<Request>,
    virtual_chapter: u64,
) -> std::result::Result<ZoneSearch, (Box<Request>, Error)> {
    if virtual_chapter == zone.newest_virtual_chapter {
        let found = match zone.open_chapter.search(&request.name) {
            Some(metadata) => {
                request.old_metadata = metadata;
                true
            }
            None => false,
        };
        return Ok(ZoneSearch::Done(request, found));
    }

    if zone.newest_virtual_chapter > 0
        && virtual_chapter == zone.newest_virtual_chapter - 1
        && zone.writing_chapter.size() > 0
    {
        // The writing chapter still holds the previous chapter's records;
        // search it rather than racing the chapter writer to disk.
        let found = match zone.writing_chapter.search(&request.name) {
            Some(metadata) => {
                request.old_metadata = metadata;
                true
            }
            None => false,
        };
        return Ok(ZoneSearch::Done(request, found));
    }

    if zone.is_chapter_sparse(core, virtual_chapter) {
        // Membership is stable between barriers, so the lock is dropped
        // before the search takes its own.
        let cached = core.sparse_cache.read().unwrap().contains(virtual_chapter);
        if cached {
            return search_sparse_cache_in_zone(core, zone, request, Some(virtual_chapter));
        }
    }

    match core.volume.search_for_request(request, virtual_chapter) {
        VolumeSearch::Hit(mut request, Some(metadata)) => {
            request.old_metadata = metadata;
            Ok(ZoneSearch::Done(request, true))
        }
        VolumeSearch::Hit(request, None) => Ok(ZoneSearch::Done(request, false)),
        VolumeSearch::Parked => Ok(ZoneSearch::Parked),
        VolumeSearch::Rejected(request) => Err((request, Error::Busy)),
        VolumeSearch::Failed(request, e) => Err((request, e)),
    }
}

/// Search the sparse cache, then confirm a hit against the record page.
fn search_sparse_cache_in_zone(
    core: &IndexCore,
    zone: &mut IndexZone,
    request: Box<Request>,
    virtual_chapter: Option<u64>,
) -> std::result::Result<ZoneSearch, (Box<Request>, Error)> {
    let cached = {
        let cache = core.sparse_cache.read().unwrap();
        cache.search(
            &core.geometry,
            &request.name,
            virtual_chapter,
            zone.oldest_virtual_chapter,
        )
    };
    let (vcn, record_page) = match cached {
        Ok(Some(hit)) => hit,
        Ok(None) => return Ok(ZoneSearch::Done(request, false)),
        Err(e) => return Err((request, e)),
    };

    let chapter = core.geometry.physical_chapter(vcn);
    match core
        .volume
        .search_record_page_for_request(request, chapter, record_page)
    {
        VolumeSearch::Hit(mut request, Some(metadata)) => {
            request.old_metadata = metadata;
            Ok(ZoneSearch::Done(request, true))
        }
        VolumeSearch::Hit(request, None) => Ok(ZoneSearch::Done(request, false)),
        VolumeSearch::Parked => Ok(ZoneSearch::Parked),
        VolumeSearch::Rejected(request) => Err((request, Error::Busy)),
        VolumeSearch::Failed(request, e) => Err((request, e)),
    }
}

/// Remove the request's name from the index.
fn remove_from_zone(core: &IndexCore, zone: &mut IndexZone, mut request: Box<Request>) -> Disposition {
    let record = match core.volume_index.get_record(&request.name) {
        Ok(record) => record,
        Err(e) => return fail(request, e),
    };
    if !record.found {
        // Nothing to remove.
        return Disposition::Complete(request);
    }

    if !record.is_collision {
        // Non-collision records are hints; resolve the name in the cited
        // chapter before believing it.
        match get_record_from_zone(core, zone, request, record.virtual_chapter) {
            Ok(ZoneSearch::Parked) => return Disposition::Suspended,
            Ok(ZoneSearch::Done(returned, found)) => {
                request = returned;
                if !found {
                    return Disposition::Complete(request);
                }
            }
            Err((returned, e)) => return fail(returned, e),
        }
    }

    request.found = true;
    request.location = zone.compute_location(core, record.virtual_chapter);

    // Remove only the volume index entry. A later search may return stale
    // advice if a colliding name shares the chapter, but the record page
    // check makes that harmless.
    if let Err(e) = core.volume_index.remove_record(&request.name) {
        return fail(request, e);
    }

    // A record in the open chapter must also be marked deleted there, or
    // re-adding the name later would misbehave.
    if request.location == Location::InOpenChapter
        && !zone.open_chapter.remove(&request.name)
    {
        return fail(
            request,
            crate::errstate!("record to remove was not in the open chapter"),
        );
    }
    Disposition::Complete(request)
}

/// Insert the record into the zone's open chapter, closing the chapter if
/// it becomes full.
fn put_record_in_zone(
    core: &IndexCore,
    zone: &mut IndexZone,
    request: Box<Request>,
    metadata: &ChunkData,
) -> Disposition {
    let remaining = match zone.open_chapter.put(&request.name, metadata) {
        Ok(remaining) => remaining,
        Err(e) => return fail(request, e),
    };
    if remaining == 0 {
        if let Err(e) = open_next_chapter(core, zone) {
            return fail(request, e);
        }
    }
    Disposition::Complete(request)
}

/// The chapter closure protocol (see the module docs of `index`).
pub fn open_next_chapter(core: &IndexCore, zone: &mut IndexZone) -> Result<()> {
    debug!(
        chapter = zone.newest_virtual_chapter,
        zone = zone.id,
        records = zone.open_chapter.record_count(),
        "closing chapter"
    );

    // Wait for any currently writing chapter to complete, then take over
    // the writing slot.
    core.writer
        .finish_previous_chapter(zone.newest_virtual_chapter)?;
    std::mem::swap(&mut zone.open_chapter, &mut zone.writing_chapter);

    let closed_chapter = zone.newest_virtual_chapter;
    zone.newest_virtual_chapter += 1;

    // Reap: invalidate volume index entries pointing at the physical
    // chapter the new open chapter will reuse.
    let window = zone.newest_virtual_chapter - zone.oldest_virtual_chapter;
    if window > core.geometry.chapters_per_volume as u64 {
        return Err(crate::errstate!(
            "window of {window} chapters exceeds the volume"
        ));
    }
    core.volume_index
        .set_zone_open_chapter(zone.id, zone.newest_virtual_chapter)?;

    zone.open_chapter.reset();

    // Begin, continue, or finish checkpoint processing.
    process_checkpointing(
        core,
        zone.id,
        zone.newest_virtual_chapter,
        zone.oldest_virtual_chapter,
    )?;

    let image = ChapterImage::capture(&zone.writing_chapter);
    let finished_zones = core.writer.start_closing_chapter(zone.id, image);
    if finished_zones == 1 && core.zone_count() > 1 {
        // First zone to close this chapter: tell the others, to control
        // zone skew.
        for peer in 0..core.zone_count() {
            if peer != zone.id {
                core.queues.zone(peer).enqueue(Request::message(
                    peer,
                    ZoneMessage::AnnounceChapterClosed {
                        virtual_chapter: closed_chapter,
                    },
                ));
            }
        }
    }

    let victim = zone.oldest_virtual_chapter;
    let expired = core.geometry.chapters_to_expire(zone.newest_virtual_chapter) as u64;
    zone.oldest_virtual_chapter += expired;

    if finished_zones == core.zone_count() {
        // Last zone to close the chapter cleans up the page cache. This is
        // safe before the write completes because nothing will look for
        // the new chapter in the cache until it is on disk.
        for offset in 0..expired {
            core.volume.forget_chapter(victim + offset);
        }
    }
    Ok(())
}

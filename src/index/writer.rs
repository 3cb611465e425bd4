//! The chapter writer: the background thread that turns closed open
//! chapters into on-disk chapters.
//!
//! Each zone submits an image of its writing chapter when it closes a
//! chapter; the writer waits until every zone has submitted for the
//! current VCN, collates the per-zone images into a single chapter
//! (round-robin by zone, gaps filled with a designated fill record),
//! builds the chapter index, writes index and record pages, and only then
//! advances the active window and wakes the zones. Chapters are therefore
//! written in strictly increasing VCN order, and a zone can run at most
//! one chapter ahead of the writer.
//!
//! A write failure is sticky: the index is disabled for further writes and
//! the error resurfaces on every later close and save until the index is
//! rebuilt.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, error, info};

use crate::chapter_index::OpenChapterIndex;
use crate::error::{Error, Result};
use crate::errstate;
use crate::open_chapter::OpenChapter;
use crate::record_page::ChunkRecord;

use super::IndexCore;

/// A zone's writing chapter, imaged for the writer: records in insertion
/// order with their deletion marks.
pub struct ChapterImage {
    records: Vec<(ChunkRecord, bool)>,
}

impl ChapterImage {
    pub fn capture(chapter: &OpenChapter) -> Self {
        let records = (1..=chapter.size())
            .map(|number| {
                let (record, deleted) = chapter.record(number);
                (*record, deleted)
            })
            .collect();
        ChapterImage { records }
    }

    fn len(&self) -> u32 {
        self.records.len() as u32
    }

    fn get(&self, record_number: u32) -> Option<&(ChunkRecord, bool)> {
        // Record numbers are 1-based.
        self.records.get(record_number as usize - 1)
    }
}

struct WriterState {
    /// Images submitted for the chapter being closed, one slot per zone.
    images: Vec<Option<ChapterImage>>,
    /// The number of zones that have submitted for the current VCN.
    zones_to_write: u32,
    /// The active window: `newest` is the open chapter, advanced by the
    /// writer after each chapter lands.
    newest_chapter: u64,
    oldest_chapter: u64,
    /// The sticky result of the most recent write.
    result: Result<()>,
    stop: bool,
}

/// The chapter writer's shared state. The thread itself is spawned by the
/// index once the core is assembled.
pub struct ChapterWriter {
    state: Mutex<WriterState>,
    cond: Condvar,
}

impl ChapterWriter {
    pub fn new(zone_count: u32) -> Self {
        ChapterWriter {
            state: Mutex::new(WriterState {
                images: (0..zone_count).map(|_| None).collect(),
                zones_to_write: 0,
                newest_chapter: 0,
                oldest_chapter: 0,
                result: Ok(()),
                stop: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// The active window `(oldest, newest)`.
    pub fn window(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.oldest_chapter, state.newest_chapter)
    }

    /// Set the window after load or rebuild, before any closes.
    pub fn set_window(&self, oldest: u64, newest: u64) {
        let mut state = self.state.lock().unwrap();
        state.oldest_chapter = oldest;
        state.newest_chapter = newest;
    }

    /// Submit a zone's writing chapter for the current VCN. Returns how
    /// many zones have now submitted.
    pub fn start_closing_chapter(&self, zone: u32, image: ChapterImage) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.images[zone as usize] = Some(image);
        state.zones_to_write += 1;
        let finished = state.zones_to_write;
        self.cond.notify_all();
        finished
    }

    /// Block until the writer has finished every chapter before
    /// `current_chapter`, surfacing any write failure.
    pub fn finish_previous_chapter(&self, current_chapter: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        while state.newest_chapter < current_chapter {
            state = self.cond.wait(state).unwrap();
        }
        state
            .result
            .clone()
            .map_err(|e| Error::IO(format!("writing of previous open chapter failed: {e}")))
    }

    /// Block until no chapter write is pending or in progress.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock().unwrap();
        while state.zones_to_write > 0 {
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Tell the writer thread to exit once the zones are quiescent.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stop = true;
        self.cond.notify_all();
    }
}

/// The writer thread body.
pub fn writer_loop(core: Arc<IndexCore>) {
    debug!("chapter writer starting");
    let mut chapter_index = OpenChapterIndex::new(&core.geometry, core.volume.nonce());
    loop {
        let (images, virtual_chapter) = {
            let mut state = core.writer.state.lock().unwrap();
            loop {
                if state.zones_to_write >= core.zone_count() {
                    break;
                }
                if state.stop && state.zones_to_write == 0 {
                    debug!("chapter writer stopping");
                    return;
                }
                state = core.writer.cond.wait(state).unwrap();
            }
            let images: Vec<ChapterImage> = state
                .images
                .iter_mut()
                .map(|slot| slot.take().unwrap_or(ChapterImage { records: Vec::new() }))
                .collect();
            (images, state.newest_chapter)
        };

        // The saved open chapter is about to be written to the volume, so
        // a crash must not reload it from the save slot.
        if core.has_saved_open_chapter.swap(false, Ordering::SeqCst) {
            let mut layout = core.layout.lock().unwrap();
            if let Some((slot, _)) = layout.find_latest_save(None) {
                if let Err(e) = layout.discard_open_chapter(slot) {
                    error!(error = %e, "could not discard the saved open chapter");
                }
            }
        }

        let result = close_chapter(&core, &mut chapter_index, images, virtual_chapter);
        if let Err(e) = &result {
            error!(chapter = virtual_chapter, error = %e, "chapter write failed");
            core.disabled.store(true, Ordering::SeqCst);
        }

        let mut state = core.writer.state.lock().unwrap();
        state.newest_chapter += 1;
        state.oldest_chapter += core
            .geometry
            .chapters_to_expire(state.newest_chapter) as u64;
        if result.is_err() {
            state.result = result;
        }
        state.zones_to_write = 0;
        core.writer.cond.notify_all();
    }
}

/// Collate the per-zone images into one chapter and write it.
fn close_chapter(
    core: &IndexCore,
    chapter_index: &mut OpenChapterIndex,
    images: Vec<ChapterImage>,
    virtual_chapter: u64,
) -> Result<()> {
    let geometry = &core.geometry;
    chapter_index.empty(virtual_chapter);

    // Find a record to stand in for deleted records and to fill the
    // chapter if it closed early: the last live record of any full zone.
    let fill_record = images
        .iter()
        .flat_map(|image| image.records.iter().rev())
        .find(|(_, deleted)| !deleted)
        .map(|(record, _)| *record)
        .ok_or_else(|| errstate!("no zone contributed a live record to the chapter"))?;

    let zone_count = images.len() as u32;
    let mut collated: Vec<ChunkRecord> =
        Vec::with_capacity(geometry.records_per_chapter as usize);
    let mut overflows = 0u32;
    let mut records_added = 0u32;
    let mut zone = 0u32;
    for page in 0..geometry.record_pages_per_chapter {
        for _ in 0..geometry.records_per_page {
            let record_number = 1 + records_added / zone_count;
            let image = &images[zone as usize];
            let record = match image.get(record_number) {
                Some((record, false)) => {
                    match chapter_index.put_record(geometry, &record.name, page) {
                        Ok(()) => {}
                        Err(Error::Overflow) => overflows += 1,
                        Err(e) => return Err(e),
                    }
                    *record
                }
                // The zone is exhausted or the record was deleted.
                _ => fill_record,
            };
            collated.push(record);
            records_added += 1;
            zone = (zone + 1) % zone_count;
        }
    }
    if overflows > 0 {
        info!(
            chapter = virtual_chapter,
            overflows, "chapter index dropped entries on overflow"
        );
    }

    core.volume.write_chapter(chapter_index, &collated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::testing::small_dense;
    use crate::name::ChunkName;

    #[test]
    fn test_image_capture_preserves_order_and_marks() {
        let geometry = small_dense();
        let mut chapter = OpenChapter::new(&geometry, 1).unwrap();
        for i in 0..5u32 {
            let mut name = ChunkName::new([0u8; 16]);
            name.set_chapter_index_bytes(i as u64 + 1);
            chapter.put(&name, &[i as u8; 16]).unwrap();
        }
        let mut deleted = ChunkName::new([0u8; 16]);
        deleted.set_chapter_index_bytes(3);
        chapter.remove(&deleted);

        let image = ChapterImage::capture(&chapter);
        assert_eq!(image.len(), 5);
        assert!(image.get(3).unwrap().1, "third record must be marked deleted");
        assert!(!image.get(1).unwrap().1);
        assert_eq!(image.get(1).unwrap().0.data, [0u8; 16]);
        assert!(image.get(6).is_none());
    }

    #[test]
    fn test_writer_window_tracking() {
        let writer = ChapterWriter::new(2);
        writer.set_window(3, 9);
        assert_eq!(writer.window(), (3, 9));
        // A zone that has not raced ahead does not block.
        writer.finish_previous_chapter(9).unwrap();
    }
}

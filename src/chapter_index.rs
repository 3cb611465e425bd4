//! The chapter index: a delta index mapping chapter addresses to record
//! pages.
//!
//! While a chapter accumulates in memory, the chapter writer builds an
//! [`OpenChapterIndex`] mapping each record's chapter delta address to the
//! record page that will hold it. When the chapter closes, the index is
//! packed into the chapter's leading index pages; those pages are decoded
//! back into [`DeltaIndexPage`]s by lookups and by the sparse cache.

use tracing::warn;

use crate::delta_index::page::{pack_page, DeltaIndexPage};
use crate::delta_index::DeltaIndex;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::name::ChunkName;

/// The in-memory index of the chapter currently being closed.
pub struct OpenChapterIndex {
    delta_index: DeltaIndex,
    volume_nonce: u64,
    /// The virtual chapter this index is being built for.
    pub virtual_chapter: u64,
}

impl OpenChapterIndex {
    pub fn new(geometry: &Geometry, volume_nonce: u64) -> Self {
        OpenChapterIndex {
            delta_index: DeltaIndex::new(
                geometry.delta_lists_per_chapter,
                geometry.chapter_mean_delta,
                geometry.chapter_payload_bits,
            ),
            volume_nonce,
            virtual_chapter: 0,
        }
    }

    /// Discard all entries and rebind the index to a new chapter.
    pub fn empty(&mut self, virtual_chapter: u64) {
        self.delta_index.empty();
        self.virtual_chapter = virtual_chapter;
    }

    /// The number of records indexed.
    pub fn record_count(&self) -> u64 {
        self.delta_index.stats().record_count
    }

    /// Add an entry mapping `name` to `page_number`.
    pub fn put_record(
        &mut self,
        geometry: &Geometry,
        name: &ChunkName,
        page_number: u32,
    ) -> Result<()> {
        if page_number >= geometry.record_pages_per_chapter {
            return Err(crate::errinput!(
                "page number {page_number} exceeds the record pages per chapter"
            ));
        }
        let address = name.chapter_delta_address(geometry);
        let list = name.chapter_delta_list(geometry);
        let entry = self.delta_index.get_entry(list, address, name.as_bytes())?;
        let found = !entry.at_end && entry.key == address;
        if found && entry.is_collision {
            return Err(crate::errstate!(
                "chunk appears more than once in chapter {}",
                self.virtual_chapter
            ));
        }
        let collision_name = if found { Some(name.as_bytes()) } else { None };
        self.delta_index
            .put_entry(list, &entry, address, page_number, collision_name)
    }

    /// Pack the lists starting at `first_list` onto one index page,
    /// removing whole delta lists if the final page cannot otherwise hold
    /// the remainder. Returns the number of lists packed.
    pub fn pack_page(
        &mut self,
        geometry: &Geometry,
        memory: &mut [u8],
        first_list: u32,
        last_page: bool,
    ) -> Result<u32> {
        let mut removals = 0u32;
        let packed = loop {
            let packed = pack_page(
                &self.delta_index,
                self.volume_nonce,
                self.virtual_chapter,
                first_list,
                memory,
            )?;
            if first_list + packed == geometry.delta_lists_per_chapter {
                // All lists are packed.
                break packed;
            } else if packed == 0 {
                // The next delta list does not fit on a page at all; its
                // entries will be removed.
            } else if last_page {
                // This is the last page and lists are left over: everything
                // remaining must fit, so shed entries until it does.
            } else {
                // This page is done; the rest go on later pages.
                break packed;
            }

            if removals == 0 {
                let stats = self.delta_index.stats();
                warn!(
                    chapter = self.virtual_chapter,
                    records = stats.record_count,
                    collisions = stats.collision_count,
                    "chapter index is too large for its index pages"
                );
            }

            // Find a list with entries to drain: try the first list that
            // did not fit, falling back toward lists that did.
            let mut candidate = first_list as i64 + packed as i64;
            let mut entry = loop {
                if candidate < first_list as i64 {
                    return Err(Error::Overflow);
                }
                let list_number = candidate as u32;
                let mut entry = self.delta_index.start_search(list_number, 0)?;
                self.delta_index.next_entry(list_number, &mut entry)?;
                if !entry.at_end {
                    break entry;
                }
                candidate -= 1;
            };
            let list_number = candidate as u32;
            loop {
                entry = self.delta_index.remove_entry(list_number, &entry)?;
                removals += 1;
                if entry.at_end {
                    break;
                }
            }
        };

        if removals > 0 {
            warn!(
                chapter = self.virtual_chapter,
                removals, "removed entries to avoid chapter index page overflow"
            );
        }
        Ok(packed)
    }
}

/// Search a decoded chapter index page for `name`. Returns the record page
/// number cited by the chapter index, or `None`.
pub fn search_chapter_index_page(
    page: &DeltaIndexPage,
    geometry: &Geometry,
    name: &ChunkName,
) -> Result<Option<u32>> {
    let address = name.chapter_delta_address(geometry);
    let list = name.chapter_delta_list(geometry);
    page.search(list, address, name.as_bytes())
}

/// Decode one chapter index page read from the volume.
pub fn decode_chapter_index_page(
    memory: Vec<u8>,
    geometry: &Geometry,
    volume_nonce: u64,
) -> Result<DeltaIndexPage> {
    DeltaIndexPage::decode(
        memory,
        volume_nonce,
        geometry.chapter_mean_delta,
        geometry.chapter_payload_bits,
    )
}

/// Fully validate a chapter index page, walking every list.
pub fn validate_chapter_index_page(page: &DeltaIndexPage, geometry: &Geometry) -> Result<()> {
    page.validate(geometry.record_pages_per_chapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::testing::small_sparse;

    fn synthetic_name(geometry: &Geometry, list: u32, address: u32) -> ChunkName {
        let mut name = ChunkName::new([0u8; 16]);
        let value = ((list as u64) << geometry.chapter_address_bits) | address as u64;
        name.set_chapter_index_bytes(value);
        name
    }

    #[test]
    fn test_put_pack_search() {
        let geometry = small_sparse();
        let mut index = OpenChapterIndex::new(&geometry, 0xcafe);
        index.empty(3);

        let mut names = Vec::new();
        for i in 0..geometry.records_per_chapter {
            let name = synthetic_name(&geometry, 0, 1000 + i * 17);
            let page = i / geometry.records_per_page;
            index.put_record(&geometry, &name, page).unwrap();
            names.push((name, page));
        }
        assert_eq!(index.record_count(), geometry.records_per_chapter as u64);

        let mut memory = vec![0u8; geometry.bytes_per_page];
        let packed = index.pack_page(&geometry, &mut memory, 0, true).unwrap();
        assert_eq!(packed, geometry.delta_lists_per_chapter);

        let page = decode_chapter_index_page(memory, &geometry, 0xcafe).unwrap();
        assert_eq!(page.virtual_chapter, 3);
        validate_chapter_index_page(&page, &geometry).unwrap();

        for (name, expected_page) in &names {
            let found = search_chapter_index_page(&page, &geometry, name).unwrap();
            assert_eq!(found, Some(*expected_page));
        }
        let missing = synthetic_name(&geometry, 0, 3);
        assert_eq!(
            search_chapter_index_page(&page, &geometry, &missing).unwrap(),
            None
        );
    }

    #[test]
    fn test_duplicate_name_in_chapter_rejected() {
        let geometry = small_sparse();
        let mut index = OpenChapterIndex::new(&geometry, 1);
        let name = synthetic_name(&geometry, 0, 500);
        index.put_record(&geometry, &name, 0).unwrap();
        // The same name again creates a collision entry.
        index.put_record(&geometry, &name, 1).unwrap();
        // A third copy of the identical name is a duplicate.
        assert!(index.put_record(&geometry, &name, 2).is_err());
    }

    #[test]
    fn test_wrong_nonce_is_invalid() {
        let geometry = small_sparse();
        let mut index = OpenChapterIndex::new(&geometry, 7);
        let name = synthetic_name(&geometry, 0, 9);
        index.put_record(&geometry, &name, 0).unwrap();
        let mut memory = vec![0u8; geometry.bytes_per_page];
        index.pack_page(&geometry, &mut memory, 0, true).unwrap();
        assert!(decode_chapter_index_page(memory, &geometry, 8).is_err());
    }
}

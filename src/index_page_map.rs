//! The index page map: which index page of a chapter covers which delta
//! lists.
//!
//! Each chapter's index is split across `index_pages_per_chapter` pages,
//! each holding a contiguous run of delta lists. The map records, for every
//! `(chapter, index_page)`, the highest delta list on that page, so a
//! lookup can jump straight to the page that owns a name's list without
//! touching the others. The map is rebuilt from the pages' own headers
//! during rebuild, and snapshotted into every save slot.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::name::ChunkName;

pub struct IndexPageMap {
    entries_per_chapter: u32,
    /// `[chapter][index_page] → highest delta list`, flattened.
    entries: Vec<u16>,
    /// The VCN of the most recent update, to observe rebuild progress.
    last_update: u64,
}

impl IndexPageMap {
    pub fn new(geometry: &Geometry) -> Self {
        let entries_per_chapter = geometry.index_pages_per_chapter;
        IndexPageMap {
            entries_per_chapter,
            entries: vec![0u16; (entries_per_chapter * geometry.chapters_per_volume) as usize],
            last_update: 0,
        }
    }

    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    fn slot(&self, chapter: u32, index_page: u32) -> usize {
        (chapter * self.entries_per_chapter + index_page) as usize
    }

    /// Record that `index_page` of `chapter` covers delta lists up to and
    /// including `highest_list`.
    pub fn update(
        &mut self,
        virtual_chapter: u64,
        chapter: u32,
        index_page: u32,
        highest_list: u32,
    ) -> Result<()> {
        if index_page >= self.entries_per_chapter {
            return Err(Error::OutOfRange(format!(
                "index page {index_page} out of range"
            )));
        }
        let slot = self.slot(chapter, index_page);
        self.entries[slot] = highest_list as u16;
        self.last_update = virtual_chapter;
        Ok(())
    }

    /// The index page of `chapter` that covers the delta list of `name`.
    pub fn find_index_page(&self, geometry: &Geometry, chapter: u32, name: &ChunkName) -> u32 {
        let list = name.chapter_delta_list(geometry);
        self.find_index_page_for_list(chapter, list)
    }

    pub fn find_index_page_for_list(&self, chapter: u32, list: u32) -> u32 {
        let base = self.slot(chapter, 0);
        let entries = &self.entries[base..base + self.entries_per_chapter as usize];
        // The first page whose highest list reaches the target owns it. A
        // page may hold no lists at all, so equal neighbors are possible
        // and the scan must take the earliest.
        for (page, highest) in entries.iter().enumerate() {
            if *highest as u32 >= list {
                return page as u32;
            }
        }
        self.entries_per_chapter - 1
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<LittleEndian>(self.last_update)?;
        writer.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            writer.write_u16::<LittleEndian>(*entry)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> Result<()> {
        let last_update = reader.read_u64::<LittleEndian>()?;
        let count = reader.read_u32::<LittleEndian>()? as usize;
        if count != self.entries.len() {
            return Err(Error::CorruptComponent(format!(
                "index page map geometry changed: saved {count} entries, expected {}",
                self.entries.len()
            )));
        }
        for entry in &mut self.entries {
            *entry = reader.read_u16::<LittleEndian>()?;
        }
        self.last_update = last_update;
        Ok(())
    }
}

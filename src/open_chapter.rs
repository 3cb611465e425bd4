//! The open chapter: a zone's in-memory staging area for new records.
//!
//! Each zone owns one open chapter that absorbs puts until it reaches
//! capacity (`records_per_chapter / zone_count`). Records live in a dense
//! array in insertion order (the chapter writer packs them from here), with
//! a hash-addressed slot table on top for lookup:
//!
//! - Slots are probed quadratically from the name's hash. A power-of-two
//!   slot count at least twice the capacity guarantees insertion never
//!   fails while the chapter has room.
//! - Record numbers are 1-based; a slot holding 0 is empty and terminates
//!   a probe chain.
//! - `remove` marks the record deleted but leaves the slot chain intact;
//!   deleted slots are reclaimed when the chapter is reset.
//!
//! A snapshot of every zone's open chapter is written during a clean save
//! and restored by replaying the records through `put`.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::geometry::{Geometry, OPEN_CHAPTER_LOAD_RATIO};
use crate::name::{bits_for, ChunkData, ChunkName, CHUNK_NAME_SIZE, METADATA_SIZE};
use crate::record_page::ChunkRecord;

const SNAPSHOT_MAGIC: u32 = 0x434f_4348; // "COCH"
const SNAPSHOT_VERSION: u32 = 2;

fn next_power_of_two(value: usize) -> usize {
    if value == 0 {
        1
    } else {
        1 << bits_for(value as u64 - 1)
    }
}

/// A zone's open chapter.
pub struct OpenChapter {
    /// The maximum number of records this zone's share of a chapter holds.
    capacity: u32,
    slot_count: u32,
    /// Hash slots holding 1-based record numbers; 0 is empty.
    slots: Vec<u32>,
    /// Records in insertion order. Index 0 is unused.
    records: Vec<ChunkRecord>,
    /// Deletion marks, indexed by record number.
    deleted: Vec<bool>,
    size: u32,
    deleted_count: u32,
}

impl OpenChapter {
    pub fn new(geometry: &Geometry, zone_count: u32) -> Result<Self> {
        if zone_count == 0 {
            return Err(crate::errinput!("zone count must be greater than zero"));
        }
        if geometry.records_per_chapter < zone_count {
            return Err(crate::errinput!(
                "zone count {zone_count} is larger than the records per chapter {}",
                geometry.records_per_chapter
            ));
        }
        let capacity = geometry.records_per_chapter / zone_count;
        let slot_count =
            next_power_of_two(capacity as usize * OPEN_CHAPTER_LOAD_RATIO) as u32;
        let empty = ChunkRecord::new(ChunkName::new([0u8; CHUNK_NAME_SIZE]), [0u8; METADATA_SIZE]);
        Ok(OpenChapter {
            capacity,
            slot_count,
            slots: vec![0u32; slot_count as usize],
            records: vec![empty; capacity as usize + 1],
            deleted: vec![false; capacity as usize + 1],
            size: 0,
            deleted_count: 0,
        })
    }

    /// The number of live records.
    pub fn record_count(&self) -> u32 {
        self.size - self.deleted_count
    }

    /// The number of records inserted, including deleted ones.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Reset to empty for reuse as the next chapter.
    pub fn reset(&mut self) {
        self.size = 0;
        self.deleted_count = 0;
        self.slots.fill(0);
        self.deleted.fill(false);
    }

    /// Probe the slot chain for `name`. Returns the slot index holding the
    /// record, or the empty slot that terminates the chain.
    fn probe(&self, name: &ChunkName) -> (usize, u32) {
        let slots = self.slot_count as usize;
        let mut probe = name.hash_slot(slots);
        let mut attempts = 1usize;
        loop {
            let record_number = self.slots[probe];
            if record_number == 0 {
                return (probe, 0);
            }
            let record = &self.records[record_number as usize];
            if record.name == *name && !self.deleted[record_number as usize] {
                return (probe, record_number);
            }
            // Quadratic probing performs better than linear for a
            // power-of-two slot count.
            probe = (probe + attempts) % slots;
            attempts += 1;
        }
    }

    /// Search for `name`, returning its metadata.
    pub fn search(&self, name: &ChunkName) -> Option<ChunkData> {
        let (_, record_number) = self.probe(name);
        if record_number == 0 {
            None
        } else {
            Some(self.records[record_number as usize].data)
        }
    }

    /// Insert or overwrite `name`, returning the remaining capacity.
    /// A full chapter reports zero remaining without inserting; the caller
    /// must have closed the chapter before that happens.
    pub fn put(&mut self, name: &ChunkName, metadata: &ChunkData) -> Result<u32> {
        let (slot, record_number) = self.probe(name);
        if record_number != 0 {
            self.records[record_number as usize].data = *metadata;
            return Ok(self.capacity - self.size);
        }
        if self.size >= self.capacity {
            return Err(Error::Overflow);
        }
        self.size += 1;
        let record_number = self.size;
        self.slots[slot] = record_number;
        self.records[record_number as usize] = ChunkRecord::new(*name, *metadata);
        Ok(self.capacity - self.size)
    }

    /// Mark `name` deleted. Returns whether it was present.
    pub fn remove(&mut self, name: &ChunkName) -> bool {
        let (_, record_number) = self.probe(name);
        if record_number == 0 {
            return false;
        }
        // Mark the record deleted so search won't find it and the chapter
        // writer won't index it; the slot chain stays intact.
        self.deleted[record_number as usize] = true;
        self.deleted_count += 1;
        true
    }

    /// The record with 1-based number `number`, with its deletion mark.
    pub fn record(&self, number: u32) -> (&ChunkRecord, bool) {
        (&self.records[number as usize], self.deleted[number as usize])
    }

    /// Write a snapshot of the live records.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(SNAPSHOT_MAGIC)?;
        writer.write_u32::<LittleEndian>(SNAPSHOT_VERSION)?;
        writer.write_u32::<LittleEndian>(self.record_count())?;
        for number in 1..=self.size {
            if self.deleted[number as usize] {
                continue;
            }
            let record = &self.records[number as usize];
            writer.write_all(record.name.as_bytes())?;
            writer.write_all(&record.data)?;
        }
        Ok(())
    }

    /// Restore a snapshot written by [`OpenChapter::write_to`].
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> Result<()> {
        let magic = reader.read_u32::<LittleEndian>()?;
        let version = reader.read_u32::<LittleEndian>()?;
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::CorruptComponent("open chapter magic".to_string()));
        }
        if version != SNAPSHOT_VERSION {
            return Err(Error::CorruptComponent(format!(
                "open chapter version {version} unsupported"
            )));
        }
        let count = reader.read_u32::<LittleEndian>()?;
        if count > self.capacity {
            return Err(Error::CorruptComponent(format!(
                "open chapter snapshot of {count} records exceeds capacity {}",
                self.capacity
            )));
        }
        self.reset();
        for _ in 0..count {
            let mut name = [0u8; CHUNK_NAME_SIZE];
            reader.read_exact(&mut name)?;
            let mut data: ChunkData = [0u8; METADATA_SIZE];
            reader.read_exact(&mut data)?;
            self.put(&ChunkName::new(name), &data)?;
        }
        Ok(())
    }
}

//! Immutable delta-index pages.
//!
//! A closed chapter's index is written as one or more immutable pages. Each
//! page holds a contiguous run of delta lists, packed back to back:
//!
//! ```text
//! +--------------------------------------------------+
//! | nonce: u64 | vcn: u64 | first_list | list_count  |  20-byte header
//! +--------------------------------------------------+
//! | (list_count + 1) x 19-bit list start offsets     |
//! +--------------------------------------------------+
//! | packed delta list bit streams                    |
//! +--------------------------------------------------+
//! | 0xff guard bytes                                 |
//! +--------------------------------------------------+
//! ```
//!
//! Offsets are absolute bit offsets within the page, so the size of list
//! `i` is `start[i + 1] - start[i]`. The nonce ties the page to its volume;
//! a mismatch is expected during rebuild of a volume that has never wrapped
//! and is reported as [`Error::CorruptComponent`], not logged.

use byteorder::{ByteOrder, LittleEndian};

use super::bits::{self, get_field, set_field, PAGE_GUARD_BYTES};
use super::{decode_next, Coding, DeltaEntry, DeltaIndex};
use crate::error::{Error, Result};
use crate::name::CHUNK_NAME_SIZE;

/// The bits in each packed list start offset.
pub const IMMUTABLE_HEADER_BITS: u32 = 19;

/// The bytes in the fixed page header.
pub const PAGE_HEADER_BYTES: usize = 20;

fn header_offset(list_number: u32) -> u64 {
    (PAGE_HEADER_BYTES * 8) as u64 + list_number as u64 * IMMUTABLE_HEADER_BITS as u64
}

fn list_start(memory: &[u8], list_number: u32) -> u32 {
    get_field(memory, header_offset(list_number), IMMUTABLE_HEADER_BITS) as u32
}

fn set_list_start(memory: &mut [u8], list_number: u32, start: u32) {
    set_field(start as u64, memory, header_offset(list_number), IMMUTABLE_HEADER_BITS);
}

/// A decoded, validated, immutable delta-index page.
#[derive(Clone)]
pub struct DeltaIndexPage {
    memory: Vec<u8>,
    coding: Coding,
    /// The virtual chapter this page belongs to.
    pub virtual_chapter: u64,
    /// The first delta list stored on this page.
    pub lowest_list: u32,
    /// The last delta list stored on this page.
    pub highest_list: u32,
}

impl DeltaIndexPage {
    /// Decode a page, verifying its structure and nonce.
    pub fn decode(
        memory: Vec<u8>,
        expected_nonce: u64,
        mean_delta: u32,
        value_bits: u32,
    ) -> Result<Self> {
        if memory.len() < PAGE_HEADER_BYTES + PAGE_GUARD_BYTES {
            return Err(Error::CorruptComponent(
                "delta index page is too small".to_string(),
            ));
        }
        let nonce = LittleEndian::read_u64(&memory[0..8]);
        let virtual_chapter = LittleEndian::read_u64(&memory[8..16]);
        let first_list = LittleEndian::read_u16(&memory[16..18]) as u32;
        let list_count = LittleEndian::read_u16(&memory[18..20]) as u32;

        verify_page(&memory, nonce, expected_nonce, list_count)?;

        Ok(DeltaIndexPage {
            memory,
            coding: Coding::new(mean_delta, value_bits),
            virtual_chapter,
            lowest_list: first_list,
            // A trailing page may hold no lists at all; the wrapping
            // arithmetic leaves highest < lowest so every lookup misses.
            highest_list: first_list.wrapping_add(list_count).wrapping_sub(1),
        })
    }

    fn list_bounds(&self, list_number: u32) -> Result<(u64, u32)> {
        if list_number < self.lowest_list || list_number > self.highest_list {
            return Err(Error::CorruptData(format!(
                "list {list_number} is not on this page ({}..={})",
                self.lowest_list, self.highest_list
            )));
        }
        let sub_list = list_number - self.lowest_list;
        let start = list_start(&self.memory, sub_list);
        let end = list_start(&self.memory, sub_list + 1);
        Ok((start as u64, end - start))
    }

    /// Search a list on this page for `key`, resolving collisions against
    /// `name`. Returns the entry's value if found.
    pub fn search(
        &self,
        list_number: u32,
        key: u32,
        name: &[u8; CHUNK_NAME_SIZE],
    ) -> Result<Option<u32>> {
        let (start, size) = self.list_bounds(list_number)?;
        let mut entry = DeltaEntry {
            key: 0,
            delta: 0,
            offset: 0,
            entry_bits: 0,
            at_end: false,
            is_collision: false,
        };
        loop {
            decode_next(&self.memory, start, size, &self.coding, &mut entry)?;
            if entry.at_end || key < entry.key {
                return Ok(None);
            }
            if key == entry.key {
                break;
            }
        }

        if !entry.is_collision {
            // The head entry for this key. If its collision followers
            // include an exact name match, that entry wins; otherwise the
            // head stands for the address.
            let mut follower = entry;
            loop {
                decode_next(&self.memory, start, size, &self.coding, &mut follower)?;
                if follower.at_end || !follower.is_collision {
                    break;
                }
                let mut stored = [0u8; CHUNK_NAME_SIZE];
                bits::get_bytes(
                    &self.memory,
                    start + (follower.offset + follower.entry_bits - super::COLLISION_BITS) as u64,
                    &mut stored,
                );
                if stored == *name {
                    entry = follower;
                    break;
                }
            }
        }

        let value = get_field(
            &self.memory,
            start + entry.offset as u64,
            self.coding.value_bits,
        ) as u32;
        Ok(Some(value))
    }

    /// Walk every list on the page, checking that the coded stream is
    /// self-consistent and every value is below `max_value`.
    pub fn validate(&self, max_value: u32) -> Result<()> {
        for list_number in self.lowest_list..=self.highest_list {
            let (start, size) = self.list_bounds(list_number)?;
            let mut entry = DeltaEntry {
                key: 0,
                delta: 0,
                offset: 0,
                entry_bits: 0,
                at_end: false,
                is_collision: false,
            };
            loop {
                // A random bit stream is likely to fail here, so map decode
                // errors to a component-level corruption.
                decode_next(&self.memory, start, size, &self.coding, &mut entry)
                    .map_err(|_| Error::CorruptComponent("chapter index page".to_string()))?;
                if entry.at_end {
                    break;
                }
                let value =
                    get_field(&self.memory, start + entry.offset as u64, self.coding.value_bits)
                        as u32;
                if value >= max_value {
                    // Happens in normal operation during a rebuild of a
                    // volume that has not yet wrapped.
                    return Err(Error::CorruptComponent(
                        "chapter index page value out of range".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn verify_page(memory: &[u8], nonce: u64, expected_nonce: u64, list_count: u32) -> Result<()> {
    let corrupt = || Error::CorruptComponent("delta index page".to_string());

    // A nonce mismatch happens during rebuild when the volume has never
    // been fully written; treat it like any other invalid page.
    if nonce != expected_nonce {
        return Err(corrupt());
    }
    let usable_bits = (memory.len() - PAGE_GUARD_BYTES) as u64 * 8;
    if header_offset(list_count + 1) > usable_bits {
        return Err(corrupt());
    }
    // The first list must start immediately after the last offset slot.
    if list_start(memory, 0) as u64 != header_offset(list_count + 1) {
        return Err(corrupt());
    }
    // The lists must be in order and end within the page.
    for i in 0..list_count {
        if list_start(memory, i) > list_start(memory, i + 1) {
            return Err(corrupt());
        }
    }
    if list_start(memory, list_count) as u64 > usable_bits {
        return Err(corrupt());
    }
    // The guard bytes must be all ones.
    if memory[memory.len() - PAGE_GUARD_BYTES..].iter().any(|&b| b != 0xff) {
        return Err(corrupt());
    }
    Ok(())
}

/// Pack delta lists from a mutable index onto an immutable page, starting
/// with `first_list`. Returns the number of lists that fit.
pub fn pack_page(
    index: &DeltaIndex,
    nonce: u64,
    virtual_chapter: u64,
    first_list: u32,
    memory: &mut [u8],
) -> Result<u32> {
    if first_list > index.list_count() {
        return Err(crate::errstate!(
            "cannot pack starting past the end of the index"
        ));
    }
    let max_lists = index.list_count() - first_list;

    // Compute how many lists fit: subtract the fixed header, one offset
    // slot, and the guard bytes from the page size.
    let mut available = (memory.len() - PAGE_HEADER_BYTES - PAGE_GUARD_BYTES) as i64 * 8
        - IMMUTABLE_HEADER_BITS as i64;
    if available < IMMUTABLE_HEADER_BITS as i64 {
        return Err(Error::Overflow);
    }
    let mut list_count = 0u32;
    while list_count < max_lists {
        let (_, size_bits) = index.list_bits(first_list + list_count);
        let needed = IMMUTABLE_HEADER_BITS as i64 + size_bits as i64;
        if needed > available {
            break;
        }
        list_count += 1;
        available -= needed;
    }

    memory.fill(0);
    LittleEndian::write_u64(&mut memory[0..8], nonce);
    LittleEndian::write_u64(&mut memory[8..16], virtual_chapter);
    LittleEndian::write_u16(&mut memory[16..18], first_list as u16);
    LittleEndian::write_u16(&mut memory[18..20], list_count as u16);

    // The offset table, then the list data.
    let mut offset = header_offset(list_count + 1) as u32;
    set_list_start(memory, 0, offset);
    for i in 0..list_count {
        let (_, size_bits) = index.list_bits(first_list + i);
        offset += size_bits;
        set_list_start(memory, i + 1, offset);
    }
    for i in 0..list_count {
        let (list_memory, size_bits) = index.list_bits(first_list + i);
        bits::copy_bits(
            list_memory,
            0,
            memory,
            list_start(memory, i) as u64,
            size_bits,
        );
    }

    let guard_start = memory.len() - PAGE_GUARD_BYTES;
    memory[guard_start..].fill(0xff);
    Ok(list_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(byte: u8) -> [u8; CHUNK_NAME_SIZE] {
        [byte; CHUNK_NAME_SIZE]
    }

    fn build_index(list_count: u32) -> DeltaIndex {
        let mut index = DeltaIndex::new(list_count, 1024, 6);
        for list in 0..list_count {
            for key in (0..2000u32).step_by(37) {
                let entry = index.get_entry(list, key, &name(0)).unwrap();
                index.put_entry(list, &entry, key, (key + list) % 60, None).unwrap();
            }
        }
        index
    }

    #[test]
    fn test_pack_and_search() {
        let index = build_index(4);
        let mut memory = vec![0u8; 4096];
        let packed = pack_page(&index, 0x1234, 7, 0, &mut memory).unwrap();
        assert_eq!(packed, 4, "small lists must all fit on one page");

        let page = DeltaIndexPage::decode(memory, 0x1234, 1024, 6).unwrap();
        assert_eq!(page.virtual_chapter, 7);
        assert_eq!(page.lowest_list, 0);
        assert_eq!(page.highest_list, 3);

        for list in 0..4u32 {
            for key in (0..2000u32).step_by(37) {
                let value = page.search(list, key, &name(0)).unwrap();
                assert_eq!(value, Some((key + list) % 60), "list {list} key {key}");
            }
            assert_eq!(page.search(list, 38, &name(0)).unwrap(), None);
        }
    }

    #[test]
    fn test_pack_splits_across_pages() {
        let index = build_index(8);
        // A page too small for all eight lists.
        let mut memory = vec![0u8; 512];
        let packed = pack_page(&index, 9, 3, 0, &mut memory).unwrap();
        assert!(packed > 0 && packed < 8);

        let page = DeltaIndexPage::decode(memory, 9, 1024, 6).unwrap();
        assert_eq!(page.lowest_list, 0);
        assert_eq!(page.highest_list, packed - 1);

        // The remainder packs onto a second page.
        let mut memory = vec![0u8; 4096];
        let rest = pack_page(&index, 9, 3, packed, &mut memory).unwrap();
        assert_eq!(packed + rest, 8);
        let page2 = DeltaIndexPage::decode(memory, 9, 1024, 6).unwrap();
        assert_eq!(page2.lowest_list, packed);
        let key = 37 * 3;
        assert_eq!(page2.search(packed, key, &name(0)).unwrap(), Some((key + packed) % 60));
    }

    #[test]
    fn test_nonce_mismatch_rejected() {
        let index = build_index(1);
        let mut memory = vec![0u8; 1024];
        pack_page(&index, 42, 0, 0, &mut memory).unwrap();
        assert!(DeltaIndexPage::decode(memory, 43, 1024, 6).is_err());
    }

    #[test]
    fn test_garbage_page_rejected() {
        let memory = vec![0xa5u8; 1024];
        assert!(DeltaIndexPage::decode(memory, 0, 1024, 6).is_err());
    }

    #[test]
    fn test_collision_entries_survive_packing() {
        let mut index = DeltaIndex::new(1, 1024, 6);
        let entry = index.get_entry(0, 77, &name(1)).unwrap();
        index.put_entry(0, &entry, 77, 1, None).unwrap();
        let entry = index.get_entry(0, 77, &name(2)).unwrap();
        index.put_entry(0, &entry, 77, 2, Some(&name(2))).unwrap();

        let mut memory = vec![0u8; 1024];
        pack_page(&index, 1, 0, 0, &mut memory).unwrap();
        let page = DeltaIndexPage::decode(memory, 1, 1024, 6).unwrap();
        assert_eq!(page.search(0, 77, &name(2)).unwrap(), Some(2));
        assert_eq!(page.search(0, 77, &name(1)).unwrap(), Some(1));
    }

    #[test]
    fn test_validate() {
        let index = build_index(2);
        let mut memory = vec![0u8; 4096];
        pack_page(&index, 5, 0, 0, &mut memory).unwrap();
        let page = DeltaIndexPage::decode(memory, 5, 1024, 6).unwrap();
        assert!(page.validate(60).is_ok());
        // Values reach 59, so a tighter bound must fail validation.
        assert!(page.validate(10).is_err());
    }
}

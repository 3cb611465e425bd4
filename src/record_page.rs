//! Record pages: the sorted name/metadata arrays of a closed chapter.
//!
//! ## Page Format
//!
//! ```text
//! +----------------------------------+
//! | record 0: name (16) | data (16)  |
//! +----------------------------------+
//! | record 1: name (16) | data (16)  |
//! +----------------------------------+
//! | ...                              |
//! +----------------------------------+
//! ```
//!
//! Records are sorted ascending by name so a lookup is a binary search
//! within the page. Unused page tail bytes are zero.

use crate::error::{Error, Result};
use crate::geometry::BYTES_PER_RECORD;
use crate::name::{ChunkData, ChunkName, CHUNK_NAME_SIZE};

/// A name/metadata pair as stored in a chapter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChunkRecord {
    pub name: ChunkName,
    pub data: ChunkData,
}

impl ChunkRecord {
    pub fn new(name: ChunkName, data: ChunkData) -> Self {
        ChunkRecord { name, data }
    }
}

/// Encode one record page from the records destined for it. The records
/// are sorted by name into the page image.
pub fn encode_record_page(records: &[ChunkRecord], page: &mut [u8]) -> Result<()> {
    if records.len() * BYTES_PER_RECORD > page.len() {
        return Err(Error::OutOfRange(format!(
            "{} records do not fit on a {}-byte page",
            records.len(),
            page.len()
        )));
    }
    let mut sorted: Vec<&ChunkRecord> = records.iter().collect();
    sorted.sort_unstable_by(|a, b| a.name.cmp(&b.name));

    for (i, record) in sorted.iter().enumerate() {
        let offset = i * BYTES_PER_RECORD;
        page[offset..offset + CHUNK_NAME_SIZE].copy_from_slice(record.name.as_bytes());
        page[offset + CHUNK_NAME_SIZE..offset + BYTES_PER_RECORD].copy_from_slice(&record.data);
    }
    for byte in page.iter_mut().skip(records.len() * BYTES_PER_RECORD) {
        *byte = 0;
    }
    Ok(())
}

/// Binary search a record page for `name`, returning its metadata.
pub fn search_record_page(page: &[u8], name: &ChunkName, records_per_page: u32) -> Option<ChunkData> {
    let mut low = 0u32;
    let mut high = records_per_page;
    while low < high {
        let mid = (low + high) / 2;
        let offset = mid as usize * BYTES_PER_RECORD;
        let candidate = &page[offset..offset + CHUNK_NAME_SIZE];
        match candidate.cmp(name.as_bytes().as_slice()) {
            std::cmp::Ordering::Equal => {
                let mut data: ChunkData = [0u8; 16];
                data.copy_from_slice(&page[offset + CHUNK_NAME_SIZE..offset + BYTES_PER_RECORD]);
                return Some(data);
            }
            std::cmp::Ordering::Less => low = mid + 1,
            std::cmp::Ordering::Greater => high = mid,
        }
    }
    None
}

/// Decode every record on a page, for rebuild replay.
pub fn records_on_page(page: &[u8], records_per_page: u32) -> Vec<ChunkRecord> {
    let mut records = Vec::with_capacity(records_per_page as usize);
    for i in 0..records_per_page as usize {
        let offset = i * BYTES_PER_RECORD;
        let mut name = [0u8; CHUNK_NAME_SIZE];
        name.copy_from_slice(&page[offset..offset + CHUNK_NAME_SIZE]);
        let mut data: ChunkData = [0u8; 16];
        data.copy_from_slice(&page[offset + CHUNK_NAME_SIZE..offset + BYTES_PER_RECORD]);
        records.push(ChunkRecord::new(ChunkName::new(name), data));
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seed: u8) -> ChunkRecord {
        let mut name = [0u8; 16];
        // Scatter the seed so names do not sort in insertion order.
        name[0] = seed.wrapping_mul(113);
        name[7] = seed;
        ChunkRecord::new(ChunkName::new(name), [seed; 16])
    }

    #[test]
    fn test_encode_and_search() {
        let records: Vec<ChunkRecord> = (0..16).map(record).collect();
        let mut page = vec![0u8; 512];
        encode_record_page(&records, &mut page).unwrap();

        for r in &records {
            assert_eq!(search_record_page(&page, &r.name, 16), Some(r.data));
        }
        let absent = ChunkName::new([0x55; 16]);
        assert_eq!(search_record_page(&page, &absent, 16), None);
    }

    #[test]
    fn test_page_is_sorted() {
        let records: Vec<ChunkRecord> = (0..16).map(record).collect();
        let mut page = vec![0u8; 512];
        encode_record_page(&records, &mut page).unwrap();

        let decoded = records_on_page(&page, 16);
        for pair in decoded.windows(2) {
            assert!(pair[0].name <= pair[1].name);
        }
    }

    #[test]
    fn test_too_many_records_rejected() {
        let records: Vec<ChunkRecord> = (0..17).map(record).collect();
        let mut page = vec![0u8; 512];
        assert!(encode_record_page(&records, &mut page).is_err());
    }

    #[test]
    fn test_roundtrip_records() {
        let records: Vec<ChunkRecord> = (0..16).map(record).collect();
        let mut page = vec![0u8; 512];
        encode_record_page(&records, &mut page).unwrap();
        let mut decoded = records_on_page(&page, 16);
        decoded.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        let mut expected = records.clone();
        expected.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(decoded, expected);
    }
}

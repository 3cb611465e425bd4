//! The volume index: the in-memory name → chapter hint structure.
//!
//! For every name the volume index remembers the most recent virtual
//! chapter containing it, storing only the low `chapter_bits` of the VCN
//! in a delta index addressed by the name's volume-index bytes. A
//! non-collision entry is a *hint* — the name's address matched, but only
//! the cited chapter's record page can confirm the full name. A collision
//! entry carries the whole name and is authoritative.
//!
//! A sparse geometry splits the index in two: a *dense* sub-index holding
//! non-hook names and a *sparse* sub-index holding only hooks (sampled
//! names). Both cover the full chapter window; the split is what makes
//! hooks discoverable after non-hook entries are lost to rebuild.
//!
//! Each sub-index is sharded into `zone_count` independent slices by delta
//! list number, so a name belongs to exactly one shard — a pure function
//! of the name and the zone count, stable across restarts. Entries whose
//! stored chapter has rotated out of the window are flushed lazily as
//! their list is traversed.

use std::io::{Read, Write};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use crate::delta_index::{DeltaEntry, DeltaIndex, DeltaIndexStats};
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::name::{bits_for, ChunkName};

/// The nominal number of records indexed by one delta list.
const DELTA_LIST_SIZE: u64 = 256;

/// The default mean delta between volume index entries.
pub const DEFAULT_VOLUME_INDEX_MEAN_DELTA: u32 = 4096;

/// The result of resolving a name in the volume index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeIndexRecord {
    pub found: bool,
    pub is_collision: bool,
    pub virtual_chapter: u64,
}

/// The read-only triage view of a name, used to decide whether a sparse
/// cache barrier must precede the request.
#[derive(Clone, Copy, Debug)]
pub struct Triage {
    pub zone: u32,
    pub is_sample: bool,
    /// The name has an entry in the sampled (sparse) sub-index.
    pub in_sampled_chapter: bool,
    /// Valid when `in_sampled_chapter`.
    pub virtual_chapter: u64,
}

/// Aggregated statistics over both sub-indexes.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct VolumeIndexStats {
    pub record_count: u64,
    pub collision_count: u64,
    pub discard_count: u64,
    pub overflow_count: u64,
}

impl VolumeIndexStats {
    fn absorb(&mut self, stats: DeltaIndexStats) {
        self.record_count += stats.record_count;
        self.collision_count += stats.collision_count;
        self.discard_count += stats.discard_count;
        self.overflow_count += stats.overflow_count;
    }
}

#[derive(Clone, Copy, Debug)]
struct SubIndexParams {
    list_count: u64,
    lists_per_zone: u64,
    address_bits: u32,
    address_mask: u64,
    chapter_bits: u32,
    chapter_mask: u64,
    chapter_count: u32,
    mean_delta: u32,
}

impl SubIndexParams {
    fn new(
        records_per_chapter: u64,
        chapters_per_volume: u32,
        mean_delta: u32,
        zone_count: u32,
    ) -> Self {
        let records = (records_per_chapter * chapters_per_volume as u64).max(1);
        // One delta list per 256 records, but never fewer lists than zones
        // so every zone owns at least one.
        let list_count = (records / DELTA_LIST_SIZE).max(zone_count as u64);
        let address_count = mean_delta as u64 * DELTA_LIST_SIZE;
        let address_bits = bits_for(address_count - 1);
        let chapter_bits = bits_for(chapters_per_volume as u64 - 1);
        SubIndexParams {
            list_count,
            lists_per_zone: list_count.div_ceil(zone_count as u64),
            address_bits,
            address_mask: address_count - 1,
            chapter_bits,
            chapter_mask: (1u64 << chapter_bits) - 1,
            chapter_count: chapters_per_volume,
            mean_delta,
        }
    }

    fn address(&self, name: &ChunkName) -> u32 {
        (name.volume_index_bytes() & self.address_mask) as u32
    }

    fn list_number(&self, name: &ChunkName) -> u64 {
        (name.volume_index_bytes() >> self.address_bits) % self.list_count
    }

    fn zone_of(&self, name: &ChunkName) -> u32 {
        (self.list_number(name) / self.lists_per_zone) as u32
    }

    fn index_chapter(&self, virtual_chapter: u64) -> u32 {
        (virtual_chapter & self.chapter_mask) as u32
    }
}

struct Shard {
    delta_index: DeltaIndex,
    virtual_chapter_low: u64,
    virtual_chapter_high: u64,
}

impl Shard {
    /// Map a stored rolling chapter back to a virtual chapter, if it lies
    /// within this shard's window.
    fn window_chapter(&self, params: &SubIndexParams, stored: u32) -> Option<u64> {
        let low_index = self.virtual_chapter_low & params.chapter_mask;
        let rolling = (stored as u64).wrapping_sub(low_index) & params.chapter_mask;
        let virtual_chapter = self.virtual_chapter_low + rolling;
        if virtual_chapter <= self.virtual_chapter_high {
            Some(virtual_chapter)
        } else {
            None
        }
    }

    /// Advance the cursor, flushing any entries that have rotated out of
    /// the window.
    fn step(&mut self, params: &SubIndexParams, list: u32, entry: &mut DeltaEntry) -> Result<()> {
        self.delta_index.next_entry(list, entry)?;
        while !entry.at_end {
            let stored = self.delta_index.entry_value(list, entry)? as u32;
            if self.window_chapter(params, stored).is_some() {
                break;
            }
            *entry = self.delta_index.remove_entry(list, entry)?;
        }
        Ok(())
    }

    /// Find the entry for `address`/`name`, flushing stale entries on the
    /// way. The returned cursor is the found entry or the insertion point.
    fn find(
        &mut self,
        params: &SubIndexParams,
        list: u32,
        address: u32,
        name: &ChunkName,
    ) -> Result<DeltaEntry> {
        let mut entry = self.delta_index.start_search(list, 0)?;
        loop {
            self.step(params, list, &mut entry)?;
            if entry.at_end || address <= entry.key {
                break;
            }
        }
        if !entry.at_end && address == entry.key {
            // Check collision records for a more precise match.
            let mut follower = entry;
            loop {
                self.step(params, list, &mut follower)?;
                if follower.at_end || !follower.is_collision {
                    break;
                }
                if self.delta_index.entry_name(list, &follower)? == *name.as_bytes() {
                    entry = follower;
                    break;
                }
            }
        }
        Ok(entry)
    }
}

/// One sub-index (dense or sparse): sharded delta lists plus per-shard
/// windows.
struct SubIndex {
    params: SubIndexParams,
    shards: Vec<Mutex<Shard>>,
}

impl SubIndex {
    fn new(params: SubIndexParams, zone_count: u32) -> Self {
        let shards = (0..zone_count as u64)
            .map(|zone| {
                let first = zone * params.lists_per_zone;
                let count = params.list_count.saturating_sub(first).min(params.lists_per_zone);
                Mutex::new(Shard {
                    delta_index: DeltaIndex::new(
                        count.max(1) as u32,
                        params.mean_delta,
                        params.chapter_bits,
                    ),
                    virtual_chapter_low: 0,
                    virtual_chapter_high: 0,
                })
            })
            .collect();
        SubIndex { params, shards }
    }

    /// The shard and shard-local list owning a name.
    fn route(&self, name: &ChunkName) -> (usize, u32, u32) {
        let list = self.params.list_number(name);
        let zone = (list / self.params.lists_per_zone) as usize;
        let local_list = (list % self.params.lists_per_zone) as u32;
        (zone, local_list, self.params.address(name))
    }

    fn get_record(&self, name: &ChunkName) -> Result<VolumeIndexRecord> {
        let (zone, list, address) = self.route(name);
        let mut shard = self.shards[zone].lock()?;
        let entry = shard.find(&self.params, list, address, name)?;
        let found = !entry.at_end && entry.key == address;
        if !found {
            return Ok(VolumeIndexRecord {
                found: false,
                is_collision: false,
                virtual_chapter: 0,
            });
        }
        let stored = shard.delta_index.entry_value(list, &entry)? as u32;
        let virtual_chapter = shard
            .window_chapter(&self.params, stored)
            .ok_or_else(|| crate::errstate!("volume index entry escaped flushing"))?;
        Ok(VolumeIndexRecord {
            found: true,
            is_collision: entry.is_collision,
            virtual_chapter,
        })
    }

    fn put_record(&self, name: &ChunkName, virtual_chapter: u64) -> Result<()> {
        let (zone, list, address) = self.route(name);
        let mut shard = self.shards[zone].lock()?;
        let entry = shard.find(&self.params, list, address, name)?;
        let found = !entry.at_end && entry.key == address;
        let value = self.params.index_chapter(virtual_chapter);
        let collision_name = if found { Some(name.as_bytes()) } else { None };
        shard
            .delta_index
            .put_entry(list, &entry, address, value, collision_name)
    }

    fn set_record_chapter(&self, name: &ChunkName, virtual_chapter: u64) -> Result<()> {
        let (zone, list, address) = self.route(name);
        let mut shard = self.shards[zone].lock()?;
        let entry = shard.find(&self.params, list, address, name)?;
        if entry.at_end || entry.key != address {
            return Err(crate::errstate!(
                "cannot update a volume index record that is not present"
            ));
        }
        let value = self.params.index_chapter(virtual_chapter);
        shard.delta_index.set_entry_value(list, &entry, value)
    }

    fn remove_record(&self, name: &ChunkName) -> Result<bool> {
        let (zone, list, address) = self.route(name);
        let mut shard = self.shards[zone].lock()?;
        let entry = shard.find(&self.params, list, address, name)?;
        if entry.at_end || entry.key != address {
            return Ok(false);
        }
        shard.delta_index.remove_entry(list, &entry)?;
        Ok(true)
    }

    fn set_zone_open_chapter(&self, zone: u32, virtual_chapter: u64) -> Result<()> {
        let mut shard = self.shards[zone as usize].lock()?;
        shard.virtual_chapter_high = virtual_chapter;
        shard.virtual_chapter_low =
            virtual_chapter.saturating_sub(self.params.chapter_count as u64 - 1);
        Ok(())
    }

    fn stats(&self) -> DeltaIndexStats {
        let mut total = DeltaIndexStats::default();
        for shard in &self.shards {
            let stats = shard.lock().unwrap().delta_index.stats();
            total.record_count += stats.record_count;
            total.collision_count += stats.collision_count;
            total.discard_count += stats.discard_count;
            total.overflow_count += stats.overflow_count;
            total.list_count += stats.list_count;
        }
        total
    }
}

/// The complete volume index.
pub struct VolumeIndex {
    dense: SubIndex,
    sparse: Option<SubIndex>,
    sample_rate: u32,
    zone_count: u32,
}

impl VolumeIndex {
    pub fn new(
        geometry: &Geometry,
        zone_count: u32,
        mean_delta: u32,
        sample_rate: u32,
    ) -> Result<Self> {
        if zone_count == 0 {
            return Err(crate::errinput!("zone count must be greater than zero"));
        }
        let sparse = geometry.is_sparse();
        if sparse && sample_rate < 2 {
            return Err(crate::errinput!(
                "a sparse index requires a sample rate of at least 2"
            ));
        }

        let sample_records = if sparse {
            (geometry.records_per_chapter as u64 / sample_rate as u64).max(1)
        } else {
            0
        };
        let dense_records = geometry.records_per_chapter as u64 - sample_records;
        let dense = SubIndex::new(
            SubIndexParams::new(
                dense_records.max(1),
                geometry.chapters_per_volume,
                mean_delta,
                zone_count,
            ),
            zone_count,
        );
        let sparse = sparse.then(|| {
            SubIndex::new(
                SubIndexParams::new(
                    sample_records,
                    geometry.chapters_per_volume,
                    mean_delta,
                    zone_count,
                ),
                zone_count,
            )
        });
        Ok(VolumeIndex {
            dense,
            sparse,
            sample_rate,
            zone_count,
        })
    }

    pub fn zone_count(&self) -> u32 {
        self.zone_count
    }

    /// Whether a name is tracked by the sparse sub-index.
    pub fn is_sample(&self, name: &ChunkName) -> bool {
        self.sparse.is_some() && name.sampling_bytes() % self.sample_rate == 0
    }

    /// The zone owning a name: a pure function of the name and zone count.
    pub fn zone_for_name(&self, name: &ChunkName) -> u32 {
        self.dense.params.zone_of(name)
    }

    fn sub_index_for(&self, name: &ChunkName) -> &SubIndex {
        match &self.sparse {
            Some(sparse) if self.is_sample(name) => sparse,
            _ => &self.dense,
        }
    }

    /// Resolve a name to its most recent chapter hint.
    pub fn get_record(&self, name: &ChunkName) -> Result<VolumeIndexRecord> {
        self.sub_index_for(name).get_record(name)
    }

    /// Insert a hint binding `name` to `virtual_chapter`.
    pub fn put_record(&self, name: &ChunkName, virtual_chapter: u64) -> Result<()> {
        self.sub_index_for(name).put_record(name, virtual_chapter)
    }

    /// Rebind an existing entry to `virtual_chapter`.
    pub fn set_record_chapter(&self, name: &ChunkName, virtual_chapter: u64) -> Result<()> {
        self.sub_index_for(name)
            .set_record_chapter(name, virtual_chapter)
    }

    /// Remove the entry for `name`. Returns whether one was present.
    pub fn remove_record(&self, name: &ChunkName) -> Result<bool> {
        self.sub_index_for(name).remove_record(name)
    }

    /// The read-only triage lookup: identify hooks whose chapter may need
    /// a sparse cache barrier.
    pub fn lookup(&self, name: &ChunkName) -> Result<Triage> {
        let mut triage = Triage {
            zone: self.zone_for_name(name),
            is_sample: false,
            in_sampled_chapter: false,
            virtual_chapter: 0,
        };
        if let Some(sparse) = &self.sparse {
            if self.is_sample(name) {
                triage.is_sample = true;
                let record = sparse.get_record(name)?;
                triage.in_sampled_chapter = record.found;
                triage.virtual_chapter = record.virtual_chapter;
            }
        }
        Ok(triage)
    }

    /// Advance one zone's window to `virtual_chapter`, invalidating
    /// entries that now point at the reused physical chapter.
    pub fn set_zone_open_chapter(&self, zone: u32, virtual_chapter: u64) -> Result<()> {
        self.dense.set_zone_open_chapter(zone, virtual_chapter)?;
        if let Some(sparse) = &self.sparse {
            sparse.set_zone_open_chapter(zone, virtual_chapter)?;
        }
        Ok(())
    }

    /// Advance every zone's window, as load and rebuild do.
    pub fn set_open_chapter(&self, virtual_chapter: u64) -> Result<()> {
        for zone in 0..self.zone_count {
            self.set_zone_open_chapter(zone, virtual_chapter)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> (VolumeIndexStats, VolumeIndexStats) {
        let mut dense = VolumeIndexStats::default();
        dense.absorb(self.dense.stats());
        let mut sparse = VolumeIndexStats::default();
        if let Some(sub_index) = &self.sparse {
            sparse.absorb(sub_index.stats());
        }
        (dense, sparse)
    }

    /// Serialize one zone's shard of both sub-indexes.
    pub fn write_zone_to<W: Write>(&self, zone: u32, writer: &mut W) -> Result<()> {
        let shard = self.dense.shards[zone as usize].lock()?;
        writer.write_u64::<LittleEndian>(shard.virtual_chapter_low)?;
        writer.write_u64::<LittleEndian>(shard.virtual_chapter_high)?;
        shard.delta_index.write_to(writer)?;
        drop(shard);

        writer.write_u8(self.sparse.is_some() as u8)?;
        if let Some(sparse) = &self.sparse {
            let shard = sparse.shards[zone as usize].lock()?;
            writer.write_u64::<LittleEndian>(shard.virtual_chapter_low)?;
            writer.write_u64::<LittleEndian>(shard.virtual_chapter_high)?;
            shard.delta_index.write_to(writer)?;
        }
        Ok(())
    }

    /// Restore one zone's shard written by [`VolumeIndex::write_zone_to`].
    pub fn read_zone_from<R: Read>(&self, zone: u32, reader: &mut R) -> Result<()> {
        let mut shard = self.dense.shards[zone as usize].lock()?;
        shard.virtual_chapter_low = reader.read_u64::<LittleEndian>()?;
        shard.virtual_chapter_high = reader.read_u64::<LittleEndian>()?;
        shard.delta_index.read_from(reader)?;
        drop(shard);

        let has_sparse = reader.read_u8()? != 0;
        if has_sparse != self.sparse.is_some() {
            return Err(Error::CorruptComponent(
                "volume index sparse split changed".to_string(),
            ));
        }
        if let Some(sparse) = &self.sparse {
            let mut shard = sparse.shards[zone as usize].lock()?;
            shard.virtual_chapter_low = reader.read_u64::<LittleEndian>()?;
            shard.virtual_chapter_high = reader.read_u64::<LittleEndian>()?;
            shard.delta_index.read_from(reader)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::testing::{small_dense, small_sparse};

    fn named(seed: u64) -> ChunkName {
        let mut name = ChunkName::new([0u8; 16]);
        name.set_volume_index_bytes(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        name.set_sampling_bytes((seed % 7 + 1) as u16);
        name
    }

    fn dense_index(zones: u32) -> VolumeIndex {
        VolumeIndex::new(
            &small_dense(),
            zones,
            DEFAULT_VOLUME_INDEX_MEAN_DELTA,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let index = dense_index(2);
        index.set_open_chapter(3).unwrap();
        for seed in 0..200u64 {
            index.put_record(&named(seed), 3).unwrap();
        }
        for seed in 0..200u64 {
            let record = index.get_record(&named(seed)).unwrap();
            assert!(record.found, "seed {seed} not found");
            assert_eq!(record.virtual_chapter, 3);
        }
        // A name whose address is a small constant shared by no seed.
        let mut absent = ChunkName::new([0u8; 16]);
        absent.set_volume_index_bytes(1);
        assert!(!index.get_record(&absent).unwrap().found);
    }

    #[test]
    fn test_zone_routing_is_stable() {
        let index = dense_index(2);
        let other = dense_index(2);
        for seed in 0..100u64 {
            let name = named(seed);
            assert_eq!(index.zone_for_name(&name), other.zone_for_name(&name));
            assert!(index.zone_for_name(&name) < 2);
        }
    }

    #[test]
    fn test_set_chapter_and_remove() {
        let index = dense_index(1);
        index.set_open_chapter(1).unwrap();
        let name = named(42);
        index.put_record(&name, 1).unwrap();

        index.set_open_chapter(4).unwrap();
        index.set_record_chapter(&name, 4).unwrap();
        let record = index.get_record(&name).unwrap();
        assert!(record.found);
        assert_eq!(record.virtual_chapter, 4);

        assert!(index.remove_record(&name).unwrap());
        assert!(!index.get_record(&name).unwrap().found);
        assert!(!index.remove_record(&name).unwrap());
    }

    #[test]
    fn test_window_rotation_invalidates() {
        let geometry = small_dense();
        let index = VolumeIndex::new(&geometry, 1, DEFAULT_VOLUME_INDEX_MEAN_DELTA, 0).unwrap();
        index.set_open_chapter(0).unwrap();
        let name = named(7);
        index.put_record(&name, 0).unwrap();

        // Advance within the window: still found.
        index.set_open_chapter(5).unwrap();
        assert!(index.get_record(&name).unwrap().found);

        // Advance far past the window: the entry is flushed or aliases to
        // a chapter within the new window.
        index.set_open_chapter(100).unwrap();
        let record = index.get_record(&name).unwrap();
        if record.found {
            assert!(record.virtual_chapter > 100 - geometry.chapters_per_volume as u64);
        }
    }

    #[test]
    fn test_sparse_split_routes_hooks() {
        let geometry = small_sparse();
        let index =
            VolumeIndex::new(&geometry, 2, DEFAULT_VOLUME_INDEX_MEAN_DELTA, 4).unwrap();
        index.set_open_chapter(2).unwrap();

        let mut hook = named(11);
        hook.set_sampling_bytes(8); // 8 % 4 == 0
        let mut plain = named(12);
        plain.set_sampling_bytes(9);

        assert!(index.is_sample(&hook));
        assert!(!index.is_sample(&plain));

        index.put_record(&hook, 2).unwrap();
        index.put_record(&plain, 2).unwrap();

        let triage = index.lookup(&hook).unwrap();
        assert!(triage.is_sample);
        assert!(triage.in_sampled_chapter);
        assert_eq!(triage.virtual_chapter, 2);

        let triage = index.lookup(&plain).unwrap();
        assert!(!triage.is_sample);
        assert!(!triage.in_sampled_chapter);

        // Both remain retrievable through the unified interface.
        assert!(index.get_record(&hook).unwrap().found);
        assert!(index.get_record(&plain).unwrap().found);

        let (dense_stats, sparse_stats) = index.stats();
        assert_eq!(dense_stats.record_count, 1);
        assert_eq!(sparse_stats.record_count, 1);
    }

    #[test]
    fn test_collisions_on_shared_address() {
        let index = dense_index(1);
        index.set_open_chapter(1).unwrap();
        let mut first = ChunkName::new([1u8; 16]);
        let mut second = ChunkName::new([2u8; 16]);
        // Identical volume index bytes: same list, same address.
        first.set_volume_index_bytes(0xdead_beef);
        second.set_volume_index_bytes(0xdead_beef);

        index.put_record(&first, 1).unwrap();
        index.put_record(&second, 1).unwrap();

        let record = index.get_record(&second).unwrap();
        assert!(record.found);
        assert!(record.is_collision);

        // Removing the collision leaves the hint.
        assert!(index.remove_record(&second).unwrap());
        let record = index.get_record(&first).unwrap();
        assert!(record.found);
        assert!(!record.is_collision);
    }

    #[test]
    fn test_zone_save_restore() {
        let index = dense_index(2);
        index.set_open_chapter(2).unwrap();
        for seed in 0..100u64 {
            index.put_record(&named(seed), 2).unwrap();
        }

        let restored = dense_index(2);
        for zone in 0..2 {
            let mut buffer = Vec::new();
            index.write_zone_to(zone, &mut buffer).unwrap();
            restored.read_zone_from(zone, &mut buffer.as_slice()).unwrap();
        }
        for seed in 0..100u64 {
            let record = restored.get_record(&named(seed)).unwrap();
            assert!(record.found, "seed {seed} lost in save/restore");
            assert_eq!(record.virtual_chapter, 2);
        }
    }
}

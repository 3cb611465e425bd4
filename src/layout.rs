//! The on-disk layout: superblock, config record, volume region, and
//! rotating save slots.
//!
//! ## File Layout
//!
//! ```text
//! +--------------------------------------+
//! | super block (header, nonce, regions) |
//! +--------------------------------------+
//! | config record (6.02 / 8.02)          |
//! +--------------------------------------+
//! | volume: chapters x pages             |
//! +--------------------------------------+
//! | save slot 0                          |
//! +--------------------------------------+
//! | save slot 1                          |
//! +--------------------------------------+
//! | seal                                 |
//! +--------------------------------------+
//! ```
//!
//! Every region starts with the common header `{magic, version_major,
//! version_minor, size, payload_checksum}`, little-endian, checksummed with
//! CRC-32/ISCSI.
//!
//! Save slots rotate: a save picks the slot with the older generation,
//! invalidates its header, streams the component snapshots, and commits by
//! writing the new header last. A slot is valid only if its header
//! checksum verifies, so a crash mid-save leaves the previous slot as the
//! latest. Slots record whether they are clean *saves* (with open-chapter
//! snapshots, usable by load) or periodic *checkpoints* (volume index and
//! page map only, usable as a rebuild baseline).

use std::collections::hash_map::DefaultHasher;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use itertools::Itertools;
use tracing::{debug, info};

use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::lock::VolumeLock;
use crate::region::{Region, RegionReader};
use crate::{errdata, errstate};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const SUPER_MAGIC: u32 = 0x4349_4e44; // "CIND"
const CONFIG_MAGIC: u32 = 0x4349_4e43; // "CINC"
const SLOT_MAGIC: u32 = 0x4349_4e53; // "CINS"
const SEAL_MAGIC: u32 = 0x4349_4e5a; // "CINZ"

const SUPER_VERSION: (u32, u32) = (3, 0);
const CONFIG_VERSION_6: (u32, u32) = (6, 2);
const CONFIG_VERSION_8: (u32, u32) = (8, 2);
const SLOT_VERSION: (u32, u32) = (1, 0);

/// Region alignment within the file.
const BLOCK: u64 = 4096;

/// Reserved space for a save-slot header.
const SLOT_HEADER_BYTES: u64 = 1024;

const REGION_HEADER_BYTES: usize = 24;

/// The number of rotating save slots.
pub const SAVE_SLOTS: usize = 2;

/// What a save slot holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveKind {
    /// A clean-shutdown save, including open chapters; valid for load.
    Save,
    /// A periodic checkpoint; valid only as a rebuild baseline.
    Checkpoint,
}

/// Component identifiers within a save slot.
pub const COMPONENT_PAGE_MAP: u32 = 1;

pub fn volume_index_component(zone: u32) -> u32 {
    0x100 + zone
}

pub fn open_chapter_component(zone: u32) -> u32 {
    0x200 + zone
}

fn align_up(value: u64) -> u64 {
    value.div_ceil(BLOCK) * BLOCK
}

fn write_region_header<W: Write>(
    writer: &mut W,
    magic: u32,
    version: (u32, u32),
    payload: &[u8],
) -> Result<()> {
    writer.write_u32::<LittleEndian>(magic)?;
    writer.write_u32::<LittleEndian>(version.0)?;
    writer.write_u32::<LittleEndian>(version.1)?;
    writer.write_u64::<LittleEndian>(payload.len() as u64)?;
    writer.write_u32::<LittleEndian>(CRC32.checksum(payload))?;
    writer.write_all(payload)?;
    Ok(())
}

fn read_region_header<R: Read>(reader: &mut R, magic: u32) -> Result<((u32, u32), Vec<u8>)> {
    let found_magic = reader.read_u32::<LittleEndian>()?;
    if found_magic != magic {
        return Err(Error::CorruptFile(format!(
            "bad region magic {found_magic:#x}, expected {magic:#x}"
        )));
    }
    let version = (
        reader.read_u32::<LittleEndian>()?,
        reader.read_u32::<LittleEndian>()?,
    );
    let size = reader.read_u64::<LittleEndian>()?;
    if size > (1 << 20) {
        return Err(Error::CorruptFile(format!(
            "implausible region payload size {size}"
        )));
    }
    let checksum = reader.read_u32::<LittleEndian>()?;
    let mut payload = vec![0u8; size as usize];
    reader.read_exact(&mut payload)?;
    if CRC32.checksum(&payload) != checksum {
        return Err(Error::CorruptFile("region payload checksum".to_string()));
    }
    Ok((version, payload))
}

/// One entry in a save slot's component table.
#[derive(Clone, Copy, Debug)]
pub struct ComponentEntry {
    pub id: u32,
    pub offset: u64,
    pub len: u64,
}

/// The decoded header of a valid save slot.
#[derive(Clone, Debug)]
pub struct SlotHeader {
    pub kind: SaveKind,
    pub generation: u64,
    pub nonce: u64,
    pub oldest_chapter: u64,
    pub newest_chapter: u64,
    pub zone_count: u32,
    pub components: Vec<ComponentEntry>,
}

impl SlotHeader {
    pub fn component(&self, id: u32) -> Option<ComponentEntry> {
        self.components.iter().copied().find(|entry| entry.id == id)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        payload.write_u32::<LittleEndian>(match self.kind {
            SaveKind::Save => 1,
            SaveKind::Checkpoint => 2,
        })?;
        payload.write_u64::<LittleEndian>(self.generation)?;
        payload.write_u64::<LittleEndian>(self.nonce)?;
        payload.write_u64::<LittleEndian>(self.oldest_chapter)?;
        payload.write_u64::<LittleEndian>(self.newest_chapter)?;
        payload.write_u32::<LittleEndian>(self.zone_count)?;
        payload.write_u32::<LittleEndian>(self.components.len() as u32)?;
        for entry in &self.components {
            payload.write_u32::<LittleEndian>(entry.id)?;
            payload.write_u64::<LittleEndian>(entry.offset)?;
            payload.write_u64::<LittleEndian>(entry.len)?;
        }
        Ok(payload)
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(payload);
        let kind = match reader.read_u32::<LittleEndian>()? {
            1 => SaveKind::Save,
            2 => SaveKind::Checkpoint,
            other => return Err(errdata!("unknown save kind {other}")),
        };
        let generation = reader.read_u64::<LittleEndian>()?;
        let nonce = reader.read_u64::<LittleEndian>()?;
        let oldest_chapter = reader.read_u64::<LittleEndian>()?;
        let newest_chapter = reader.read_u64::<LittleEndian>()?;
        let zone_count = reader.read_u32::<LittleEndian>()?;
        let component_count = reader.read_u32::<LittleEndian>()?;
        let mut components = Vec::with_capacity(component_count as usize);
        for _ in 0..component_count {
            components.push(ComponentEntry {
                id: reader.read_u32::<LittleEndian>()?,
                offset: reader.read_u64::<LittleEndian>()?,
                len: reader.read_u64::<LittleEndian>()?,
            });
        }
        Ok(SlotHeader {
            kind,
            generation,
            nonce,
            oldest_chapter,
            newest_chapter,
            zone_count,
            components,
        })
    }
}

/// A save in progress: components stream into the slot data area, then
/// commit writes the header.
struct PendingSave {
    slot: usize,
    header: SlotHeader,
    next_offset: u64,
}

/// The index layout on its backing file.
pub struct Layout {
    file: Arc<File>,
    _lock: VolumeLock,
    config: IndexConfig,
    geometry: Geometry,
    nonce: u64,
    volume_region: Region,
    slot_regions: Vec<Region>,
    slot_headers: Vec<Option<SlotHeader>>,
    pending: Option<PendingSave>,
}

/// Estimate a generous upper bound for one save slot's data.
fn slot_data_size(geometry: &Geometry) -> u64 {
    // A volume index entry saves as a few coded bits; eight bytes per
    // record leaves room for collision names, list headers, and skew.
    let index_bytes = geometry.records_per_volume * 8 + (1 << 16);
    let open_chapter_bytes = (geometry.records_per_chapter as u64) * 32 + 4096;
    let page_map_bytes =
        (geometry.index_pages_per_chapter as u64 * geometry.chapters_per_volume as u64) * 2 + 4096;
    align_up(index_bytes + open_chapter_bytes + page_map_bytes + SLOT_HEADER_BYTES)
}

fn generate_nonce(path: &Path) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    if let Ok(elapsed) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        elapsed.as_nanos().hash(&mut hasher);
    }
    hasher.finish() | 1
}

struct RegionPlan {
    config_start: u64,
    volume_start: u64,
    slot_starts: Vec<u64>,
    slot_size: u64,
    seal_start: u64,
    total: u64,
}

fn plan_regions(geometry: &Geometry) -> RegionPlan {
    let config_start = BLOCK;
    let volume_start = config_start + BLOCK;
    let slot_size = slot_data_size(geometry);
    let first_slot = volume_start + align_up(geometry.bytes_per_volume);
    let slot_starts = (0..SAVE_SLOTS as u64)
        .map(|slot| first_slot + slot * slot_size)
        .collect_vec();
    let seal_start = first_slot + SAVE_SLOTS as u64 * slot_size;
    RegionPlan {
        config_start,
        volume_start,
        slot_starts,
        slot_size,
        seal_start,
        total: seal_start + BLOCK,
    }
}

impl Layout {
    /// Create a new index layout, clobbering any existing one.
    pub fn create(path: &Path, offset: u64, config: IndexConfig) -> Result<Self> {
        let geometry = config.geometry()?;
        let plan = plan_regions(&geometry);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(offset + plan.total)?;
        let file = Arc::new(file);
        let lock = VolumeLock::acquire(file.clone())?;
        let whole = Region::new(file.clone(), offset, plan.total);

        let nonce = generate_nonce(path);

        // Super block: nonce plus the region table.
        let mut payload = Vec::new();
        payload.write_u64::<LittleEndian>(nonce)?;
        payload.write_u32::<LittleEndian>(SAVE_SLOTS as u32)?;
        for (start, len) in [
            (plan.config_start, BLOCK),
            (plan.volume_start, align_up(geometry.bytes_per_volume)),
        ]
        .into_iter()
        .chain(plan.slot_starts.iter().map(|&s| (s, plan.slot_size)))
        .chain([(plan.seal_start, BLOCK)])
        {
            payload.write_u64::<LittleEndian>(start)?;
            payload.write_u64::<LittleEndian>(len)?;
        }
        let mut writer = whole.writer(0);
        write_region_header(&mut writer, SUPER_MAGIC, SUPER_VERSION, &payload)?;
        writer.finish()?;

        // Config record, written as 8.02.
        let mut payload = Vec::new();
        payload.write_u32::<LittleEndian>(config.record_pages_per_chapter)?;
        payload.write_u32::<LittleEndian>(config.chapters_per_volume)?;
        payload.write_u32::<LittleEndian>(config.sparse_chapters_per_volume)?;
        payload.write_u32::<LittleEndian>(config.cache_chapters)?;
        payload.write_u32::<LittleEndian>(config.checkpoint_frequency)?;
        payload.write_u32::<LittleEndian>(config.volume_index_mean_delta)?;
        payload.write_u32::<LittleEndian>(config.bytes_per_page as u32)?;
        payload.write_u32::<LittleEndian>(config.sparse_sample_rate)?;
        payload.write_u64::<LittleEndian>(nonce)?;
        payload.write_u64::<LittleEndian>(geometry.remapped_virtual)?;
        payload.write_u64::<LittleEndian>(geometry.remapped_physical)?;
        let mut writer = whole.writer(plan.config_start);
        write_region_header(&mut writer, CONFIG_MAGIC, CONFIG_VERSION_8, &payload)?;
        writer.finish()?;

        // Invalidate both save slots and write the seal.
        for &slot_start in &plan.slot_starts {
            whole.write_at(slot_start, &[0u8; REGION_HEADER_BYTES])?;
        }
        let mut writer = whole.writer(plan.seal_start);
        write_region_header(&mut writer, SEAL_MAGIC, SUPER_VERSION, &[])?;
        writer.finish()?;
        whole.sync()?;

        info!(path = %path.display(), nonce, "created index layout");
        Self::assemble(file, lock, whole, config, geometry, nonce, plan)
    }

    /// Open an existing layout, reading the superblock and config record.
    pub fn open(path: &Path, offset: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file = Arc::new(file);
        let lock = VolumeLock::acquire(file.clone())?;
        let file_len = file.metadata()?.len();
        let whole = Region::new(file.clone(), offset, file_len.saturating_sub(offset));

        let mut reader = whole.reader(0);
        let (version, payload) = read_region_header(&mut reader, SUPER_MAGIC)?;
        if version.0 < SUPER_VERSION.0 {
            return Err(Error::CorruptFile(format!(
                "unsupported super block version {}.{}",
                version.0, version.1
            )));
        }
        let mut super_reader = Cursor::new(&payload);
        let nonce = super_reader.read_u64::<LittleEndian>()?;
        let slot_count = super_reader.read_u32::<LittleEndian>()? as usize;
        if slot_count != SAVE_SLOTS {
            return Err(Error::CorruptFile(format!(
                "unexpected save slot count {slot_count}"
            )));
        }
        let mut regions = Vec::new();
        for _ in 0..(2 + slot_count + 1) {
            let start = super_reader.read_u64::<LittleEndian>()?;
            let len = super_reader.read_u64::<LittleEndian>()?;
            regions.push((start, len));
        }

        // Config record.
        let mut reader = whole.reader(regions[0].0);
        let (version, payload) = read_region_header(&mut reader, CONFIG_MAGIC)?;
        if version != CONFIG_VERSION_6 && version != CONFIG_VERSION_8 {
            return Err(Error::CorruptFile(format!(
                "unsupported config version {}.{}",
                version.0, version.1
            )));
        }
        let mut config_reader = Cursor::new(&payload);
        let mut config = IndexConfig::default();
        config.record_pages_per_chapter = config_reader.read_u32::<LittleEndian>()?;
        config.chapters_per_volume = config_reader.read_u32::<LittleEndian>()?;
        config.sparse_chapters_per_volume = config_reader.read_u32::<LittleEndian>()?;
        config.cache_chapters = config_reader.read_u32::<LittleEndian>()?;
        config.checkpoint_frequency = config_reader.read_u32::<LittleEndian>()?;
        config.volume_index_mean_delta = config_reader.read_u32::<LittleEndian>()?;
        config.bytes_per_page = config_reader.read_u32::<LittleEndian>()? as usize;
        config.sparse_sample_rate = config_reader.read_u32::<LittleEndian>()?;
        let config_nonce = config_reader.read_u64::<LittleEndian>()?;
        if config_nonce != nonce {
            return Err(Error::CorruptFile(
                "config nonce does not match super block".to_string(),
            ));
        }
        if version == CONFIG_VERSION_8 {
            let remapped_virtual = config_reader.read_u64::<LittleEndian>()?;
            let remapped_physical = config_reader.read_u64::<LittleEndian>()?;
            if remapped_virtual != 0 || remapped_physical != 0 {
                // Reduced (remapped) volumes are not supported yet.
                return Err(crate::errinput!(
                    "index has a non-default chapter remap"
                ));
            }
        }

        let geometry = config.geometry()?;
        let plan = plan_regions(&geometry);
        // The stored region table must agree with the derived plan.
        if regions[0].0 != plan.config_start || regions[1].0 != plan.volume_start {
            return Err(Error::CorruptFile("region table mismatch".to_string()));
        }

        let mut layout = Self::assemble(file, lock, whole, config, geometry, nonce, plan)?;
        layout.read_slot_headers()?;
        Ok(layout)
    }

    fn assemble(
        file: Arc<File>,
        lock: VolumeLock,
        whole: Region,
        config: IndexConfig,
        geometry: Geometry,
        nonce: u64,
        plan: RegionPlan,
    ) -> Result<Self> {
        let volume_region =
            whole.subregion(plan.volume_start, align_up(geometry.bytes_per_volume))?;
        let slot_regions = plan
            .slot_starts
            .iter()
            .map(|&start| whole.subregion(start, plan.slot_size))
            .collect::<Result<Vec<_>>>()?;
        Ok(Layout {
            file,
            _lock: lock,
            config,
            geometry,
            nonce,
            volume_region,
            slot_headers: vec![None; slot_regions.len()],
            slot_regions,
            pending: None,
        })
    }

    fn read_slot_headers(&mut self) -> Result<()> {
        for slot in 0..self.slot_regions.len() {
            let mut reader = self.slot_regions[slot].reader(0);
            match read_region_header(&mut reader, SLOT_MAGIC) {
                Ok((version, payload)) if version == SLOT_VERSION => {
                    match SlotHeader::decode(&payload) {
                        Ok(header) if header.nonce == self.nonce => {
                            self.slot_headers[slot] = Some(header);
                        }
                        _ => self.slot_headers[slot] = None,
                    }
                }
                _ => self.slot_headers[slot] = None,
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn volume_region(&self) -> Region {
        self.volume_region.clone()
    }

    /// The most recent valid save slot, optionally restricted by kind.
    pub fn find_latest_save(&self, kind: Option<SaveKind>) -> Option<(usize, &SlotHeader)> {
        self.slot_headers
            .iter()
            .enumerate()
            .filter_map(|(slot, header)| header.as_ref().map(|h| (slot, h)))
            .filter(|(_, header)| kind.map_or(true, |k| header.kind == k))
            .max_by_key(|(_, header)| header.generation)
    }

    /// Begin a save or checkpoint in the next rotating slot. The slot's
    /// previous contents are invalidated immediately.
    pub fn begin_save(
        &mut self,
        kind: SaveKind,
        oldest_chapter: u64,
        newest_chapter: u64,
        zone_count: u32,
    ) -> Result<()> {
        if self.pending.is_some() {
            return Err(errstate!("a save is already in progress"));
        }
        // Pick the slot with the older generation (or an invalid one).
        let slot = (0..self.slot_regions.len())
            .min_by_key(|&slot| {
                self.slot_headers[slot]
                    .as_ref()
                    .map_or(0, |header| header.generation)
            })
            .ok_or_else(|| errstate!("no save slots"))?;
        let generation = self
            .slot_headers
            .iter()
            .flatten()
            .map(|header| header.generation)
            .max()
            .unwrap_or(0)
            + 1;

        // Invalidate the slot on disk before overwriting its data.
        self.slot_regions[slot].write_at(0, &[0u8; REGION_HEADER_BYTES])?;
        self.slot_regions[slot].sync()?;
        self.slot_headers[slot] = None;

        debug!(slot, generation, ?kind, "beginning save");
        self.pending = Some(PendingSave {
            slot,
            header: SlotHeader {
                kind,
                generation,
                nonce: self.nonce,
                oldest_chapter,
                newest_chapter,
                zone_count,
                components: Vec::new(),
            },
            next_offset: SLOT_HEADER_BYTES,
        });
        Ok(())
    }

    /// Stream one component into the pending save.
    pub fn save_component<F>(&mut self, id: u32, write: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| errstate!("no save in progress"))?;
        let region = &self.slot_regions[pending.slot];
        let mut writer = region.writer(pending.next_offset);
        write(&mut writer)?;
        let end = writer.finish()?;
        pending.header.components.push(ComponentEntry {
            id,
            offset: pending.next_offset,
            len: end - pending.next_offset,
        });
        pending.next_offset = end;
        Ok(())
    }

    /// Whether the pending save already contains a component.
    pub fn pending_has_component(&self, id: u32) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| pending.header.components.iter().any(|c| c.id == id))
    }

    /// Commit the pending save: write the slot header last, then sync.
    pub fn commit_save(&mut self) -> Result<()> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| errstate!("no save in progress"))?;
        let payload = pending.header.encode()?;
        if REGION_HEADER_BYTES as u64 + payload.len() as u64 > SLOT_HEADER_BYTES {
            return Err(errstate!("save slot header overflow"));
        }
        let region = &self.slot_regions[pending.slot];
        region.sync()?;
        let mut writer = region.writer(0);
        write_region_header(&mut writer, SLOT_MAGIC, SLOT_VERSION, &payload)?;
        writer.finish()?;
        region.sync()?;
        info!(
            slot = pending.slot,
            generation = pending.header.generation,
            kind = ?pending.header.kind,
            "committed save"
        );
        self.slot_headers[pending.slot] = Some(pending.header);
        Ok(())
    }

    /// Abandon the pending save, leaving the slot invalid.
    pub fn cancel_save(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(slot = pending.slot, "cancelled save");
        }
    }

    /// Invalidate every save slot (used before a rebuild repopulates the
    /// index, so stale saves can never be loaded).
    pub fn discard_saves(&mut self) -> Result<()> {
        self.cancel_save();
        for slot in 0..self.slot_regions.len() {
            self.slot_regions[slot].write_at(0, &[0u8; REGION_HEADER_BYTES])?;
            self.slot_regions[slot].sync()?;
            self.slot_headers[slot] = None;
        }
        Ok(())
    }

    /// Rewrite a slot's header with its open-chapter components removed.
    /// The chapter writer does this before writing that chapter to the
    /// volume, so a crash cannot load a stale open chapter.
    pub fn discard_open_chapter(&mut self, slot: usize) -> Result<()> {
        let Some(header) = &self.slot_headers[slot] else {
            return Ok(());
        };
        let mut header = header.clone();
        header
            .components
            .retain(|entry| entry.id < 0x200 || entry.id >= 0x300);
        let payload = header.encode()?;
        let region = &self.slot_regions[slot];
        let mut writer = region.writer(0);
        write_region_header(&mut writer, SLOT_MAGIC, SLOT_VERSION, &payload)?;
        writer.finish()?;
        region.sync()?;
        self.slot_headers[slot] = Some(header);
        debug!(slot, "discarded saved open chapter");
        Ok(())
    }

    /// A reader over one component of a valid save slot.
    pub fn open_component(&self, slot: usize, id: u32) -> Result<RegionReader> {
        let header = self.slot_headers[slot]
            .as_ref()
            .ok_or_else(|| errstate!("save slot {slot} is not valid"))?;
        let entry = header
            .component(id)
            .ok_or_else(|| Error::CorruptComponent(format!("missing component {id:#x}")))?;
        let region = self.slot_regions[slot].subregion(entry.offset, entry.len)?;
        Ok(region.reader(0))
    }

    /// The backing file, shared with the volume.
    pub fn file(&self) -> Arc<File> {
        self.file.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_config() -> IndexConfig {
        IndexConfig::default()
            .chapters(4, 8, 0)
            .bytes_per_page(512)
    }

    #[test]
    fn test_create_then_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        let layout = Layout::create(&path, 0, small_config()).unwrap();
        let nonce = layout.nonce();
        assert!(layout.find_latest_save(None).is_none());
        drop(layout);

        let layout = Layout::open(&path, 0).unwrap();
        assert_eq!(layout.nonce(), nonce);
        assert_eq!(layout.config().chapters_per_volume, 8);
        assert_eq!(layout.geometry().records_per_chapter, 64);
        assert!(layout.find_latest_save(None).is_none());
    }

    #[test]
    fn test_save_slot_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        let mut layout = Layout::create(&path, 0, small_config()).unwrap();

        layout.begin_save(SaveKind::Save, 1, 5, 2).unwrap();
        layout
            .save_component(COMPONENT_PAGE_MAP, |writer| {
                writer.write_all(b"page map bytes")?;
                Ok(())
            })
            .unwrap();
        layout
            .save_component(volume_index_component(0), |writer| {
                writer.write_all(b"zone zero")?;
                Ok(())
            })
            .unwrap();
        layout.commit_save().unwrap();
        drop(layout);

        let layout = Layout::open(&path, 0).unwrap();
        let (slot, header) = layout.find_latest_save(Some(SaveKind::Save)).unwrap();
        assert_eq!(header.oldest_chapter, 1);
        assert_eq!(header.newest_chapter, 5);
        assert_eq!(header.zone_count, 2);

        let mut reader = layout.open_component(slot, COMPONENT_PAGE_MAP).unwrap();
        let mut data = vec![0u8; 14];
        reader.read_exact(&mut data).unwrap();
        assert_eq!(&data, b"page map bytes");
    }

    #[test]
    fn test_slots_rotate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        let mut layout = Layout::create(&path, 0, small_config()).unwrap();

        for generation in 1..=3u64 {
            layout.begin_save(SaveKind::Save, 0, generation, 1).unwrap();
            layout.commit_save().unwrap();
            let (_, header) = layout.find_latest_save(None).unwrap();
            assert_eq!(header.generation, generation);
            assert_eq!(header.newest_chapter, generation);
        }
        // Two slots, three saves: both slots are in use and the newest
        // generation wins.
        let slots: Vec<_> = layout.slot_headers.iter().flatten().collect();
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn test_incomplete_save_is_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        let mut layout = Layout::create(&path, 0, small_config()).unwrap();

        layout.begin_save(SaveKind::Save, 0, 1, 1).unwrap();
        layout.commit_save().unwrap();

        // A second save that never commits must leave the first save as
        // the latest (in the other slot).
        layout.begin_save(SaveKind::Checkpoint, 0, 2, 1).unwrap();
        layout.cancel_save();
        drop(layout);

        let layout = Layout::open(&path, 0).unwrap();
        let (_, header) = layout.find_latest_save(None).unwrap();
        assert_eq!(header.newest_chapter, 1);
        assert_eq!(header.kind, SaveKind::Save);
    }

    #[test]
    fn test_discard_saves() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        let mut layout = Layout::create(&path, 0, small_config()).unwrap();
        layout.begin_save(SaveKind::Save, 0, 1, 1).unwrap();
        layout.commit_save().unwrap();
        layout.discard_saves().unwrap();
        assert!(layout.find_latest_save(None).is_none());
    }

    #[test]
    fn test_discard_open_chapter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        let mut layout = Layout::create(&path, 0, small_config()).unwrap();
        layout.begin_save(SaveKind::Save, 0, 1, 1).unwrap();
        layout
            .save_component(open_chapter_component(0), |writer| {
                writer.write_all(b"open chapter")?;
                Ok(())
            })
            .unwrap();
        layout
            .save_component(COMPONENT_PAGE_MAP, |writer| {
                writer.write_all(b"map")?;
                Ok(())
            })
            .unwrap();
        layout.commit_save().unwrap();

        let (slot, _) = layout.find_latest_save(None).unwrap();
        layout.discard_open_chapter(slot).unwrap();
        assert!(layout.open_component(slot, open_chapter_component(0)).is_err());
        assert!(layout.open_component(slot, COMPONENT_PAGE_MAP).is_ok());
    }

    #[test]
    fn test_corrupt_superblock_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        let layout = Layout::create(&path, 0, small_config()).unwrap();
        drop(layout);

        // Scribble over the super block.
        use std::io::{Seek, SeekFrom, Write as IoWrite};
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&[0xa5u8; 64]).unwrap();
        drop(file);

        assert!(Layout::open(&path, 0).is_err());
    }
}

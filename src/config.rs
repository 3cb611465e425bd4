//! User-facing configuration for an index.
//!
//! The geometry-defining parameters are persisted in the layout's config
//! region and must match on load; the runtime parameters (zones, read
//! threads) may differ from run to run.

use std::path::PathBuf;

use crate::error::Result;
use crate::errinput;
use crate::geometry::Geometry;
use crate::volume_index::DEFAULT_VOLUME_INDEX_MEAN_DELTA;

/// Configuration for an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexConfig {
    /// Length of a volume page in bytes (default: 4096).
    pub bytes_per_page: usize,

    /// Record pages per chapter (default: 256).
    pub record_pages_per_chapter: u32,

    /// Chapters in the volume (default: 1024).
    pub chapters_per_volume: u32,

    /// Sparsely indexed chapters (default: 0, a dense index).
    pub sparse_chapters_per_volume: u32,

    /// Decoded sparse chapter indexes kept in the sparse cache
    /// (default: 7).
    pub cache_chapters: u32,

    /// Checkpoint every N chapters; 0 disables checkpoints (default: 0).
    pub checkpoint_frequency: u32,

    /// Mean delta between volume index entries (default: 4096).
    pub volume_index_mean_delta: u32,

    /// One in this many names is a sparse hook (default: 32; unused for a
    /// dense index).
    pub sparse_sample_rate: u32,

    /// Number of index zones, each with its own worker thread
    /// (default: 1, maximum 16).
    pub zone_count: u32,

    /// Background volume reader threads (default: 2).
    pub read_threads: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            bytes_per_page: 4096,
            record_pages_per_chapter: 256,
            chapters_per_volume: 1024,
            sparse_chapters_per_volume: 0,
            cache_chapters: 7,
            checkpoint_frequency: 0,
            volume_index_mean_delta: DEFAULT_VOLUME_INDEX_MEAN_DELTA,
            sparse_sample_rate: 32,
            zone_count: 1,
            read_threads: 2,
        }
    }
}

impl IndexConfig {
    /// Set the chapter shape.
    pub fn chapters(mut self, record_pages: u32, chapters: u32, sparse: u32) -> Self {
        self.record_pages_per_chapter = record_pages;
        self.chapters_per_volume = chapters;
        self.sparse_chapters_per_volume = sparse;
        self
    }

    /// Set the volume page size.
    pub fn bytes_per_page(mut self, bytes: usize) -> Self {
        self.bytes_per_page = bytes;
        self
    }

    /// Set the sparse sample rate.
    pub fn sparse_sample_rate(mut self, rate: u32) -> Self {
        self.sparse_sample_rate = rate;
        self
    }

    /// Set the number of zones.
    pub fn zones(mut self, zone_count: u32) -> Self {
        self.zone_count = zone_count;
        self
    }

    /// Set the checkpoint frequency.
    pub fn checkpoint_frequency(mut self, frequency: u32) -> Self {
        self.checkpoint_frequency = frequency;
        self
    }

    /// Set the sparse cache capacity.
    pub fn cache_chapters(mut self, chapters: u32) -> Self {
        self.cache_chapters = chapters;
        self
    }

    /// Set the read thread count.
    pub fn read_threads(mut self, threads: u32) -> Self {
        self.read_threads = threads;
        self
    }

    /// Validate and derive the geometry.
    pub fn geometry(&self) -> Result<Geometry> {
        if self.zone_count == 0 || self.zone_count > 16 {
            return Err(errinput!(
                "zone count {} out of range 1..=16",
                self.zone_count
            ));
        }
        Geometry::new(
            self.bytes_per_page,
            self.record_pages_per_chapter,
            self.chapters_per_volume,
            self.sparse_chapters_per_volume,
        )
    }
}

/// The parsed form of an index name string:
/// `<path>[ size=<bytes>][ offset=<bytes>]`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexName {
    pub path: PathBuf,
    pub size: Option<u64>,
    pub offset: Option<u64>,
}

impl IndexName {
    pub fn parse(name: &str) -> Result<Self> {
        let mut parts = name.split_whitespace();
        let path = parts
            .next()
            .ok_or_else(|| errinput!("empty index name"))?;
        let mut parsed = IndexName {
            path: PathBuf::from(path),
            size: None,
            offset: None,
        };
        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| errinput!("malformed index name parameter {part:?}"))?;
            let value: u64 = value
                .parse()
                .map_err(|_| errinput!("malformed value in index name parameter {part:?}"))?;
            match key {
                "size" => parsed.size = Some(value),
                "offset" => parsed.offset = Some(value),
                _ => return Err(errinput!("unknown index name parameter {key:?}")),
            }
        }
        Ok(parsed)
    }
}

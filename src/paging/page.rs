//! Tile Page
//!
//! Usage record of one page: hit count, tiles stored, and last access time.
//! All counters are atomics so request threads never take a lock to record
//! a hit.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::domain::ports::PageRecord;

/// Page coordinates (not tile coordinates)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageIndex {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl PageIndex {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

/// Usage statistics of a block of tiles at one zoom level.
///
/// Equality and hashing consider only the index. `Clone` takes a detached
/// snapshot of the counters, which is what eviction sorts.
#[derive(Debug)]
pub struct TilePage {
    index: PageIndex,
    /// Creation order within the owning pyramid
    sequence: u64,
    hits: AtomicU64,
    tiles: AtomicI64,
    last_access: AtomicU32,
}

impl TilePage {
    pub fn new(index: PageIndex) -> Self {
        Self::with_stats(index, 0, 0, 0)
    }

    pub fn with_stats(index: PageIndex, hits: u64, tiles: i64, last_access_minutes: u32) -> Self {
        Self {
            index,
            sequence: 0,
            hits: AtomicU64::new(hits),
            tiles: AtomicI64::new(tiles),
            last_access: AtomicU32::new(last_access_minutes),
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn from_record(record: &PageRecord) -> Self {
        Self::with_stats(
            PageIndex::new(record.x, record.y, record.z),
            record.hits,
            record.tiles_in_page,
            record.last_access_minutes,
        )
    }

    pub fn to_record(&self) -> PageRecord {
        PageRecord {
            x: self.index.x,
            y: self.index.y,
            z: self.index.z,
            hits: self.num_hits(),
            tiles_in_page: self.num_tiles_in_page(),
            last_access_minutes: self.last_access_minutes(),
        }
    }

    /// Record a request against this page
    pub fn mark_hit(&self, now_minutes: u32) {
        self.hits.fetch_add(1, Ordering::AcqRel);
        self.last_access.store(now_minutes, Ordering::Release);
    }

    /// A tile of this page was stored; returns the new tile count
    pub fn add_tile(&self) -> i64 {
        self.tiles.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// A tile of this page was deleted; returns the new tile count
    pub fn remove_tile(&self) -> i64 {
        self.tiles.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn index(&self) -> PageIndex {
        self.index
    }

    pub fn zoom_level(&self) -> u32 {
        self.index.z
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn num_hits(&self) -> u64 {
        self.hits.load(Ordering::Acquire)
    }

    pub fn num_tiles_in_page(&self) -> i64 {
        self.tiles.load(Ordering::Acquire)
    }

    pub fn last_access_minutes(&self) -> u32 {
        self.last_access.load(Ordering::Acquire)
    }
}

impl Clone for TilePage {
    fn clone(&self) -> Self {
        Self::with_stats(
            self.index,
            self.num_hits(),
            self.num_tiles_in_page(),
            self.last_access_minutes(),
        )
        .with_sequence(self.sequence)
    }
}

impl PartialEq for TilePage {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for TilePage {}

impl Hash for TilePage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl fmt::Display for TilePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] hits: {}, tiles: {}, last access: {}",
            self.index,
            self.num_hits(),
            self.num_tiles_in_page(),
            self.last_access_minutes()
        )
    }
}

// =============================================================================
// Tests
// =============================================================================

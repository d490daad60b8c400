//! Quota Value Objects
//!
//! Storage magnitudes and per-layer quota accounting state.
//!
//! `LayerQuota` usage is owned by the accounting subsystem (see
//! [`crate::accounting`]); the expiration policy only reads it.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Storage Units
// =============================================================================

/// Binary storage units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StorageUnit {
    B,
    KiB,
    MiB,
    GiB,
    TiB,
}

impl StorageUnit {
    const ALL: [StorageUnit; 5] = [
        StorageUnit::B,
        StorageUnit::KiB,
        StorageUnit::MiB,
        StorageUnit::GiB,
        StorageUnit::TiB,
    ];

    /// Number of bytes in one unit
    pub const fn bytes(self) -> i64 {
        match self {
            StorageUnit::B => 1,
            StorageUnit::KiB => 1 << 10,
            StorageUnit::MiB => 1 << 20,
            StorageUnit::GiB => 1 << 30,
            StorageUnit::TiB => 1 << 40,
        }
    }

    /// Largest unit in which `bytes` is at least one
    pub fn best_fit(bytes: i64) -> Self {
        let magnitude = bytes.unsigned_abs();
        Self::ALL
            .iter()
            .rev()
            .copied()
            .find(|unit| magnitude >= unit.bytes() as u64)
            .unwrap_or(StorageUnit::B)
    }
}

impl fmt::Display for StorageUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageUnit::B => write!(f, "B"),
            StorageUnit::KiB => write!(f, "KiB"),
            StorageUnit::MiB => write!(f, "MiB"),
            StorageUnit::GiB => write!(f, "GiB"),
            StorageUnit::TiB => write!(f, "TiB"),
        }
    }
}

impl FromStr for StorageUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "b" => Ok(StorageUnit::B),
            "k" | "kb" | "kib" => Ok(StorageUnit::KiB),
            "m" | "mb" | "mib" => Ok(StorageUnit::MiB),
            "g" | "gb" | "gib" => Ok(StorageUnit::GiB),
            "t" | "tb" | "tib" => Ok(StorageUnit::TiB),
            other => Err(Error::QuotaParse(format!("unknown storage unit '{}'", other))),
        }
    }
}

// =============================================================================
// Quota
// =============================================================================

/// A storage magnitude in bytes.
///
/// May be negative when produced by [`Quota::difference`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "QuotaRepr", into = "String")]
pub struct Quota {
    bytes: i64,
}

impl Quota {
    /// Zero bytes
    pub const ZERO: Quota = Quota { bytes: 0 };

    /// Create a quota from a raw byte count
    pub const fn from_bytes(bytes: i64) -> Self {
        Self { bytes }
    }

    /// Create a quota from a value expressed in `unit`
    pub fn new(value: f64, unit: StorageUnit) -> Self {
        Self {
            bytes: (value * unit.bytes() as f64).round() as i64,
        }
    }

    /// Byte count
    pub const fn bytes(&self) -> i64 {
        self.bytes
    }

    /// `self - other`
    pub fn difference(&self, other: &Quota) -> Quota {
        Quota::from_bytes(self.bytes.saturating_sub(other.bytes))
    }

    /// The smaller of the two
    pub fn min(self, other: Quota) -> Quota {
        std::cmp::min(self, other)
    }

    /// True when strictly greater than zero
    pub fn is_positive(&self) -> bool {
        self.bytes > 0
    }

    /// Value converted to `unit`
    pub fn value_in(&self, unit: StorageUnit) -> f64 {
        self.bytes as f64 / unit.bytes() as f64
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = StorageUnit::best_fit(self.bytes);
        let rendered = format!("{:.2}", self.value_in(unit));
        // one to two fraction digits: 1.50 -> 1.5, 2.00 -> 2.0
        let rendered = match rendered.strip_suffix('0') {
            Some(trimmed) if !trimmed.ends_with('.') => trimmed.to_string(),
            _ => rendered,
        };
        write!(f, "{} {}", rendered, unit)
    }
}

impl FromStr for Quota {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| Error::QuotaParse(format!("invalid quota value '{}'", s)))?;
        let unit: StorageUnit = unit.parse()?;
        Ok(Quota::new(value, unit))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuotaRepr {
    Bytes(i64),
    Text(String),
}

impl TryFrom<QuotaRepr> for Quota {
    type Error = Error;

    fn try_from(repr: QuotaRepr) -> Result<Self> {
        match repr {
            QuotaRepr::Bytes(bytes) => Ok(Quota::from_bytes(bytes)),
            QuotaRepr::Text(text) => text.parse(),
        }
    }
}

impl From<Quota> for String {
    fn from(quota: Quota) -> Self {
        quota.to_string()
    }
}

// =============================================================================
// Layer Quota
// =============================================================================

/// Configured limit and live usage for one layer
#[derive(Debug)]
pub struct LayerQuota {
    layer: String,
    limit: Option<Quota>,
    used_bytes: AtomicI64,
    dirty: AtomicBool,
}

impl LayerQuota {
    /// Create a quota record for `layer`
    pub fn new(layer: impl Into<String>, limit: Option<Quota>) -> Self {
        Self {
            layer: layer.into(),
            limit,
            used_bytes: AtomicI64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    /// Create a quota record with a configured limit
    pub fn with_limit(layer: impl Into<String>, limit: Quota) -> Self {
        Self::new(layer, Some(limit))
    }

    /// Layer name
    pub fn layer(&self) -> &str {
        &self.layer
    }

    /// Configured limit, if any
    pub fn limit(&self) -> Option<Quota> {
        self.limit
    }

    /// Live used quota
    pub fn used_quota(&self) -> Quota {
        Quota::from_bytes(self.used_bytes.load(Ordering::Acquire))
    }

    /// `used - limit`; `None` when no limit is configured
    pub fn exceeded(&self) -> Option<Quota> {
        self.limit.map(|limit| self.used_quota().difference(&limit))
    }

    /// Adjust usage by `delta` bytes and mark the record dirty
    pub fn add_used(&self, delta: i64) -> Quota {
        let previous = self.used_bytes.fetch_add(delta, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
        Quota::from_bytes(previous.saturating_add(delta))
    }

    /// Overwrite usage (e.g. after a cache scan)
    pub fn set_used(&self, used: Quota) {
        self.used_bytes.store(used.bytes(), Ordering::Release);
        self.dirty.store(true, Ordering::Release);
    }

    /// Flag the page state of this layer as needing a save
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clear the dirty flag, returning its previous value
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Page Record Codec
//!
//! Fixed-width, versioned binary encoding of persisted page statistics.
//!
//! # Layout
//!
//! ```text
//! ┌──────────┬───────────┬──────────────────────────────────────────┐
//! │ "TQPG"   │ count u32 │ record * count                           │
//! └──────────┴───────────┴──────────────────────────────────────────┘
//!
//! record (34 bytes, big-endian):
//! ┌─────────┬─────┬─────┬─────┬─────────────┬──────────┬───────────┐
//! │ ver u16 │ x   │ y   │ z   │ last access │ hits u64 │ tiles i64 │
//! └─────────┴─────┴─────┴─────┴─────────────┴──────────┴───────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::domain::ports::PageRecord;
use crate::error::{Error, Result};

/// File magic
pub const MAGIC: &[u8; 4] = b"TQPG";

/// Current record format version
pub const RECORD_VERSION: u16 = 1;

/// Encoded size of one record
pub const RECORD_LEN: usize = 2 + 4 * 4 + 8 + 8;

const HEADER_LEN: usize = MAGIC.len() + 4;

/// Encode `records` into a page state file body
pub fn encode(records: &[PageRecord]) -> Result<Bytes> {
    let count = u32::try_from(records.len())
        .map_err(|_| Error::Internal(format!("too many page records: {}", records.len())))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + records.len() * RECORD_LEN);
    buf.put_slice(MAGIC);
    buf.put_u32(count);
    for record in records {
        buf.put_u16(RECORD_VERSION);
        buf.put_u32(record.x);
        buf.put_u32(record.y);
        buf.put_u32(record.z);
        buf.put_u32(record.last_access_minutes);
        buf.put_u64(record.hits);
        buf.put_i64(record.tiles_in_page);
    }
    Ok(buf.freeze())
}

/// Decode a page state file body; `source_name` is used in errors
pub fn decode(mut buf: &[u8], source_name: &str) -> Result<Vec<PageRecord>> {
    let corrupt = |reason: String| Error::CorruptPageState {
        source_name: source_name.to_string(),
        reason,
    };

    if buf.remaining() < HEADER_LEN {
        return Err(corrupt(format!("header truncated at {} bytes", buf.remaining())));
    }
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if &magic != MAGIC {
        return Err(corrupt(format!("bad magic {:02x?}", magic)));
    }

    let count = buf.get_u32() as usize;
    let expected = count.saturating_mul(RECORD_LEN);
    if buf.remaining() != expected {
        return Err(corrupt(format!(
            "expected {} records ({} bytes), found {} bytes",
            count,
            expected,
            buf.remaining()
        )));
    }

    let mut records = Vec::with_capacity(count);
    for n in 0..count {
        let version = buf.get_u16();
        if version != RECORD_VERSION {
            return Err(corrupt(format!(
                "record {} has unsupported version {}",
                n, version
            )));
        }
        let x = buf.get_u32();
        let y = buf.get_u32();
        let z = buf.get_u32();
        let last_access_minutes = buf.get_u32();
        let hits = buf.get_u64();
        let tiles_in_page = buf.get_i64();
        records.push(PageRecord {
            x,
            y,
            z,
            hits,
            tiles_in_page,
            last_access_minutes,
        });
    }
    Ok(records)
}

// =============================================================================
// Tests
// =============================================================================

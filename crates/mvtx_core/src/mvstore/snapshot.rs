//! Snapshot record framing.
//!
//! Every store commit appends one self-contained record to the backend:
//!
//! ```text
//! | magic "MVTX" (4) | version u16 | payload length u32 | CBOR payload | crc32 u32 |
//! ```
//!
//! Integers are little-endian and the checksum covers header and payload.
//! On open the records are scanned front to back and the last one that
//! passes its checksum wins; anything after it is a torn write.

use crate::error::{CoreError, CoreResult};
use crate::types::MapId;
use mvtx_codec::{from_cbor, to_cbor};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::warn;

/// Magic bytes identifying a snapshot record.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"MVTX";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// magic (4) + version (2) + length (4)
const HEADER_SIZE: usize = 10;

const CRC_SIZE: usize = 4;

/// Serialized image of a whole store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub(crate) version: u64,
    pub(crate) last_map_id: u32,
    pub(crate) maps: Vec<MapImage>,
}

/// Serialized image of one map; `entries` is the map's own CBOR encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MapImage {
    pub(crate) id: MapId,
    pub(crate) name: String,
    pub(crate) entries: Vec<u8>,
}

/// Result of scanning a backend's contents.
#[derive(Debug)]
pub(crate) struct Recovered {
    /// The newest intact snapshot, if any.
    pub(crate) snapshot: Option<Snapshot>,
    /// Length of the prefix made of intact records.
    pub(crate) valid_len: u64,
}

pub(crate) fn encode_record(snapshot: &Snapshot) -> CoreResult<Vec<u8>> {
    let payload = to_cbor(snapshot)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::invalid_operation("snapshot larger than 4 GiB"))?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    buf.extend_from_slice(&SNAPSHOT_MAGIC);
    buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Validates the record starting at `offset`, returning its payload range
/// and the offset just past it.
fn frame_at(bytes: &[u8], offset: usize) -> Result<(Range<usize>, usize), &'static str> {
    let rest = &bytes[offset..];
    if rest.len() < HEADER_SIZE + CRC_SIZE {
        return Err("truncated header");
    }
    if rest[..4] != SNAPSHOT_MAGIC {
        return Err("bad magic");
    }
    if u16::from_le_bytes([rest[4], rest[5]]) != SNAPSHOT_VERSION {
        return Err("unsupported version");
    }
    let len = read_u32(&rest[6..10]) as usize;
    let body_end = HEADER_SIZE + len;
    if rest.len() < body_end + CRC_SIZE {
        return Err("truncated payload");
    }
    if crc32fast::hash(&rest[..body_end]) != read_u32(&rest[body_end..]) {
        return Err("checksum mismatch");
    }
    Ok((
        offset + HEADER_SIZE..offset + body_end,
        offset + body_end + CRC_SIZE,
    ))
}

/// Scans `bytes` for the newest intact snapshot.
///
/// With `strict`, a damaged record is an error instead of the end of the log.
pub(crate) fn read_latest(bytes: &[u8], strict: bool) -> CoreResult<Recovered> {
    let mut offset = 0;
    let mut latest = None;
    while offset < bytes.len() {
        match frame_at(bytes, offset) {
            Ok((payload, next)) => {
                latest = Some(payload);
                offset = next;
            }
            Err(reason) if strict => {
                return Err(CoreError::corruption(format!(
                    "snapshot record at offset {offset}: {reason}"
                )));
            }
            Err(reason) => {
                warn!(
                    offset,
                    discarded = bytes.len() - offset,
                    reason,
                    "ignoring damaged snapshot tail"
                );
                break;
            }
        }
    }

    let snapshot = latest
        .map(|range| from_cbor::<Snapshot>(&bytes[range]))
        .transpose()?;
    Ok(Recovered {
        snapshot,
        valid_len: offset as u64,
    })
}

//! Event codec
//!
//! Fixed-width layout shared with the probe: `pid` then `size`, both
//! native-endian `u64`, 16 bytes, no padding.

use allocwatch_common::AllocEvent;

use crate::domain::ShortRecordError;

/// Decode one drained record
///
/// Fails only when the record is shorter than [`AllocEvent::SIZE`]. Trailing
/// bytes are ignored and field values are accepted as-is.
///
/// # Errors
/// Returns [`ShortRecordError`] for undersized records
pub fn decode(bytes: &[u8]) -> Result<AllocEvent, ShortRecordError> {
    AllocEvent::from_ne_bytes(bytes)
        .ok_or(ShortRecordError { len: bytes.len(), expected: AllocEvent::SIZE })
}

/// Producer-side mirror of [`decode`]
#[must_use]
pub fn encode(event: &AllocEvent) -> [u8; AllocEvent::SIZE] {
    event.to_ne_bytes()
}

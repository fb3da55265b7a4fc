//! Deterministic payload generation.

use bytes::Bytes;

/// `len` bytes whose content depends on the position, so misordered or
/// dropped fragments change the result.
#[must_use]
pub fn patterned(len: usize) -> Bytes {
    (0..len)
        .map(|i| {
            let block = (i / 251) as u8;
            (i as u8).wrapping_mul(31).wrapping_add(block)
        })
        .collect()
}

//! Payload masking as described in [RFC 6455 Section 5.3](https://datatracker.ietf.org/doc/html/rfc6455#section-5.3).
//!
//! Byte `i` of the payload is XORed with byte `i % 4` of the masking key. Applying the same key
//! twice restores the original payload.

/// Payloads at least this long are masked four bytes at a time.
pub const WORD_MASK_THRESHOLD: usize = 128;

/// Mask/unmask a payload in place.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    if buf.len() < WORD_MASK_THRESHOLD {
        apply_mask_fallback(buf, mask);
    } else {
        apply_mask_words(buf, mask);
    }
}

/// Returns a masked copy of `data`, leaving the input untouched.
pub fn mask_bytes(data: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut out = data.to_vec();
    apply_mask(&mut out, mask);
    out
}

#[inline]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Word-sized variant of [`apply_mask`]. Every chunk starts at an offset that is a multiple of
/// four, so the key lines up with the chunk without any rotation.
#[inline]
fn apply_mask_words(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);

    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ mask_u32;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    apply_mask_fallback(chunks.into_remainder(), mask);
}

//! Interleaved f32 samples ↔ payload bytes (little-endian).

use bytes::{Buf, BufMut};

/// Bytes per encoded sample.
pub const SAMPLE_BYTES: usize = 4;

/// Number of channels described by a channel mask.
pub fn channel_count(channel_mask: u32) -> u16 {
    channel_mask.count_ones() as u16
}

/// Write as many samples as fit into `dst`. Returns the number written.
pub fn write_samples(mut dst: &mut [u8], samples: &[f32]) -> usize {
    let count = samples.len().min(dst.len() / SAMPLE_BYTES);
    for &s in &samples[..count] {
        dst.put_f32_le(s);
    }
    count
}

/// Read as many whole samples as `src` holds and `out` has room for.
pub fn read_samples(mut src: &[u8], out: &mut [f32]) -> usize {
    let count = out.len().min(src.len() / SAMPLE_BYTES);
    for slot in &mut out[..count] {
        *slot = src.get_f32_le();
    }
    count
}

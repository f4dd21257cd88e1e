//! # Block FEC Codec
//!
//! Systematic erasure code over GF(2^8). A block is N source payloads plus
//! M repair payloads; any N of the N+M reconstruct every source payload
//! bit for bit.
//!
//! Repair row `r` is `Σ c[r][j] · S_j` where `S_j` is source `j` widened to
//! a common symbol: a 2-byte big-endian length prefix, the payload, then
//! zero padding up to the longest source of the block. Carrying the length
//! inside the code lets recovery restore the exact payload size.
//!
//! Coefficients come from the Cauchy matrix `c[r][j] = 1 / (r ⊕ (M + j))`.
//! Every square submatrix of a Cauchy matrix is invertible, which is what
//! makes any N shards sufficient. With a single repair row the coefficients
//! are all 1 and the code degenerates to plain XOR parity.
//!
//! Encode and decode run to completion on the calling thread with no
//! blocking calls; decode draws its output buffers from a [`BufferPool`].

use bytes::Bytes;

use crate::error::{Result, TransportError};
use crate::pool::{BufferPool, SliceMut};
use crate::wire::MAX_BLOCK_PACKETS;

/// Bytes of length prefix carried inside every symbol.
pub const LEN_PREFIX: usize = 2;

// ─── GF(2^8) Arithmetic ─────────────────────────────────────────────────────

/// Reduction polynomial x^8 + x^4 + x^3 + x + 1.
const GF_POLY: u16 = 0x11B;

struct GfTables {
    /// `exp[i] = 3^i`, doubled so `exp[log a + log b]` needs no modulo.
    exp: [u8; 512],
    log: [u8; 256],
}

const fn build_tables() -> GfTables {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        // x · 3 = (x · 2) ⊕ x
        let mut next = (x << 1) ^ x;
        if next & 0x100 != 0 {
            next ^= GF_POLY;
        }
        x = next;
        i += 1;
    }
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    GfTables { exp, log }
}

static GF: GfTables = build_tables();

#[inline]
pub fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    GF.exp[GF.log[a as usize] as usize + GF.log[b as usize] as usize]
}

/// Multiplicative inverse. `a` must be non-zero.
#[inline]
pub fn gf_inv(a: u8) -> u8 {
    debug_assert!(a != 0, "zero has no inverse");
    GF.exp[255 - GF.log[a as usize] as usize]
}

/// `dst ^= c · src`, element-wise over the shorter of the two.
fn mul_acc(dst: &mut [u8], src: &[u8], c: u8) {
    match c {
        0 => {}
        1 => {
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= s;
            }
        }
        _ => {
            let lc = GF.log[c as usize] as usize;
            for (d, &s) in dst.iter_mut().zip(src) {
                if s != 0 {
                    *d ^= GF.exp[GF.log[s as usize] as usize + lc];
                }
            }
        }
    }
}

/// `buf *= c` in place.
fn scale(buf: &mut [u8], c: u8) {
    if c == 1 {
        return;
    }
    for b in buf.iter_mut() {
        *b = gf_mul(*b, c);
    }
}

/// Coefficient of source `col` in repair row `row`.
fn coefficient(repair_count: usize, row: usize, col: usize) -> u8 {
    if repair_count == 1 {
        return 1;
    }
    gf_inv(row as u8 ^ (repair_count + col) as u8)
}

/// Accumulate `c · widen(payload)` into a symbol.
fn mul_acc_symbol(symbol: &mut [u8], payload: &[u8], c: u8) {
    let prefix = (payload.len() as u16).to_be_bytes();
    mul_acc(&mut symbol[..LEN_PREFIX], &prefix, c);
    mul_acc(&mut symbol[LEN_PREFIX..], payload, c);
}

/// Symbol size for a block whose longest source payload is `max_payload`.
pub fn symbol_len(max_payload: usize) -> usize {
    max_payload + LEN_PREFIX
}

fn check_geometry(source_count: usize, repair_count: usize) -> Result<()> {
    if source_count == 0 {
        return Err(TransportError::Config("block needs at least one source".into()));
    }
    if source_count + repair_count > MAX_BLOCK_PACKETS {
        return Err(TransportError::Config(format!(
            "block of {source_count}+{repair_count} exceeds {MAX_BLOCK_PACKETS} packets"
        )));
    }
    Ok(())
}

/// Mutable reference to `items[a]` alongside a shared one to `items[b]`.
fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &T) {
    debug_assert_ne!(a, b);
    if a < b {
        let (lo, hi) = items.split_at_mut(b);
        (&mut lo[a], &hi[0])
    } else {
        let (lo, hi) = items.split_at_mut(a);
        (&mut hi[0], &lo[b])
    }
}

// ─── Encoder ────────────────────────────────────────────────────────────────

/// Sender-side block encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEncoder {
    source_count: usize,
    repair_count: usize,
}

impl BlockEncoder {
    pub fn new(source_count: usize, repair_count: usize) -> Result<Self> {
        check_geometry(source_count, repair_count)?;
        Ok(BlockEncoder {
            source_count,
            repair_count,
        })
    }

    pub fn source_count(&self) -> usize {
        self.source_count
    }

    pub fn repair_count(&self) -> usize {
        self.repair_count
    }

    /// Compute the M repair symbols of a block in place.
    ///
    /// Every repair buffer must be exactly [`symbol_len`] of the longest
    /// source. Deterministic for a given source order.
    pub fn encode_into(&self, sources: &[&[u8]], repairs: &mut [&mut [u8]]) -> Result<()> {
        if sources.len() != self.source_count || repairs.len() != self.repair_count {
            return Err(TransportError::Config(format!(
                "encoder expects {}+{} shards, got {}+{}",
                self.source_count,
                self.repair_count,
                sources.len(),
                repairs.len()
            )));
        }
        let max_payload = sources.iter().map(|s| s.len()).max().unwrap_or(0);
        let sym = symbol_len(max_payload);
        if repairs.iter().any(|r| r.len() != sym) {
            return Err(TransportError::Config(format!(
                "repair buffers must be {sym} bytes"
            )));
        }

        for (row, repair) in repairs.iter_mut().enumerate() {
            repair.fill(0);
            for (col, source) in sources.iter().enumerate() {
                mul_acc_symbol(repair, source, coefficient(self.repair_count, row, col));
            }
        }
        Ok(())
    }

    /// Encode into freshly acquired pool buffers.
    pub fn encode(&self, sources: &[Bytes], pool: &BufferPool) -> Result<Vec<Bytes>> {
        let refs: Vec<&[u8]> = sources.iter().map(|s| &s[..]).collect();
        let max_payload = refs.iter().map(|s| s.len()).max().unwrap_or(0);
        let sym = symbol_len(max_payload);

        let mut buffers = acquire_symbols(pool, self.repair_count, sym)?;
        {
            let mut targets: Vec<&mut [u8]> = buffers.iter_mut().map(|b| &mut b[..]).collect();
            self.encode_into(&refs, &mut targets)?;
        }
        Ok(buffers.into_iter().map(SliceMut::freeze).collect())
    }
}

fn acquire_symbols(pool: &BufferPool, count: usize, sym: usize) -> Result<Vec<SliceMut>> {
    if sym > pool.buffer_size() {
        return Err(TransportError::MalformedPacket("symbol exceeds pool buffer"));
    }
    (0..count)
        .map(|_| {
            let mut buf = pool.acquire()?;
            buf.truncate(sym);
            Ok(buf)
        })
        .collect()
}

// ─── Decoder ────────────────────────────────────────────────────────────────

/// Receiver-side block decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDecoder {
    source_count: usize,
    repair_count: usize,
}

impl BlockDecoder {
    pub fn new(source_count: usize, repair_count: usize) -> Result<Self> {
        check_geometry(source_count, repair_count)?;
        Ok(BlockDecoder {
            source_count,
            repair_count,
        })
    }

    /// Reconstruct the N source payloads of a block.
    ///
    /// `shards` is indexed by position (`0..N` sources, `N..N+M` repairs)
    /// with `None` for packets that never arrived. When every source is
    /// present they are returned as-is without touching the repairs.
    pub fn decode(
        &self,
        block_id: u32,
        shards: &[Option<Bytes>],
        pool: &BufferPool,
    ) -> Result<Vec<Bytes>> {
        let n = self.source_count;
        if shards.len() != n + self.repair_count {
            return Err(TransportError::MalformedPacket("shard count does not match block"));
        }

        let missing: Vec<usize> = (0..n).filter(|&i| shards[i].is_none()).collect();
        if missing.is_empty() {
            return Ok(shards[..n].iter().flatten().cloned().collect());
        }

        let received = shards.iter().filter(|s| s.is_some()).count();
        if received < n {
            return Err(TransportError::BlockUnrecoverable {
                block_id,
                received,
                required: n,
            });
        }

        // Enough shards means at least `missing.len()` repairs arrived.
        let rows: Vec<(usize, &Bytes)> = shards[n..]
            .iter()
            .enumerate()
            .filter_map(|(row, s)| s.as_ref().map(|s| (row, s)))
            .take(missing.len())
            .collect();

        let sym = rows[0].1.len();
        if sym < LEN_PREFIX || rows.iter().any(|(_, r)| r.len() != sym) {
            return Err(TransportError::MalformedPacket("repair lengths disagree"));
        }
        if shards[..n].iter().flatten().any(|s| symbol_len(s.len()) > sym) {
            return Err(TransportError::MalformedPacket("source longer than repair symbol"));
        }

        // Right-hand side: each repair minus the contribution of the sources
        // that did arrive.
        let mut rhs = acquire_symbols(pool, missing.len(), sym)?;
        for (buf, &(row, repair)) in rhs.iter_mut().zip(&rows) {
            buf.copy_from_slice(repair);
            for (col, source) in shards[..n].iter().enumerate() {
                if let Some(source) = source {
                    mul_acc_symbol(buf, source, coefficient(self.repair_count, row, col));
                }
            }
        }

        let mut matrix: Vec<Vec<u8>> = rows
            .iter()
            .map(|&(row, _)| {
                missing
                    .iter()
                    .map(|&col| coefficient(self.repair_count, row, col))
                    .collect()
            })
            .collect();

        // Gauss-Jordan elimination, applied to the symbols alongside.
        let size = missing.len();
        for col in 0..size {
            let pivot = (col..size)
                .find(|&r| matrix[r][col] != 0)
                .ok_or(TransportError::BlockUnrecoverable {
                    block_id,
                    received,
                    required: n,
                })?;
            matrix.swap(col, pivot);
            rhs.swap(col, pivot);

            let inv = gf_inv(matrix[col][col]);
            scale(&mut matrix[col], inv);
            scale(&mut rhs[col], inv);

            for r in 0..size {
                let factor = matrix[r][col];
                if r == col || factor == 0 {
                    continue;
                }
                let (target, pivot_row) = pair_mut(&mut matrix, r, col);
                mul_acc(target, pivot_row, factor);
                let (target, pivot_row) = pair_mut(&mut rhs, r, col);
                mul_acc(target, pivot_row, factor);
            }
        }

        let mut recovered = Vec::with_capacity(size);
        for buf in rhs {
            let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if LEN_PREFIX + len > sym {
                return Err(TransportError::MalformedPacket("recovered length out of range"));
            }
            recovered.push(buf.freeze().slice(LEN_PREFIX..LEN_PREFIX + len));
        }

        let mut recovered = recovered.into_iter();
        Ok(shards[..n]
            .iter()
            .map(|s| match s {
                Some(payload) => payload.clone(),
                None => recovered.next().unwrap_or_default(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::AcquireMode;

    fn pool() -> BufferPool {
        BufferPool::new(32, 256, AcquireMode::NonBlocking)
    }

    fn payloads(n: usize, len: usize) -> Vec<Bytes> {
        (0..n)
            .map(|i| Bytes::from((0..len).map(|j| (i * 31 + j * 7) as u8).collect::<Vec<_>>()))
            .collect()
    }

    fn shards(sources: &[Bytes], repairs: &[Bytes], keep: &[usize]) -> Vec<Option<Bytes>> {
        sources
            .iter()
            .chain(repairs)
            .enumerate()
            .map(|(i, s)| keep.contains(&i).then(|| s.clone()))
            .collect()
    }

    // ─── GF(2^8) ────────────────────────────────────────────────────────

    #[test]
    fn gf_inverse_roundtrip() {
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1, "a = {a}");
        }
    }

    #[test]
    fn gf_mul_known_values() {
        // Standard AES field examples.
        assert_eq!(gf_mul(0x57, 0x83), 0xC1);
        assert_eq!(gf_mul(0x57, 0x13), 0xFE);
        assert_eq!(gf_mul(0, 0x13), 0);
        assert_eq!(gf_mul(1, 0x13), 0x13);
    }

    #[test]
    fn gf_mul_distributes_over_xor() {
        for a in [3u8, 0x1D, 0x80, 0xFF] {
            for b in [1u8, 0x42, 0xAA] {
                for c in [2u8, 0x0F, 0xF0] {
                    assert_eq!(gf_mul(a, b ^ c), gf_mul(a, b) ^ gf_mul(a, c));
                }
            }
        }
    }

    #[test]
    fn cauchy_coefficients_are_nonzero() {
        for m in 2..8 {
            for row in 0..m {
                for col in 0..(MAX_BLOCK_PACKETS - m) {
                    assert_ne!(coefficient(m, row, col), 0);
                }
            }
        }
    }

    // ─── Encode / Decode ────────────────────────────────────────────────

    #[test]
    fn recovers_positions_one_and_four_of_four_plus_two() {
        let pool = pool();
        let enc = BlockEncoder::new(4, 2).unwrap();
        let dec = BlockDecoder::new(4, 2).unwrap();
        let sources = payloads(4, 64);
        let repairs = enc.encode(&sources, &pool).unwrap();

        let got = dec.decode(7, &shards(&sources, &repairs, &[0, 2, 3, 5]), &pool).unwrap();
        assert_eq!(got, sources);
    }

    #[test]
    fn single_repair_is_xor_parity() {
        let pool = pool();
        let enc = BlockEncoder::new(3, 1).unwrap();
        let sources = payloads(3, 16);
        let repairs = enc.encode(&sources, &pool).unwrap();

        let mut expected = vec![0u8; symbol_len(16)];
        for s in &sources {
            mul_acc_symbol(&mut expected, s, 1);
        }
        assert_eq!(&repairs[0][..], &expected[..]);

        let dec = BlockDecoder::new(3, 1).unwrap();
        let got = dec.decode(0, &shards(&sources, &repairs, &[0, 2, 3]), &pool).unwrap();
        assert_eq!(got, sources);
    }

    #[test]
    fn recovers_unequal_lengths_exactly() {
        let pool = pool();
        let enc = BlockEncoder::new(3, 2).unwrap();
        let dec = BlockDecoder::new(3, 2).unwrap();
        let sources = vec![
            Bytes::from_static(b"short"),
            Bytes::from_static(b"a considerably longer payload"),
            Bytes::new(),
        ];
        let repairs = enc.encode(&sources, &pool).unwrap();
        let got = dec.decode(1, &shards(&sources, &repairs, &[3, 4, 1]), &pool).unwrap();
        assert_eq!(got, sources);
    }

    #[test]
    fn intact_block_skips_fec() {
        let pool = pool();
        let dec = BlockDecoder::new(2, 2).unwrap();
        let sources = payloads(2, 8);
        let input = vec![Some(sources[0].clone()), Some(sources[1].clone()), None, None];
        let got = dec.decode(3, &input, &pool).unwrap();
        assert_eq!(got[0].as_ptr(), sources[0].as_ptr());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn too_few_shards_is_unrecoverable() {
        let pool = pool();
        let enc = BlockEncoder::new(4, 2).unwrap();
        let dec = BlockDecoder::new(4, 2).unwrap();
        let sources = payloads(4, 8);
        let repairs = enc.encode(&sources, &pool).unwrap();
        let err = dec
            .decode(9, &shards(&sources, &repairs, &[0, 4, 5]), &pool)
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::BlockUnrecoverable {
                block_id: 9,
                received: 3,
                required: 4
            }
        );
    }

    #[test]
    fn mismatched_repair_lengths_are_malformed() {
        let pool = pool();
        let dec = BlockDecoder::new(2, 2).unwrap();
        let input = vec![
            None,
            None,
            Some(Bytes::from_static(&[0; 10])),
            Some(Bytes::from_static(&[0; 12])),
        ];
        assert!(matches!(
            dec.decode(0, &input, &pool),
            Err(TransportError::MalformedPacket(_))
        ));
    }

    #[test]
    fn encoding_is_deterministic() {
        let pool = pool();
        let enc = BlockEncoder::new(5, 3).unwrap();
        let sources = payloads(5, 40);
        assert_eq!(
            enc.encode(&sources, &pool).unwrap(),
            enc.encode(&sources, &pool).unwrap()
        );
    }

    #[test]
    fn decode_returns_buffers_to_pool() {
        let pool = pool();
        let enc = BlockEncoder::new(4, 2).unwrap();
        let dec = BlockDecoder::new(4, 2).unwrap();
        let sources = payloads(4, 32);
        let repairs = enc.encode(&sources, &pool).unwrap();
        let got = dec.decode(0, &shards(&sources, &repairs, &[1, 3, 4, 5]), &pool).unwrap();
        drop((got, repairs));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn rejects_oversized_geometry() {
        assert!(BlockEncoder::new(0, 2).is_err());
        assert!(BlockEncoder::new(250, 7).is_err());
        assert!(BlockDecoder::new(255, 1).is_ok());
    }
}

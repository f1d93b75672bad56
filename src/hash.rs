//! 32-bit MurmurHash3, used as the block fingerprint.
//!
//! Not cryptographic; two blocks with equal length and equal hash are
//! treated as identical by the dedup matcher.

/// Hash `data` with the x86 32-bit MurmurHash3 variant.
pub fn murmur3(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &byte) in tail.iter().enumerate() {
            k ^= (byte as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;

    h
}

#[cfg(test)]
mod tests {
    use super::murmur3;

    #[test]
    fn empty_input() {
        assert_eq!(murmur3(b"", 0), 0);
        assert_eq!(murmur3(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3(b"", 0xffff_ffff), 0x81f1_6f39);
    }

    #[test]
    fn tail_lengths() {
        // Reference values from the canonical verification set.
        assert_eq!(murmur3(&[0x21], 0), 0x7266_1cf4);
        assert_eq!(murmur3(&[0x21, 0x43], 0), 0xa0f7_b07a);
        assert_eq!(murmur3(&[0x21, 0x43, 0x65], 0), 0x7e4a_8634);
        assert_eq!(murmur3(&[0x21, 0x43, 0x65, 0x87], 0), 0xf55b_516b);
    }

    #[test]
    fn zero_bytes_are_not_a_fixed_point() {
        assert_eq!(murmur3(&[0x00], 0), 0x514e_28b7);
        assert_eq!(murmur3(&[0x00, 0x00], 0), 0x30f4_c306);
        assert_eq!(murmur3(&[0x00, 0x00, 0x00], 0), 0x85f0_b427);
        assert_eq!(murmur3(&[0x00, 0x00, 0x00, 0x00], 0), 0x2362_f9de);
        assert_eq!(murmur3(&[0xff, 0xff, 0xff, 0xff], 0), 0x7629_3b50);
    }

    #[test]
    fn seed_changes_hash() {
        let data = b"compressed block payload";
        assert_ne!(murmur3(data, 0), murmur3(data, 1));
    }
}

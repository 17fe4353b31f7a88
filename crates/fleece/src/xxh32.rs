//! 32-bit xxHash, used for string interning and as the default tree key
//! hash.

const PRIME1: u32 = 0x9E37_79B1;
const PRIME2: u32 = 0x85EB_CA77;
const PRIME3: u32 = 0xC2B2_AE3D;
const PRIME4: u32 = 0x27D4_EB2F;
const PRIME5: u32 = 0x1656_67B1;

/// Compute xxHash32 of `data` with the given seed.
#[must_use]
pub fn xxh32(data: &[u8], seed: u32) -> u32 {
    let (mut h32, tail) = if data.len() >= 16 {
        let mut acc = [
            seed.wrapping_add(PRIME1).wrapping_add(PRIME2),
            seed.wrapping_add(PRIME2),
            seed,
            seed.wrapping_sub(PRIME1),
        ];
        let mut blocks = data.chunks_exact(16);
        for block in &mut blocks {
            for (a, lane) in acc.iter_mut().zip(block.chunks_exact(4)) {
                *a = round(*a, read_u32(lane));
            }
        }
        let merged = acc[0]
            .rotate_left(1)
            .wrapping_add(acc[1].rotate_left(7))
            .wrapping_add(acc[2].rotate_left(12))
            .wrapping_add(acc[3].rotate_left(18));
        (merged, blocks.remainder())
    } else {
        (seed.wrapping_add(PRIME5), data)
    };

    h32 = h32.wrapping_add(data.len() as u32);

    let mut words = tail.chunks_exact(4);
    for word in &mut words {
        h32 = h32
            .wrapping_add(read_u32(word).wrapping_mul(PRIME3))
            .rotate_left(17)
            .wrapping_mul(PRIME4);
    }
    for &byte in words.remainder() {
        h32 = h32
            .wrapping_add(u32::from(byte).wrapping_mul(PRIME5))
            .rotate_left(11)
            .wrapping_mul(PRIME1);
    }

    // avalanche
    h32 ^= h32 >> 15;
    h32 = h32.wrapping_mul(PRIME2);
    h32 ^= h32 >> 13;
    h32 = h32.wrapping_mul(PRIME3);
    h32 ^= h32 >> 16;
    h32
}

fn round(acc: u32, input: u32) -> u32 {
    acc.wrapping_add(input.wrapping_mul(PRIME2))
        .rotate_left(13)
        .wrapping_mul(PRIME1)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

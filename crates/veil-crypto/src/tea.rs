//! TEA and XTEA block ciphers.
//!
//! Neither cipher ships in the RustCrypto family at the version this
//! workspace pins, so both are implemented here. Only the forward
//! direction is provided: CFB never runs the cipher backwards.
//!
//! Words are read and written big-endian, matching the reference
//! implementations.

const DELTA: u32 = 0x9E37_79B9;

/// Block size shared by TEA and XTEA.
pub const BLOCK_SIZE: usize = 8;

/// Key size shared by TEA and XTEA.
pub const KEY_SIZE: usize = 16;

fn split_key(key: &[u8; KEY_SIZE]) -> [u32; 4] {
    let mut k = [0u32; 4];
    for (i, word) in k.iter_mut().enumerate() {
        *word = u32::from_be_bytes([key[i * 4], key[i * 4 + 1], key[i * 4 + 2], key[i * 4 + 3]]);
    }
    k
}

fn load(block: &[u8]) -> (u32, u32) {
    (
        u32::from_be_bytes([block[0], block[1], block[2], block[3]]),
        u32::from_be_bytes([block[4], block[5], block[6], block[7]]),
    )
}

fn store(block: &mut [u8], v0: u32, v1: u32) {
    block[..4].copy_from_slice(&v0.to_be_bytes());
    block[4..8].copy_from_slice(&v1.to_be_bytes());
}

/// Tiny Encryption Algorithm with a configurable cycle count.
///
/// One cycle is two Feistel rounds. The `tea` suite runs 8 cycles
/// (16 rounds); the original paper recommends 32.
#[derive(Clone)]
pub struct Tea {
    key: [u32; 4],
    cycles: u32,
}

impl Tea {
    /// Cycle count used by the `tea` suite.
    pub const SUITE_CYCLES: u32 = 8;

    /// Create a cipher running `cycles` cycles.
    #[must_use]
    pub fn new(key: &[u8; KEY_SIZE], cycles: u32) -> Self {
        Self {
            key: split_key(key),
            cycles,
        }
    }

    /// Encrypt one 8-byte block in place.
    ///
    /// # Panics
    ///
    /// Panics if `block` is shorter than [`BLOCK_SIZE`].
    pub fn encrypt_block(&self, block: &mut [u8]) {
        let (mut v0, mut v1) = load(block);
        let [k0, k1, k2, k3] = self.key;
        let mut sum = 0u32;
        for _ in 0..self.cycles {
            sum = sum.wrapping_add(DELTA);
            v0 = v0.wrapping_add(
                (v1 << 4).wrapping_add(k0) ^ v1.wrapping_add(sum) ^ (v1 >> 5).wrapping_add(k1),
            );
            v1 = v1.wrapping_add(
                (v0 << 4).wrapping_add(k2) ^ v0.wrapping_add(sum) ^ (v0 >> 5).wrapping_add(k3),
            );
        }
        store(block, v0, v1);
    }
}

/// Extended TEA, 32 cycles.
#[derive(Clone)]
pub struct Xtea {
    key: [u32; 4],
}

impl Xtea {
    const CYCLES: u32 = 32;

    /// Create a cipher from a 16-byte key.
    #[must_use]
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            key: split_key(key),
        }
    }

    /// Encrypt one 8-byte block in place.
    ///
    /// # Panics
    ///
    /// Panics if `block` is shorter than [`BLOCK_SIZE`].
    pub fn encrypt_block(&self, block: &mut [u8]) {
        let (mut v0, mut v1) = load(block);
        let k = self.key;
        let mut sum = 0u32;
        for _ in 0..Self::CYCLES {
            v0 = v0.wrapping_add(
                ((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1) ^ sum.wrapping_add(k[(sum & 3) as usize]),
            );
            sum = sum.wrapping_add(DELTA);
            v1 = v1.wrapping_add(
                ((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0)
                    ^ sum.wrapping_add(k[((sum >> 11) & 3) as usize]),
            );
        }
        store(block, v0, v1);
    }
}

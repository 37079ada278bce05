use anyhow::{anyhow, Result};
use sha1::{Digest, Sha1};

pub const DEFAULT_BITS: u32 = 16;
pub const MAX_BITS: u32 = 32;

/// The identifier space `[0, 2^bits)` shared by node keys and file keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingSpace {
    bits: u32,
}

impl RingSpace {
    pub fn new(bits: u32) -> Result<Self> {
        if bits == 0 || bits > MAX_BITS {
            return Err(anyhow!(
                "ring bit width must be in 1..={}, got {}",
                MAX_BITS,
                bits
            ));
        }
        Ok(Self { bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn size(&self) -> u64 {
        1u64 << self.bits
    }

    // low 64 bits of the sha1 digest, reduced into the ring
    pub fn hash(&self, name: &str) -> u64 {
        let digest = Sha1::digest(name.as_bytes());
        let mut low = [0u8; 8];
        low.copy_from_slice(&digest[digest.len() - 8..]);
        u64::from_be_bytes(low) % self.size()
    }
}

impl Default for RingSpace {
    fn default() -> Self {
        Self { bits: DEFAULT_BITS }
    }
}

/// True iff `key` lies in the half-open ring interval `(lo, hi]`.
///
/// When `lo > hi` the interval crosses zero. When `lo == hi` the interval is
/// the whole ring: a node that is its own neighbour covers every key.
pub fn in_interval(key: u64, lo: u64, hi: u64) -> bool {
    if lo < hi {
        lo < key && key <= hi
    } else if lo > hi {
        key > lo || key <= hi
    } else {
        true
    }
}

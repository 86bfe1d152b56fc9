// Proof of Work: compact targets, header work and a nonce miner

use crate::core::{BlockHeader, Hash256};
use std::time::Instant;

/// Difficulty target representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Compact representation (bits field in block header)
    pub bits: u32,
}

impl Target {
    pub fn from_bits(bits: u32) -> Self {
        Self { bits }
    }

    fn exponent(&self) -> i32 {
        (self.bits >> 24) as i32
    }

    /// Mantissa with the sign bit cleared. A negative target counts as zero.
    fn mantissa(&self) -> u32 {
        if self.bits & 0x0080_0000 != 0 {
            0
        } else {
            self.bits & 0x007f_ffff
        }
    }

    /// Full 256-bit target, big-endian.
    /// target = mantissa * 256^(exponent - 3)
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let exponent = self.exponent();
        let mantissa = self.mantissa();
        let mut target = [0u8; 32];

        if exponent <= 3 {
            let value = mantissa >> (8 * (3 - exponent));
            target[29] = (value >> 16) as u8;
            target[30] = (value >> 8) as u8;
            target[31] = value as u8;
            return target;
        }

        let mantissa_bytes = [(mantissa >> 16) as u8, (mantissa >> 8) as u8, mantissa as u8];
        for (k, byte) in mantissa_bytes.into_iter().enumerate() {
            let index = 32 - exponent + k as i32;
            match usize::try_from(index) {
                Ok(i) if i < 32 => target[i] = byte,
                _ if byte != 0 => return [0xff; 32],
                _ => {}
            }
        }
        target
    }

    /// Check if a hash meets this target (hash < target). Hashes are stored
    /// in wire order, so they are compared reversed.
    pub fn is_valid_hash(&self, hash: &Hash256) -> bool {
        let mut hash_be = *hash.as_bytes();
        hash_be.reverse();
        hash_be < self.to_be_bytes()
    }

    /// Expected number of hashes needed to meet this target, roughly
    /// 2^256 / target. Saturates for targets below 2^128.
    pub fn work(&self) -> u128 {
        let mantissa = self.mantissa() as u128;
        if mantissa == 0 {
            return 0;
        }
        let shift = 256 - 8 * (self.exponent() - 3);
        if shift >= 128 {
            return u128::MAX;
        }
        if shift <= 0 {
            return 1;
        }
        ((1u128 << shift) / mantissa).max(1)
    }

    /// Count leading zero bits in target (difficulty indicator)
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0;
        for byte in self.to_be_bytes() {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }
}

/// Proof of Work miner
pub struct Miner {
    pub target: Target,
    /// Cached big-endian target for fast comparison
    target_be: [u8; 32],
}

impl Miner {
    pub fn new(bits: u32) -> Self {
        let target = Target::from_bits(bits);
        Self {
            target,
            target_be: target.to_be_bytes(),
        }
    }

    /// Search nonces until the header hash meets the target
    pub fn mine(&self, header: &mut BlockHeader) -> MiningResult {
        let start_time = Instant::now();
        let mut attempts = 0u64;

        for nonce in 0..=u32::MAX {
            header.nonce = nonce;
            let hash = header.hash();
            attempts += 1;

            if self.is_valid_hash_fast(&hash) {
                return MiningResult {
                    success: true,
                    nonce,
                    hash,
                    attempts,
                    duration: start_time.elapsed(),
                };
            }

            if attempts % 100_000 == 0 {
                let elapsed = start_time.elapsed();
                log::debug!(
                    "Mining attempts: {} ({:.1} KH/s)",
                    attempts,
                    attempts as f64 / elapsed.as_secs_f64() / 1000.0
                );
            }
        }

        MiningResult {
            success: false,
            nonce: 0,
            hash: Hash256::zero(),
            attempts,
            duration: start_time.elapsed(),
        }
    }

    #[inline]
    fn is_valid_hash_fast(&self, hash: &Hash256) -> bool {
        let mut hash_be = *hash.as_bytes();
        hash_be.reverse();
        hash_be < self.target_be
    }

    /// Verify that a block header satisfies PoW
    pub fn verify(&self, header: &BlockHeader) -> bool {
        self.target.is_valid_hash(&header.hash())
    }
}

/// Mining result
#[derive(Debug)]
pub struct MiningResult {
    pub success: bool,
    pub nonce: u32,
    pub hash: Hash256,
    pub attempts: u64,
    pub duration: std::time::Duration,
}

// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel's entropy source.
//!
//! A ChaCha20-based CSPRNG sits behind the `get_entropy` syscall. The
//! cipher key is a 256-bit entropy pool, seeded at boot from the
//! CPU's RDRAND when available, and the nonce is a monotonic 96-bit
//! counter that is never reset. Hardware entropy is stirred back into
//! the pool at a fixed interval of reads.
//!
//! The generator must be seeded before the first read; boot order
//! guarantees this on hardware, and [`read`] panics otherwise rather
//! than hand out predictable bytes.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]
#![deny(unused_crate_dependencies)]

use chacha20::cipher::{NewCipher, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use spin::Mutex;
use x86_64::instructions::random::RdRand;

/// The size of the entropy pool, in bytes.
///
const POOL_BYTES: usize = 32;

/// How many reads pass between re-stirs of hardware
/// entropy.
///
const RESEED_INTERVAL: u64 = 1024;

/// A ChaCha20-based cryptographically secure pseudo-random
/// number generator.
///
pub struct Csprng {
    pool: [u8; POOL_BYTES],
    counter: u128,
    seeded: bool,
}

/// The nonce value at which the generator gives up rather
/// than risk reuse.
///
const NONCE_OVERFLOW: u128 = 1 << 95;

impl Csprng {
    /// Returns an unseeded generator.
    ///
    pub const fn new() -> Csprng {
        Csprng {
            pool: [0u8; POOL_BYTES],
            counter: 0,
            seeded: false,
        }
    }

    /// Mixes bytes into the entropy pool.
    ///
    pub fn add_entropy(&mut self, entropy: &[u8]) {
        for (i, byte) in entropy.iter().enumerate() {
            self.pool[i % POOL_BYTES] ^= byte;
        }
    }

    /// Seeds the generator with a full pool of entropy.
    /// Must happen before the first read.
    ///
    pub fn seed(&mut self, entropy: &[u8; POOL_BYTES]) {
        self.add_entropy(&entropy[..]);
        self.seeded = true;
    }

    /// Fills `buf` with random bytes.
    ///
    /// # Panics
    ///
    /// `read` will panic if the generator has not been seeded, or if
    /// the nonce counter reaches 2^95.
    ///
    pub fn read(&mut self, buf: &mut [u8]) {
        if !self.seeded {
            panic!("CSPRNG read before seeding");
        }

        self.counter += 1;
        if self.counter >= NONCE_OVERFLOW {
            panic!("CSPRNG nonce overflowed");
        }

        // The nonce is the counter, little-endian, truncated
        // to 96 bits.
        let mut nonce = [0u8; 12];
        for (i, byte) in nonce.iter_mut().enumerate() {
            *byte = (self.counter >> (8 * i)) as u8;
        }

        // The keystream is the output; the buffer's previous
        // contents must not leak through.
        for byte in buf.iter_mut() {
            *byte = 0;
        }

        let mut cipher = ChaCha20::new(Key::from_slice(&self.pool), Nonce::from_slice(&nonce));
        cipher.apply_keystream(buf);
    }
}

impl Default for Csprng {
    fn default() -> Csprng {
        Csprng::new()
    }
}

/// The kernel's generator.
///
static RNG: Mutex<Csprng> = Mutex::new(Csprng::new());

/// Reads counting towards the next hardware re-stir.
///
static READS: Mutex<u64> = Mutex::new(0);

/// Seeds the kernel generator from hardware entropy. Called
/// once at boot, before the syscall surface comes up.
///
/// Without RDRAND the pool starts from a fixed pattern. That is not
/// entropy at all; RDRAND-less machines must stir platform entropy in
/// with [`add_entropy`] before the syscall surface comes up.
///
pub fn init() {
    let mut pool = [0x4bu8; POOL_BYTES];

    if let Some(rdrand) = RdRand::new() {
        for chunk in pool.chunks_mut(8) {
            if let Some(word) = rdrand.get_u64() {
                chunk.copy_from_slice(&word.to_le_bytes()[..chunk.len()]);
            }
        }
    }

    RNG.lock().seed(&pool);
}

/// Stirs caller-provided entropy into the kernel pool.
///
pub fn add_entropy(entropy: &[u8]) {
    RNG.lock().add_entropy(entropy);
}

/// Fills `buf` with random bytes from the kernel generator.
///
/// # Panics
///
/// `read` will panic before [`init`]; boot order is part of the
/// contract.
///
pub fn read(buf: &mut [u8]) {
    {
        let mut reads = READS.lock();
        *reads += 1;
        if *reads % RESEED_INTERVAL == 0 {
            if let Some(rdrand) = RdRand::new() {
                if let Some(word) = rdrand.get_u64() {
                    RNG.lock().add_entropy(&word.to_le_bytes());
                }
            }
        }
    }

    RNG.lock().read(buf);
}

#[cfg(test)]
mod tests {
    use super::{Csprng, POOL_BYTES};

    #[test]
    fn deterministic_from_seed() {
        let seed = [7u8; POOL_BYTES];

        let mut first = Csprng::new();
        first.seed(&seed);
        let mut second = Csprng::new();
        second.seed(&seed);

        let mut out_a = [0u8; 64];
        let mut out_b = [0u8; 64];
        first.read(&mut out_a);
        second.read(&mut out_b);

        // Same seed, same nonce: same stream.
        assert_eq!(out_a, out_b);

        // The stream is not degenerate.
        assert!(out_a.iter().any(|&byte| byte != 0));

        // The next read uses a fresh nonce.
        let mut out_c = [0u8; 64];
        first.read(&mut out_c);
        assert_ne!(out_a, out_c);
    }

    #[test]
    fn different_seeds_differ() {
        let mut first = Csprng::new();
        first.seed(&[1u8; POOL_BYTES]);
        let mut second = Csprng::new();
        second.seed(&[2u8; POOL_BYTES]);

        let mut out_a = [0u8; 32];
        let mut out_b = [0u8; 32];
        first.read(&mut out_a);
        second.read(&mut out_b);
        assert_ne!(out_a, out_b);
    }

    #[test]
    #[should_panic(expected = "before seeding")]
    fn unseeded_read_panics() {
        let mut rng = Csprng::new();
        let mut out = [0u8; 16];
        rng.read(&mut out);
    }

    #[test]
    fn entropy_stirs_the_pool() {
        let mut rng = Csprng::new();
        rng.seed(&[0u8; POOL_BYTES]);

        let mut before = [0u8; 32];
        rng.read(&mut before);

        rng.add_entropy(b"some further hardware entropy bytes");

        // Same nonce progression, different key: different
        // stream.
        let mut rng2 = Csprng::new();
        rng2.seed(&[0u8; POOL_BYTES]);
        let mut unstirred = [0u8; 32];
        rng2.read(&mut unstirred);

        let mut after = [0u8; 32];
        rng.read(&mut after);
        assert_ne!(&after[..], &unstirred[..]);
    }
}

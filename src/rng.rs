//! Deterministic RNG using FNV-1a hash and SplitMix64
//!
//! Routines share their creator's generator until they reseed, so the
//! generator lives behind `SharedRng`.

use parking_lot::Mutex;
use std::sync::Arc;

/// Generator shared by reference between a routine and the routines it creates.
pub type SharedRng = Arc<Mutex<DetRng>>;

/// FNV-1a hash of a string to a u64 seed.
/// This is deterministic across runs (unlike std's DefaultHasher).
pub fn fnv1a64(s: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// SplitMix64 generator.
#[derive(Clone, Debug)]
pub struct DetRng {
    state: u64,
}

impl DetRng {
    /// Create a new RNG from a string seed.
    pub fn new(seed: &str) -> Self {
        Self {
            state: fnv1a64(seed),
        }
    }

    pub fn from_u64(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Wrap in a fresh shared cell.
    pub fn shared(self) -> SharedRng {
        Arc::new(Mutex::new(self))
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    /// Generate a random f64 in [0, 1).
    pub fn random(&mut self) -> f64 {
        // Use upper 53 bits for double precision
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

impl rand::RngCore for DetRng {
    fn next_u32(&mut self) -> u32 {
        (DetRng::next_u64(self) >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        DetRng::next_u64(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = DetRng::next_u64(self).to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_fnv1a64_deterministic() {
        assert_eq!(fnv1a64("test_seed"), fnv1a64("test_seed"));
        assert_ne!(fnv1a64("test_seed"), fnv1a64("different_seed"));
    }

    #[test]
    fn test_rng_deterministic() {
        let mut rng1 = DetRng::new("test");
        let mut rng2 = DetRng::new("test");

        for _ in 0..100 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn test_rng_random_range() {
        let mut rng = DetRng::new("test");

        for _ in 0..1000 {
            let r = rng.random();
            assert!((0.0..1.0).contains(&r));
        }
    }

    #[test]
    fn test_rand_distributions() {
        let mut a = DetRng::from_u64(7);
        let mut b = DetRng::from_u64(7);
        for _ in 0..100 {
            let x: i32 = a.gen_range(-5..5);
            assert!((-5..5).contains(&x));
            assert_eq!(x, b.gen_range(-5..5));
        }

        let mut bytes = [0u8; 13];
        rand::RngCore::fill_bytes(&mut a, &mut bytes);
        assert!(bytes.iter().any(|b| *b != 0));
    }

    #[test]
    fn test_shared_rng_advances_for_all_holders() {
        let shared = DetRng::new("shared").shared();
        let other = shared.clone();
        let first = shared.lock().next_u64();
        let second = other.lock().next_u64();

        let mut fresh = DetRng::new("shared");
        assert_eq!(first, fresh.next_u64());
        assert_eq!(second, fresh.next_u64());
    }
}

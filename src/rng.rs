//! Per-thread xorshift64\* pseudo-random generator used only by the
//! Poisson-bytes scheme (spec.md section 2/4.2).
//!
//! Seeded from thread identity, wall-clock time, and a stack address, so
//! that distinct threads (and distinct runs) diverge without needing a
//! syscall into a real entropy source on every allocation.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

/// A xorshift64\* generator. `state` is never allowed to be zero (zero is
/// the fixed point of the xorshift step), guaranteed by [`Rng::seed`].
pub struct Rng {
    state: u64,
}

impl Rng {
    /// Seeds from thread identity, wall-clock time, and a stack address, as
    /// specified. A local variable's address stands in for "stack address".
    pub fn seed_from_thread_context() -> Self {
        let stack_marker = 0u8;
        let stack_addr = &stack_marker as *const u8 as u64;

        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        let thread_mix = hasher.finish();

        let time_mix = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let seed = thread_mix ^ time_mix ^ stack_addr;
        Self::seed(seed)
    }

    fn seed(seed: u64) -> Self {
        // A zero seed would stay zero forever under xorshift; fall back to
        // a fixed nonzero constant in the (practically impossible) case all
        // three seed sources cancel out to exactly zero.
        Rng {
            state: if seed == 0 { 0x9E3779B97F4A7C15 } else { seed },
        }
    }

    /// xorshift64\* step: xorshift followed by a multiplicative finishing
    /// constant, giving better output quality than plain xorshift.
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Draws `u` uniform on (0, 1] and returns a u64 in [1, u64::MAX].
    fn next_uniform_nonzero(&mut self) -> u64 {
        let v = self.next_u64();
        if v == 0 {
            1
        } else {
            v
        }
    }

    /// Draws the next geometric interval with the given mean, via the
    /// inverse-CDF construction from spec.md section 4.2:
    /// `interval = floor(-ln(u) * mean)` for `u` uniform on (0, 1].
    pub fn next_geometric_interval(&mut self, mean: u64) -> i64 {
        let u = self.next_uniform_nonzero() as f64 / u64::MAX as f64;
        let interval = (-u.ln() * mean as f64).floor();
        // Clamp defensively: a vanishingly small `u` could in principle
        // overflow an i64 when multiplied by a large mean.
        if interval.is_finite() {
            interval.min(i64::MAX as f64).max(0.0) as i64
        } else {
            i64::MAX
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_seed_zero_is_remapped() {
        let mut rng = Rng::seed(0);
        // Must not get stuck emitting zero forever.
        assert_ne!(rng.next_u64(), 0);
    }

    #[test]
    fn test_stream_is_not_constant() {
        let mut rng = Rng::seed(42);
        let a = rng.next_u64();
        let b = rng.next_u64();
        let c = rng.next_u64();
        assert!(a != b || b != c);
    }

    #[test]
    fn test_geometric_interval_is_nonnegative_and_varies() {
        let mut rng = Rng::seed(7);
        let mut saw_small = false;
        let mut saw_large = false;
        for _ in 0..256 {
            let interval = rng.next_geometric_interval(4096);
            assert!(interval >= 0);
            if interval < 4096 {
                saw_small = true;
            }
            if interval >= 4096 {
                saw_large = true;
            }
        }
        // A geometric distribution with mean 4096 should produce values on
        // both sides of its mean within 256 draws, overwhelmingly often.
        assert!(saw_small && saw_large);
    }

    #[test]
    fn test_distinct_seeds_diverge() {
        let mut a = Rng::seed(1);
        let mut b = Rng::seed(2);
        assert_ne!(a.next_u64(), b.next_u64());
    }
}

//! The sampling decision engine (spec.md section 4.2): given an address
//! and a requested size, answers "is this allocation sampled?" and, for
//! byte-weighted schemes, "with what weight?".
//!
//! The scheme is a closed set dispatched on a single enum value; virtual
//! dispatch is deliberately avoided (spec.md section 9, "tagged-variant
//! dispatch").

use std::cell::RefCell;

use crate::config::Config;
use crate::hash::Mixer;
use crate::liveness::Policy;
use crate::rng::Rng;

/// The eleven named schemes from spec.md section 6, plus `None` (the
/// default: no sampling at all).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Scheme {
    None,

    StatelessHashXor,
    StatelessHashSplitmix,
    StatelessHashMurmurish,
    StatelessPoissonBernoulli,

    HeaderHash,
    HeaderPageHash,
    HeaderPoissonBytes,
    HeaderHybrid,

    SampleHeadersPoissonMap,
    SampleHeadersHashMap,
    SampleHeadersEbpfInspired,
}

impl Scheme {
    /// Parses `SAMPLER_SCHEME`'s value. Unrecognized values select `None`
    /// (spec.md section 6).
    pub fn from_env_name(name: &str) -> Scheme {
        match name {
            "STATELESS_HASH_XOR" => Scheme::StatelessHashXor,
            "STATELESS_HASH_SPLITMIX" => Scheme::StatelessHashSplitmix,
            "STATELESS_HASH_MURMURISH" => Scheme::StatelessHashMurmurish,
            "STATELESS_POISSON_BERNOULLI" => Scheme::StatelessPoissonBernoulli,
            "HEADER_HASH" => Scheme::HeaderHash,
            "HEADER_PAGE_HASH" => Scheme::HeaderPageHash,
            "HEADER_POISSON_BYTES" => Scheme::HeaderPoissonBytes,
            "HEADER_HYBRID" => Scheme::HeaderHybrid,
            "SAMPLE_HEADERS_POISSON_MAP" => Scheme::SampleHeadersPoissonMap,
            "SAMPLE_HEADERS_HASH_MAP" => Scheme::SampleHeadersHashMap,
            "SAMPLE_HEADERS_EBPF_INSPIRED" => Scheme::SampleHeadersEbpfInspired,
            _ => Scheme::None,
        }
    }

    /// The liveness-tracking policy this scheme targets. `None` has no
    /// policy affinity: it's always compatible, since no tracking happens.
    pub fn policy(self) -> Option<Policy> {
        match self {
            Scheme::None => None,
            Scheme::StatelessHashXor
            | Scheme::StatelessHashSplitmix
            | Scheme::StatelessHashMurmurish
            | Scheme::StatelessPoissonBernoulli => Some(Policy::Stateless),
            Scheme::HeaderHash
            | Scheme::HeaderPageHash
            | Scheme::HeaderPoissonBytes
            | Scheme::HeaderHybrid => Some(Policy::AllHeaders),
            Scheme::SampleHeadersPoissonMap
            | Scheme::SampleHeadersHashMap
            | Scheme::SampleHeadersEbpfInspired => Some(Policy::SampleHeaders),
        }
    }

    fn mixer(self) -> Option<Mixer> {
        match self {
            Scheme::StatelessHashXor | Scheme::HeaderHash | Scheme::HeaderPageHash => {
                Some(Mixer::XorShift)
            }
            Scheme::StatelessHashSplitmix => Some(Mixer::SplitMix64),
            Scheme::StatelessHashMurmurish => Some(Mixer::MurmurFinalizer),
            Scheme::SampleHeadersHashMap | Scheme::SampleHeadersEbpfInspired => {
                Some(Mixer::SplitMix64)
            }
            Scheme::HeaderHybrid => Some(Mixer::XorShift),
            _ => None,
        }
    }

    /// Whether this scheme hashes the address directly (`address-hash`) or
    /// the containing page (`page-hash`).
    pub(crate) fn is_page_hash(self) -> bool {
        matches!(self, Scheme::HeaderPageHash)
    }

    /// Whether this scheme is Poisson-bytes (pure, not as the small-size
    /// arm of hybrid).
    pub(crate) fn is_poisson(self) -> bool {
        matches!(
            self,
            Scheme::StatelessPoissonBernoulli
                | Scheme::HeaderPoissonBytes
                | Scheme::SampleHeadersPoissonMap
                | Scheme::SampleHeadersEbpfInspired
        )
    }
}

const PAGE_SHIFT: u32 = 12;

/// The outcome of a sampling decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub sampled: bool,
    /// Effective byte weight the sample represents; 0 for non-byte-weighted
    /// schemes (hash-based) and for non-sampled allocations.
    pub weight: u64,
}

impl Decision {
    const NOT_SAMPLED: Decision = Decision { sampled: false, weight: 0 };
}

/// Per-thread Poisson-bytes state (spec.md section 3, "thread state").
struct PoissonState {
    rng: Rng,
    bytes_until_next: i64,
}

impl PoissonState {
    fn new() -> Self {
        PoissonState { rng: Rng::seed_from_thread_context(), bytes_until_next: -1 }
    }
}

thread_local! {
    static POISSON_STATE: RefCell<Option<PoissonState>> = const { RefCell::new(None) };
}

/// Runs one step of the Poisson-bytes algorithm from spec.md section 4.2
/// for an allocation of `size` bytes, with the configured `mean`.
fn poisson_decide(size: u64, mean: u64) -> Decision {
    POISSON_STATE.with(|cell| {
        let mut slot = cell.borrow_mut();
        let state = slot.get_or_insert_with(PoissonState::new);

        if state.bytes_until_next == -1 {
            // First use: draw the initial interval (spec.md section 4.2).
            // -1 is a sentinel that a real draw (clamped to >= 0) can
            // never produce, so it unambiguously means "uninitialized".
            state.bytes_until_next = state.rng.next_geometric_interval(mean);
        }

        state.bytes_until_next -= size as i64;

        if state.bytes_until_next > 0 {
            return Decision::NOT_SAMPLED;
        }

        // Crossed zero: count how many mean-length intervals were crossed,
        // redrawing while still below zero, per spec.md section 4.2.
        let mut crossings: u64 = 1;
        while state.bytes_until_next <= 0 {
            let interval = state.rng.next_geometric_interval(mean);
            state.bytes_until_next += interval.max(1);
            if state.bytes_until_next > 0 {
                break;
            }
            crossings += 1;
        }

        Decision { sampled: true, weight: crossings * mean }
    })
}

fn hash_decide(addr: usize, mixer: Mixer, mask: u64, page_hash: bool) -> Decision {
    let key = if page_hash { (addr as u64) >> PAGE_SHIFT } else { addr as u64 };
    let h = mixer.mix(key);
    if h & mask == 0 {
        Decision { sampled: true, weight: 0 }
    } else {
        Decision::NOT_SAMPLED
    }
}

/// Makes the sampling decision for an allocation at `addr` of `size`
/// bytes, under `cfg`.
///
/// For `HeaderHybrid`, `addr` is only consulted when `size` is at or above
/// [`Config::hybrid_threshold`]; callers on the byte-based (small-size,
/// address-unknown) arm may pass `0` for `addr`.
pub fn decide(cfg: &Config, addr: usize, size: usize) -> Decision {
    match cfg.scheme {
        Scheme::None => Decision::NOT_SAMPLED,

        Scheme::HeaderHybrid => {
            if (size as u64) < cfg.hybrid_threshold {
                poisson_decide(size as u64, cfg.poisson_mean_bytes)
            } else {
                hash_decide(addr, Mixer::XorShift, cfg.hash_mask, false)
            }
        }

        scheme if scheme.is_poisson() => poisson_decide(size as u64, cfg.poisson_mean_bytes),

        scheme => {
            let mixer = scheme.mixer().expect("non-poisson scheme must have a mixer");
            hash_decide(addr, mixer, cfg.hash_mask, scheme.is_page_hash())
        }
    }
}

/// Whether a scheme needs the address before the allocation happens
/// (spec.md section 4.2, "selective-header decision timing"). True only
/// for the Poisson-bytes family, since byte-based schemes only need the
/// requested size, known up front.
pub fn decides_without_address(scheme: Scheme) -> bool {
    scheme.is_poisson()
}

/// The page number to feed the coverage bitmaps for this allocation, or
/// `None` if the active scheme isn't page-hash (spec.md section 4.2: the
/// bitmap only makes sense for the scheme it diagnoses blindness for).
pub(crate) fn page_coverage_addr(cfg: &Config, addr: usize) -> Option<usize> {
    if cfg.scheme.is_page_hash() {
        Some(addr)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    fn cfg_with(scheme: Scheme) -> Config {
        let mut cfg = Config::default();
        cfg.scheme = scheme;
        cfg
    }

    #[test]
    fn test_none_never_samples() {
        let cfg = cfg_with(Scheme::None);
        for addr in [0x1000usize, 0x2000, 0x3000] {
            assert!(!decide(&cfg, addr, 64).sampled);
        }
    }

    #[test]
    fn test_address_hash_rate_matches_mask() {
        let mut cfg = cfg_with(Scheme::HeaderHash);
        cfg.hash_mask = 0xFF;

        // Address-hash is a pure function of the address; construct a
        // stream of addresses and confirm the empirical rate is in the
        // right ballpark for 1/(mask+1) = 1/256.
        let mut sampled = 0u64;
        let total = 200_000u64;
        for i in 0..total {
            // Spread inputs so the mixer sees varying bit patterns, as a
            // real heap address stream would.
            let addr = (i.wrapping_mul(0x9E3779B97F4A7C15)) as usize;
            if decide(&cfg, addr, 64).sampled {
                sampled += 1;
            }
        }
        let rate = sampled as f64 / total as f64;
        assert!((rate - 1.0 / 256.0).abs() < 0.002, "rate was {rate}");
    }

    #[test]
    fn test_hybrid_dispatches_on_size() {
        let mut cfg = cfg_with(Scheme::HeaderHybrid);
        cfg.hybrid_threshold = 256;

        // Below threshold: must go through the Poisson path, which is
        // deterministic per-thread state, not per-call; we only assert it
        // doesn't panic and returns a decision either way.
        let _ = decide(&cfg, 0, 64);
        // At/above threshold: must go through the hash path, which is a
        // pure function of the address alone.
        let a = decide(&cfg, 0x4000, 4096);
        let b = decide(&cfg, 0x4000, 4096);
        assert_eq!(a, b);
    }

    #[test]
    fn test_page_hash_groups_by_page() {
        let mut cfg = cfg_with(Scheme::HeaderPageHash);
        cfg.hash_mask = 0xFF;
        let a = decide(&cfg, 0x1000, 64);
        let b = decide(&cfg, 0x1008, 64);
        let c = decide(&cfg, 0x1FF8, 64);
        // All three addresses share the same page (0x1000 >> 12).
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_decides_without_address() {
        assert!(decides_without_address(Scheme::HeaderPoissonBytes));
        assert!(decides_without_address(Scheme::SampleHeadersPoissonMap));
        assert!(!decides_without_address(Scheme::HeaderHash));
        assert!(!decides_without_address(Scheme::StatelessHashXor));
    }

    #[test]
    fn test_poisson_bytes_weight_is_multiple_of_mean() {
        let cfg = cfg_with(Scheme::HeaderPoissonBytes);
        let mean = cfg.poisson_mean_bytes;
        for _ in 0..10_000 {
            let d = decide(&cfg, 0, 128);
            if d.sampled {
                assert_eq!(d.weight % mean, 0);
                assert!(d.weight >= mean);
            }
        }
    }
}

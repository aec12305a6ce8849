//! Process-wide statistics and the exit-time JSON summary (spec.md
//! sections 4.4 and 6).
//!
//! All mutable counters are 64-bit atomics updated with relaxed ordering,
//! except the dead-zone window exchange, which needs the stronger
//! guarantee that exactly one thread observes and resets a given window
//! boundary: cite the invariant being relied on, rather than an
//! unexplained `Ordering::SeqCst` everywhere.

use std::fs::File;
use std::io::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::Config;
use crate::liveness::Policy;

/// Upper bounds of the ten fixed size bins (spec.md section 4.2). The last
/// bin is unbounded.
pub const SIZE_BIN_BOUNDS: [u64; 10] =
    [32, 64, 128, 256, 512, 1024, 4096, 16384, 65536, u64::MAX];

pub const SIZE_BIN_LABELS: [&str; 10] = [
    "0-32", "33-64", "65-128", "129-256", "257-512", "513-1024", "1025-4096", "4097-16384",
    "16385-65536", "65537-inf",
];

pub fn bin_index(size: u64) -> usize {
    SIZE_BIN_BOUNDS
        .iter()
        .position(|&bound| size <= bound)
        .unwrap_or(SIZE_BIN_BOUNDS.len() - 1)
}

#[derive(Default)]
struct SizeBin {
    total: AtomicU64,
    sampled: AtomicU64,
}

/// A fixed-size approximate bitmap used to track distinct pages observed
/// vs. sampled under the page-hash scheme (spec.md section 4.2: "The page
/// coverage bitmap records observed vs sampled pages so the blindness is
/// detectable post-hoc"). Indexing hashes the page number down into a
/// fixed bit range, so this is approximate (collisions overcount),
/// matching the "approx_*" naming in spec.md section 8.
struct Bitmap {
    words: Vec<AtomicU64>,
}

const BITMAP_BITS: usize = 1 << 20;

impl Bitmap {
    fn new() -> Self {
        Bitmap { words: (0..BITMAP_BITS / 64).map(|_| AtomicU64::new(0)).collect() }
    }

    fn mark(&self, key: u64) -> bool {
        let bit = (crate::hash::Mixer::SplitMix64.mix(key) as usize) % BITMAP_BITS;
        let word = &self.words[bit / 64];
        let mask = 1u64 << (bit % 64);
        let prev = word.fetch_or(mask, Ordering::Relaxed);
        prev & mask == 0
    }

    fn popcount(&self) -> u64 {
        self.words.iter().map(|w| w.load(Ordering::Relaxed).count_ones() as u64).sum()
    }
}

/// Process-wide stats, one instance for the life of the process.
pub struct Stats {
    total_allocs: AtomicU64,
    total_frees: AtomicU64,
    total_bytes_alloc: AtomicU64,
    total_bytes_freed: AtomicU64,

    sampled_allocs: AtomicU64,
    sampled_frees: AtomicU64,
    sampled_bytes_alloc: AtomicU64,

    size_bins: [SizeBin; 10],

    window_alloc_count: AtomicU64,
    window_sampled_count: AtomicU64,
    windows_total: AtomicU64,
    windows_zero_sampled: AtomicU64,

    observed_pages: std::sync::OnceLock<Bitmap>,
    sampled_pages: std::sync::OnceLock<Bitmap>,
}

impl Stats {
    pub const fn new() -> Self {
        Stats {
            total_allocs: AtomicU64::new(0),
            total_frees: AtomicU64::new(0),
            total_bytes_alloc: AtomicU64::new(0),
            total_bytes_freed: AtomicU64::new(0),
            sampled_allocs: AtomicU64::new(0),
            sampled_frees: AtomicU64::new(0),
            sampled_bytes_alloc: AtomicU64::new(0),
            size_bins: [
                SizeBin { total: AtomicU64::new(0), sampled: AtomicU64::new(0) },
                SizeBin { total: AtomicU64::new(0), sampled: AtomicU64::new(0) },
                SizeBin { total: AtomicU64::new(0), sampled: AtomicU64::new(0) },
                SizeBin { total: AtomicU64::new(0), sampled: AtomicU64::new(0) },
                SizeBin { total: AtomicU64::new(0), sampled: AtomicU64::new(0) },
                SizeBin { total: AtomicU64::new(0), sampled: AtomicU64::new(0) },
                SizeBin { total: AtomicU64::new(0), sampled: AtomicU64::new(0) },
                SizeBin { total: AtomicU64::new(0), sampled: AtomicU64::new(0) },
                SizeBin { total: AtomicU64::new(0), sampled: AtomicU64::new(0) },
                SizeBin { total: AtomicU64::new(0), sampled: AtomicU64::new(0) },
            ],
            window_alloc_count: AtomicU64::new(0),
            window_sampled_count: AtomicU64::new(0),
            windows_total: AtomicU64::new(0),
            windows_zero_sampled: AtomicU64::new(0),
            observed_pages: std::sync::OnceLock::new(),
            sampled_pages: std::sync::OnceLock::new(),
        }
    }

    /// Records one allocation at the given `size`, with the given sampling
    /// `decision`. `page_addr` is `Some` only when the active scheme is
    /// page-hash, to feed the coverage bitmaps.
    pub fn record_alloc(
        &self,
        size: u64,
        sampled: bool,
        weight: u64,
        page_addr: Option<usize>,
        window_size: u64,
    ) {
        let alloc_n = self.window_alloc_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.total_allocs.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_alloc.fetch_add(size, Ordering::Relaxed);

        let bin = &self.size_bins[bin_index(size)];
        bin.total.fetch_add(1, Ordering::Relaxed);

        if sampled {
            self.sampled_allocs.fetch_add(1, Ordering::Relaxed);
            let bytes = if weight > 0 { weight } else { size };
            self.sampled_bytes_alloc.fetch_add(bytes, Ordering::Relaxed);
            bin.sampled.fetch_add(1, Ordering::Relaxed);
            self.window_sampled_count.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(addr) = page_addr {
            let page = (addr as u64) >> 12;
            self.observed_pages.get_or_init(Bitmap::new).mark(page);
            if sampled {
                self.sampled_pages.get_or_init(Bitmap::new).mark(page);
            }
        }

        if alloc_n == window_size {
            self.window_alloc_count.store(0, Ordering::Relaxed);
            let exchanged = self.window_sampled_count.swap(0, Ordering::AcqRel);
            self.windows_total.fetch_add(1, Ordering::Relaxed);
            if exchanged == 0 {
                self.windows_zero_sampled.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_free(&self, sampled: bool, size: Option<u64>) {
        self.total_frees.fetch_add(1, Ordering::Relaxed);
        if let Some(size) = size {
            self.total_bytes_freed.fetch_add(size, Ordering::Relaxed);
        }
        if sampled {
            self.sampled_frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Closes out any partial window; must run exactly once, at process
    /// exit (spec.md section 4.4). Returns the number of allocations that
    /// had landed in that final, incomplete window, so the summary can
    /// report it separately from the full-window counts above.
    fn finalize_partial_window(&self) -> u64 {
        let remaining = self.window_alloc_count.swap(0, Ordering::AcqRel);
        if remaining > 0 {
            let exchanged = self.window_sampled_count.swap(0, Ordering::AcqRel);
            self.windows_total.fetch_add(1, Ordering::Relaxed);
            if exchanged == 0 {
                self.windows_zero_sampled.fetch_add(1, Ordering::Relaxed);
            }
        }
        remaining
    }

    pub fn snapshot(&self, cfg: &Config, index_metrics: Option<IndexMetrics>) -> Summary {
        let partial_window_remainder = self.finalize_partial_window();

        let total_allocs = self.total_allocs.load(Ordering::Relaxed);
        let total_bytes_alloc = self.total_bytes_alloc.load(Ordering::Relaxed);
        let sampled_allocs = self.sampled_allocs.load(Ordering::Relaxed);
        let sampled_frees = self.sampled_frees.load(Ordering::Relaxed);
        let sampled_bytes_alloc = self.sampled_bytes_alloc.load(Ordering::Relaxed);

        let size_bins = SIZE_BIN_LABELS
            .iter()
            .zip(self.size_bins.iter())
            .map(|(label, bin)| SizeBinSummary {
                label: label.to_string(),
                total: bin.total.load(Ordering::Relaxed),
                sampled: bin.sampled.load(Ordering::Relaxed),
            })
            .collect();

        let page_coverage = self.observed_pages.get().map(|observed| PageCoverage {
            approx_unique_pages: observed.popcount(),
            approx_sampled_pages: self.sampled_pages.get().map_or(0, Bitmap::popcount),
        });

        Summary {
            scheme: format!("{:?}", cfg.scheme),
            policy: crate::liveness::ACTIVE_POLICY.as_str(),
            hash_mask: cfg.hash_mask,
            poisson_mean_bytes: cfg.poisson_mean_bytes,
            hybrid_threshold: cfg.hybrid_threshold,
            window_size: cfg.window_size,
            header_size: if crate::liveness::ACTIVE_POLICY == Policy::Stateless {
                None
            } else {
                Some(crate::header::HEADER_SIZE as u64)
            },

            total_allocs,
            total_frees: self.total_frees.load(Ordering::Relaxed),
            total_bytes_alloc,
            total_bytes_freed: self.total_bytes_freed.load(Ordering::Relaxed),

            sampled_allocs,
            sampled_frees,
            sampled_bytes_alloc,
            sampled_live_estimate: sampled_allocs.saturating_sub(sampled_frees),

            sample_rate_allocs: checked_ratio(sampled_allocs, total_allocs),
            sample_rate_bytes: checked_ratio(sampled_bytes_alloc, total_bytes_alloc),

            windows_total: self.windows_total.load(Ordering::Relaxed),
            windows_zero_sampled: self.windows_zero_sampled.load(Ordering::Relaxed),
            partial_window_remainder,

            size_bins,
            page_coverage,
            index_metrics,
        }
    }
}

fn checked_ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(serde::Serialize)]
pub struct SizeBinSummary {
    pub label: String,
    pub total: u64,
    pub sampled: u64,
}

#[derive(serde::Serialize)]
pub struct PageCoverage {
    pub approx_unique_pages: u64,
    pub approx_sampled_pages: u64,
}

#[derive(serde::Serialize)]
pub struct IndexMetrics {
    pub index_inserts: u64,
    pub index_deletes: u64,
    pub index_current_size: u64,
    pub index_peak_size: u64,
    pub index_insert_failures: u64,
}

/// The stable JSON summary document (spec.md section 6): "consumers must
/// tolerate additive fields," which is a contract on readers, not license
/// to add fields beyond what spec.md section 4.4 enumerates.
#[derive(serde::Serialize)]
pub struct Summary {
    pub scheme: String,
    pub policy: &'static str,
    pub hash_mask: u64,
    pub poisson_mean_bytes: u64,
    pub hybrid_threshold: u64,
    pub window_size: u64,
    pub header_size: Option<u64>,

    pub total_allocs: u64,
    pub total_frees: u64,
    pub total_bytes_alloc: u64,
    pub total_bytes_freed: u64,

    pub sampled_allocs: u64,
    pub sampled_frees: u64,
    pub sampled_bytes_alloc: u64,
    pub sampled_live_estimate: u64,

    pub sample_rate_allocs: f64,
    pub sample_rate_bytes: f64,

    pub windows_total: u64,
    pub windows_zero_sampled: u64,
    pub partial_window_remainder: u64,

    pub size_bins: Vec<SizeBinSummary>,
    pub page_coverage: Option<PageCoverage>,
    pub index_metrics: Option<IndexMetrics>,
}

impl Summary {
    /// Writes this summary to `path` suffixed with the process id, or to
    /// stdout if `path` is `None` or the file can't be opened (spec.md
    /// sections 6 and 7: "fall back to stdout; do not abort").
    pub fn write(&self, path: Option<&str>) {
        let pid = std::process::id();
        let opened = path.and_then(|p| File::create(format!("{p}.{pid}")).ok());

        match opened {
            Some(mut file) => {
                if serde_json::to_writer_pretty(&mut file, self).is_err()
                    || file.flush().is_err()
                {
                    self.write_to_stdout();
                }
            }
            None => self.write_to_stdout(),
        }
    }

    fn write_to_stdout(&self) {
        if let Ok(text) = serde_json::to_string_pretty(self) {
            println!("{text}");
        }
    }
}

pub static STATS: Stats = Stats::new();

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bin_index_boundaries() {
        assert_eq!(bin_index(0), 0);
        assert_eq!(bin_index(32), 0);
        assert_eq!(bin_index(33), 1);
        assert_eq!(bin_index(65536), 8);
        assert_eq!(bin_index(65537), 9);
        assert_eq!(bin_index(u64::MAX), 9);
    }

    #[test]
    fn test_empty_workload_derives_zero_rates() {
        let stats = Stats::new();
        let cfg = Config::default();
        let summary = stats.snapshot(&cfg, None);
        assert_eq!(summary.total_allocs, 0);
        assert_eq!(summary.sampled_allocs, 0);
        assert_eq!(summary.windows_total, 0);
        assert_eq!(summary.sample_rate_allocs, 0.0);
        assert_eq!(summary.sample_rate_bytes, 0.0);
    }

    #[test]
    fn test_single_sampled_allocation() {
        let stats = Stats::new();
        stats.record_alloc(100, true, 0, None, 100_000);
        stats.record_free(true, Some(100));
        let cfg = Config::default();
        let summary = stats.snapshot(&cfg, None);
        assert_eq!(summary.total_allocs, 1);
        assert_eq!(summary.total_frees, 1);
        assert_eq!(summary.sampled_allocs, 1);
        assert_eq!(summary.sampled_frees, 1);
        assert_eq!(summary.sampled_bytes_alloc, 100);
        assert_eq!(summary.size_bins[2].label, "65-128");
        assert_eq!(summary.size_bins[2].total, 1);
        assert_eq!(summary.size_bins[2].sampled, 1);
        assert_eq!(summary.windows_total, 1);
        assert_eq!(summary.windows_zero_sampled, 0);
        assert_eq!(summary.partial_window_remainder, 1);
    }

    #[test]
    fn test_window_rollover_zero_sampled() {
        let stats = Stats::new();
        let mut cfg = Config::default();
        cfg.window_size = 4;
        // The fourth allocation lands exactly on the window boundary and
        // triggers the rollover itself, leaving no partial remainder.
        for _ in 0..4u64 {
            stats.record_alloc(8, false, 0, None, cfg.window_size);
        }
        let summary = stats.snapshot(&cfg, None);
        assert_eq!(summary.windows_zero_sampled, 1);
        assert_eq!(summary.partial_window_remainder, 0);
    }

    #[test]
    fn test_partial_window_remainder_reported_separately_at_exit() {
        let stats = Stats::new();
        let mut cfg = Config::default();
        cfg.window_size = 10;
        for _ in 0..3u64 {
            stats.record_alloc(8, false, 0, None, cfg.window_size);
        }
        let summary = stats.snapshot(&cfg, None);
        // Fewer allocations than the window size: the only window counted
        // is the partial one closed out at exit.
        assert_eq!(summary.windows_total, 1);
        assert_eq!(summary.partial_window_remainder, 3);
    }

    #[test]
    fn test_invariant_sampled_le_total() {
        let stats = Stats::new();
        for i in 0..1000u64 {
            stats.record_alloc(64, i % 7 == 0, 0, None, 100_000);
        }
        let cfg = Config::default();
        let summary = stats.snapshot(&cfg, None);
        assert!(summary.sampled_allocs <= summary.total_allocs);
        assert!(summary.sampled_bytes_alloc <= summary.total_bytes_alloc);
    }
}

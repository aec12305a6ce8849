//! Stateless liveness policy (spec.md section 4.3): no per-allocation
//! storage at all. Free-side sampled/not-sampled status is re-derived
//! from the pointer alone for hash schemes, which is approximate (a
//! reused address flips the re-derived answer); for Poisson-bytes the
//! original decision depended on per-thread counter state that can't be
//! recovered, so sampled-free tracking is reported as unknown and only
//! allocation-side statistics are trustworthy.

use std::ffi::c_void;

use crate::config::{self, Config};
use crate::decision;
use crate::ffi::resolve::real;
use crate::stats::{self, IndexMetrics};

pub fn index_metrics() -> Option<IndexMetrics> {
    None
}

pub fn on_malloc(size: usize) -> *mut c_void {
    let cfg = config::config();
    let ptr = unsafe { real().malloc(size) };
    if ptr.is_null() {
        return ptr;
    }
    record_new(cfg, ptr as usize, size);
    ptr
}

pub fn on_calloc(nmemb: usize, size: usize) -> *mut c_void {
    let cfg = config::config();
    let ptr = unsafe { real().calloc(nmemb, size) };
    if ptr.is_null() {
        return ptr;
    }
    let Some(user_size) = nmemb.checked_mul(size) else {
        // `real().calloc` would itself have rejected this; unreachable in
        // practice, kept defensive since this is a size used for stats only.
        return ptr;
    };
    record_new(cfg, ptr as usize, user_size);
    ptr
}

pub fn on_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let cfg = config::config();
    let sampled = rederive_sampled(cfg, ptr as usize);
    stats::STATS.record_free(sampled, None);
    crate::diag::trace(
        cfg.event_trace_enabled,
        format_args!("op=free sampled={sampled} rederived=true"),
    );
    unsafe { real().free(ptr) };
}

pub fn on_realloc(ptr: *mut c_void, new_size: usize) -> *mut c_void {
    if ptr.is_null() {
        return on_malloc(new_size);
    }
    if new_size == 0 {
        on_free(ptr);
        return std::ptr::null_mut();
    }

    let cfg = config::config();
    let was_sampled = rederive_sampled(cfg, ptr as usize);

    let new_ptr = unsafe { real().realloc(ptr, new_size) };
    if new_ptr.is_null() {
        return std::ptr::null_mut();
    }
    stats::STATS.record_free(was_sampled, None);
    crate::diag::trace(
        cfg.event_trace_enabled,
        format_args!("op=realloc case=rederived old_sampled={was_sampled} new_size={new_size}"),
    );
    record_new(cfg, new_ptr as usize, new_size);
    new_ptr
}

fn record_new(cfg: &Config, addr: usize, size: usize) {
    let decision = decision::decide(cfg, addr, size);
    stats::STATS.record_alloc(
        size as u64,
        decision.sampled,
        decision.weight,
        decision::page_coverage_addr(cfg, addr),
        cfg.window_size,
    );
    crate::diag::trace(
        cfg.event_trace_enabled,
        format_args!(
            "op=alloc size={size} sampled={} weight={}",
            decision.sampled, decision.weight
        ),
    );
}

/// Re-derives whether `addr` was sampled at allocation time. Exact for
/// hash schemes (a pure function of the address); for Poisson-bytes this
/// can't be reconstructed, so it conservatively reports "not sampled" and
/// lets allocation-side counters carry the statistical signal.
fn rederive_sampled(cfg: &Config, addr: usize) -> bool {
    if cfg.scheme.is_poisson() {
        return false;
    }
    decision::decide(cfg, addr, 0).sampled
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decision::Scheme;

    fn cfg_with(scheme: Scheme) -> Config {
        let mut cfg = Config::default();
        cfg.scheme = scheme;
        cfg
    }

    #[test]
    fn test_hash_scheme_rederivation_is_pure_function_of_address() {
        let cfg = cfg_with(Scheme::StatelessHashXor);
        let a = rederive_sampled(&cfg, 0x1000);
        let b = rederive_sampled(&cfg, 0x1000);
        assert_eq!(a, b);
    }

    #[test]
    fn test_poisson_rederivation_always_reports_not_sampled() {
        let cfg = cfg_with(Scheme::StatelessPoissonBernoulli);
        assert!(!rederive_sampled(&cfg, 0x1000));
        assert!(!rederive_sampled(&cfg, 0xDEADBEEF));
    }

    #[test]
    fn test_malloc_free_round_trip_does_not_crash() {
        let ptr = on_malloc(64);
        assert!(!ptr.is_null());
        on_free(ptr);
    }

    #[test]
    fn test_null_ptr_free_is_noop() {
        on_free(std::ptr::null_mut());
    }
}

//! A dynamic-linker-interposed memory-allocation sampler.
//!
//! Loaded ahead of libc in a target process (`LD_PRELOAD`), this library
//! exports replacement `malloc`/`calloc`/`realloc`/`free` symbols. Each
//! call is handed to a configurable sampling scheme, which decides
//! whether the allocation is promoted to a *sample*; a liveness-tracking
//! policy, fixed at compile time by a Cargo feature, reconciles sampled
//! allocations with their matching frees. A JSON summary is written once,
//! at process exit.
//!
//! Configuration is entirely environment-variable driven; see
//! [`config::Config`] for the variables and their defaults.

pub mod arena;
pub mod config;
pub mod decision;
pub mod diag;
pub mod ffi;
pub mod hash;
pub mod header;
pub mod liveness;
pub mod rng;
pub mod stats;

#[cfg(feature = "policy-all-headers")]
use liveness::all_headers as policy;
#[cfg(feature = "policy-sample-headers")]
use liveness::sample_headers as policy;
#[cfg(feature = "policy-stateless")]
use liveness::stateless as policy;

// The `#[no_mangle]` exports below are only compiled outside of `cargo
// test`: a test binary that also exported `malloc` would shadow libc's
// own, and `ffi::resolve::real`'s `dlsym(RTLD_NEXT, ...)` would then
// resolve back to this crate instead of the genuine allocator.
#[cfg(not(test))]
mod intercept {
    use std::cell::Cell;
    use std::ffi::c_void;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::{config, policy, stats};

    const BUMP_BUFFER_SIZE: usize = 1 << 16;

    /// Serves allocations made during the recursive window where the
    /// allocator's own internals call back into these wrappers — most
    /// notably while `dlsym` is resolving the real symbols, which on some
    /// platforms allocates (spec.md section 9, "recursive initialization").
    /// Entries are never freed; the buffer is sized generously and exists
    /// only to get the process past that narrow window.
    struct BumpBuffer {
        data: std::cell::UnsafeCell<[u8; BUMP_BUFFER_SIZE]>,
        offset: AtomicUsize,
    }

    // Safety: concurrent callers only ever reserve disjoint byte ranges,
    // via the atomic fetch-add below.
    unsafe impl Sync for BumpBuffer {}

    impl BumpBuffer {
        const fn new() -> Self {
            BumpBuffer {
                data: std::cell::UnsafeCell::new([0; BUMP_BUFFER_SIZE]),
                offset: AtomicUsize::new(0),
            }
        }

        fn alloc(&self, size: usize) -> *mut u8 {
            const ALIGN: usize = 16;
            loop {
                let used = self.offset.load(Ordering::Relaxed);
                let aligned = (used + ALIGN - 1) & !(ALIGN - 1);
                let new_used = match aligned.checked_add(size) {
                    Some(n) => n,
                    None => return std::ptr::null_mut(),
                };
                if new_used > BUMP_BUFFER_SIZE {
                    return std::ptr::null_mut();
                }
                if self
                    .offset
                    .compare_exchange_weak(used, new_used, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let base = self.data.get() as *mut u8;
                    return unsafe { base.add(aligned) };
                }
            }
        }

        fn contains(&self, ptr: *mut c_void) -> bool {
            let base = self.data.get() as usize;
            let addr = ptr as usize;
            addr >= base && addr < base + BUMP_BUFFER_SIZE
        }
    }

    static BUMP: BumpBuffer = BumpBuffer::new();

    thread_local! {
        static IN_WRAPPER: Cell<bool> = const { Cell::new(false) };
    }

    /// Runs `normal` unless this thread is already inside one of these
    /// wrappers (the underlying allocator calling back into itself, e.g.
    /// from within `dlsym`), in which case `reentrant` runs instead and
    /// no stats are recorded (spec.md section 4.1, "recursion guard").
    fn with_guard<R>(reentrant: impl FnOnce() -> R, normal: impl FnOnce() -> R) -> R {
        IN_WRAPPER.with(|cell| {
            if cell.get() {
                reentrant()
            } else {
                cell.set(true);
                let result = normal();
                cell.set(false);
                result
            }
        })
    }

    fn ensure_atexit_registered() {
        static REGISTERED: OnceLock<()> = OnceLock::new();
        REGISTERED.get_or_init(|| unsafe {
            libc::atexit(summary_dtor);
        });
    }

    extern "C" fn summary_dtor() {
        let cfg = config::config();
        let summary = stats::STATS.snapshot(cfg, policy::index_metrics());
        summary.write(cfg.stats_file.as_deref());
    }

    #[no_mangle]
    pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
        ensure_atexit_registered();
        with_guard(
            || BUMP.alloc(size) as *mut c_void,
            || policy::on_malloc(size),
        )
    }

    #[no_mangle]
    pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
        ensure_atexit_registered();
        with_guard(
            || {
                let total = nmemb.checked_mul(size).unwrap_or(usize::MAX);
                // Fresh bump-buffer bytes are zero from static
                // initialization and never reused, so no explicit zeroing
                // is needed here.
                BUMP.alloc(total) as *mut c_void
            },
            || policy::on_calloc(nmemb, size),
        )
    }

    #[no_mangle]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        ensure_atexit_registered();
        with_guard(
            || {
                // A bump-buffer block can't be grown in place or
                // relocated; there is no safe minimum here beyond
                // refusing the request, consistent with "return null if
                // exhausted" for the allocating side of the guard.
                std::ptr::null_mut()
            },
            || policy::on_realloc(ptr, size),
        )
    }

    #[no_mangle]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        with_guard(
            || {
                if ptr.is_null() || BUMP.contains(ptr) {
                    // Bump-buffer pointers are never freed for real
                    // (spec.md section 4.1); anything else reaching this
                    // branch predates our own init and is passed through.
                    return;
                }
                unsafe { crate::ffi::resolve::real().free(ptr) };
            },
            || policy::on_free(ptr),
        )
    }
}

//! All-headers liveness policy (spec.md section 4.3): every allocation
//! carries the 16-byte header, so free-side reconciliation is exact.

use std::ffi::c_void;

use crate::config;
use crate::decision;
use crate::ffi::resolve::real;
use crate::header::Header;
use crate::stats::{self, IndexMetrics};

pub fn index_metrics() -> Option<IndexMetrics> {
    None
}

pub fn on_malloc(size: usize) -> *mut c_void {
    let cfg = config::config();
    let block_len = Header::block_len_for(size);
    let block = unsafe { real().malloc(block_len) };
    if block.is_null() {
        return block;
    }
    let user_ptr = unsafe { Header::user_ptr_for_block(block as *mut u8) };
    let addr = user_ptr as usize;
    let decision = decision::decide(cfg, addr, size);
    unsafe { Header::write_at(user_ptr, Header::new(decision.sampled, size)) };
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
            "op=malloc size={size} sampled={} weight={}",
            decision.sampled, decision.weight
        ),
    );
    user_ptr as *mut c_void
}

pub fn on_calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(user_size) = nmemb.checked_mul(size) else {
        return std::ptr::null_mut();
    };
    let cfg = config::config();
    let block_len = Header::block_len_for(user_size);
    // `calloc` on the block itself zeroes the header bytes too; harmless,
    // since they're overwritten immediately below.
    let block = unsafe { real().calloc(1, block_len) };
    if block.is_null() {
        return block;
    }
    let user_ptr = unsafe { Header::user_ptr_for_block(block as *mut u8) };
    let addr = user_ptr as usize;
    let decision = decision::decide(cfg, addr, user_size);
    unsafe { Header::write_at(user_ptr, Header::new(decision.sampled, user_size)) };
    stats::STATS.record_alloc(
        user_size as u64,
        decision.sampled,
        decision.weight,
        decision::page_coverage_addr(cfg, addr),
        cfg.window_size,
    );
    crate::diag::trace(
        cfg.event_trace_enabled,
        format_args!(
            "op=calloc size={user_size} sampled={} weight={}",
            decision.sampled, decision.weight
        ),
    );
    user_ptr as *mut c_void
}

pub fn on_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let cfg = config::config();
    let user_ptr = ptr as *mut u8;
    match unsafe { Header::read_at(user_ptr) } {
        Some(header) => {
            stats::STATS.record_free(header.is_sampled(), Some(header.reserved_size as u64));
            crate::diag::trace(
                cfg.event_trace_enabled,
                format_args!("op=free sampled={} size={}", header.is_sampled(), header.reserved_size),
            );
            let block_ptr = unsafe { user_ptr.sub(crate::header::HEADER_SIZE) };
            unsafe { real().free(block_ptr as *mut c_void) };
        }
        None => {
            // Foreign pointer (predates interposition, or came from a
            // non-intercepted path): pass through untouched, uncounted.
            crate::diag::trace(cfg.event_trace_enabled, format_args!("op=free foreign=true"));
            unsafe { real().free(ptr) };
        }
    }
}

pub fn on_realloc(ptr: *mut c_void, new_size: usize) -> *mut c_void {
    if ptr.is_null() {
        return on_malloc(new_size);
    }
    if new_size == 0 {
        on_free(ptr);
        return std::ptr::null_mut();
    }

    let user_ptr = ptr as *mut u8;
    let Some(old_header) = (unsafe { Header::read_at(user_ptr) }) else {
        return realloc_foreign(ptr, new_size);
    };

    let cfg = config::config();
    let block_ptr = unsafe { user_ptr.sub(crate::header::HEADER_SIZE) };
    let new_block_len = Header::block_len_for(new_size);
    let new_block = unsafe { real().realloc(block_ptr as *mut c_void, new_block_len) };
    if new_block.is_null() {
        return std::ptr::null_mut();
    }
    let new_user_ptr = unsafe { Header::user_ptr_for_block(new_block as *mut u8) };
    let addr = new_user_ptr as usize;
    let decision = decision::decide(cfg, addr, new_size);
    unsafe { Header::write_at(new_user_ptr, Header::new(decision.sampled, new_size)) };

    stats::STATS.record_free(old_header.is_sampled(), Some(old_header.reserved_size as u64));
    stats::STATS.record_alloc(
        new_size as u64,
        decision.sampled,
        decision.weight,
        decision::page_coverage_addr(cfg, addr),
        cfg.window_size,
    );
    crate::diag::trace(
        cfg.event_trace_enabled,
        format_args!(
            "op=realloc case=header old_size={} old_sampled={} new_size={new_size} new_sampled={}",
            old_header.reserved_size, old_header.is_sampled(), decision.sampled
        ),
    );

    new_user_ptr as *mut c_void
}

/// `ptr` was never ours (magic mismatch): spec.md section 4.1's
/// foreign-pointer realloc fallback. Determine its usable size via the
/// platform extension, allocate a fresh wrapped block, copy the smaller of
/// the two sizes, and release the foreign block through the real `free`.
fn realloc_foreign(ptr: *mut c_void, new_size: usize) -> *mut c_void {
    let old_usable = unsafe { libc::malloc_usable_size(ptr) };
    let new_ptr = on_malloc(new_size);
    if new_ptr.is_null() {
        return std::ptr::null_mut();
    }
    let copy_len = old_usable.min(new_size);
    unsafe {
        std::ptr::copy_nonoverlapping(ptr as *const u8, new_ptr as *mut u8, copy_len);
        real().free(ptr);
    }
    crate::diag::trace(
        config::config().event_trace_enabled,
        format_args!("op=realloc case=foreign_fallback old_usable={old_usable} new_size={new_size}"),
    );
    new_ptr
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_malloc_free_round_trip_does_not_crash() {
        let ptr = on_malloc(128);
        assert!(!ptr.is_null());
        let header = unsafe { Header::read_at(ptr as *mut u8) }.unwrap();
        assert_eq!(header.reserved_size, 128);
        on_free(ptr);
    }

    #[test]
    fn test_calloc_overflow_returns_null() {
        assert!(on_calloc(usize::MAX, 2).is_null());
    }

    #[test]
    fn test_foreign_pointer_realloc_preserves_header_contract() {
        let foreign = unsafe { libc::malloc(16) };
        assert!(!foreign.is_null());
        unsafe {
            std::ptr::write_bytes(foreign as *mut u8, 0xAB, 16);
        }
        let new_ptr = on_realloc(foreign, 64);
        assert!(!new_ptr.is_null());
        let header = unsafe { Header::read_at(new_ptr as *mut u8) }.unwrap();
        assert_eq!(header.reserved_size, 64);
        assert_eq!(unsafe { *(new_ptr as *const u8) }, 0xAB);
        on_free(new_ptr);
    }

    #[test]
    fn test_null_ptr_free_is_noop() {
        on_free(std::ptr::null_mut());
    }
}

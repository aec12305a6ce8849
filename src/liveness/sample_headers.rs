//! Sample-headers liveness policy (spec.md section 4.3): the header is
//! prepended only when an allocation is sampled; a process-wide pointer
//! index maps the user pointer to the underlying block so `free` can find
//! it. Index nodes and the bucket table are allocated from [`Arena`],
//! bypassing the wrapped allocator entirely, since building them through
//! `malloc` would re-enter this crate's own wrappers (spec.md section 9).

use std::ffi::c_void;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::arena::Arena;
use crate::config::{self, Config};
use crate::decision::{self, Decision};
use crate::ffi::resolve::real;
use crate::hash::Mixer;
use crate::header::Header;
use crate::stats::{self, IndexMetrics};

const BUCKETS: usize = 65_536;

struct Node {
    user_ptr: usize,
    block_ptr: usize,
    next: usize,
}

/// Raw bucket-head array, allocated once from [`NODE_ARENA`]. Protected by
/// [`INDEX`]'s mutex; never resized.
struct Table {
    buckets: *mut usize,
}

// Safety: the only access to `buckets` is through `Index`'s single mutex.
unsafe impl Send for Table {}

impl Table {
    fn new() -> Self {
        let bytes = BUCKETS * std::mem::size_of::<usize>();
        let ptr = match NODE_ARENA.alloc(bytes, std::mem::align_of::<usize>()) {
            Some(ptr) => ptr,
            None => {
                // No virtual address space left for a fixed 512 KiB
                // table: as unrecoverable as failing to resolve the real
                // allocator symbols at init.
                crate::diag::fatal(format_args!("failed to reserve sample-headers bucket table"));
                std::process::abort();
            }
        };
        let buckets = ptr.as_ptr() as *mut usize;
        unsafe { std::ptr::write_bytes(buckets, 0, BUCKETS) };
        Table { buckets }
    }

    unsafe fn slot(&self, idx: usize) -> *mut usize {
        self.buckets.add(idx)
    }
}

static NODE_ARENA: Arena = Arena::new();
static INDEX: Mutex<Option<Table>> = Mutex::new(None);

static INSERTS: AtomicU64 = AtomicU64::new(0);
static DELETES: AtomicU64 = AtomicU64::new(0);
static PEAK_SIZE: AtomicU64 = AtomicU64::new(0);
static INSERT_FAILURES: AtomicU64 = AtomicU64::new(0);

fn bucket_for(user_ptr: usize) -> usize {
    (Mixer::SplitMix64.mix(user_ptr as u64) as usize) % BUCKETS
}

/// Inserts `user_ptr -> block_ptr`. Returns `false` if the arena couldn't
/// provide a node (memory pressure); the caller still counts the
/// allocation as sampled, just untracked for free-side reconciliation
/// (spec.md section 7).
fn insert(user_ptr: usize, block_ptr: usize) -> bool {
    let Some(node_ptr) = NODE_ARENA.alloc(std::mem::size_of::<Node>(), std::mem::align_of::<Node>())
    else {
        INSERT_FAILURES.fetch_add(1, Ordering::Relaxed);
        return false;
    };
    let node_ptr = node_ptr.as_ptr() as *mut Node;

    let mut guard = INDEX.lock().unwrap();
    let table = guard.get_or_insert_with(Table::new);
    let bucket = bucket_for(user_ptr);
    unsafe {
        let slot = table.slot(bucket);
        node_ptr.write(Node { user_ptr, block_ptr, next: *slot });
        *slot = node_ptr as usize;
    }
    drop(guard);

    let inserted = INSERTS.fetch_add(1, Ordering::Relaxed) + 1;
    let size = inserted.saturating_sub(DELETES.load(Ordering::Relaxed));
    PEAK_SIZE.fetch_max(size, Ordering::Relaxed);
    true
}

/// Removes and returns the block pointer for `user_ptr`, or `None` if it
/// isn't in the index (i.e. `user_ptr` was never sampled).
fn remove(user_ptr: usize) -> Option<usize> {
    let mut guard = INDEX.lock().unwrap();
    let table = guard.as_mut()?;
    let bucket = bucket_for(user_ptr);
    unsafe {
        let mut slot = table.slot(bucket);
        loop {
            let cur = *slot;
            if cur == 0 {
                return None;
            }
            let node = cur as *mut Node;
            if (*node).user_ptr == user_ptr {
                *slot = (*node).next;
                DELETES.fetch_add(1, Ordering::Relaxed);
                return Some((*node).block_ptr);
            }
            slot = &mut (*node).next as *mut usize;
        }
    }
}

pub fn index_metrics() -> Option<IndexMetrics> {
    let inserts = INSERTS.load(Ordering::Relaxed);
    let deletes = DELETES.load(Ordering::Relaxed);
    Some(IndexMetrics {
        index_inserts: inserts,
        index_deletes: deletes,
        index_current_size: inserts.saturating_sub(deletes),
        index_peak_size: PEAK_SIZE.load(Ordering::Relaxed),
        index_insert_failures: INSERT_FAILURES.load(Ordering::Relaxed),
    })
}

pub fn on_malloc(size: usize) -> *mut c_void {
    let cfg = config::config();
    if decision::decides_without_address(cfg.scheme) {
        let decision = decision::decide(cfg, 0, size);
        return finish_malloc(cfg, size, decision);
    }
    allocate_address_based(cfg, size)
}

/// Address-based schemes need the address before they can decide, but the
/// address isn't known until after allocating. Spec.md section 4.2,
/// option (b): allocate a throwaway plain block to learn the address,
/// decide, then either keep it (not sampled) or replace it with a
/// prefixed block (sampled). Doubles the cost of a sampled allocation;
/// documented there as supported but not recommended.
fn allocate_address_based(cfg: &Config, size: usize) -> *mut c_void {
    let plain = unsafe { real().malloc(size) };
    if plain.is_null() {
        return plain;
    }
    let addr = plain as usize;
    let decision = decision::decide(cfg, addr, size);
    if !decision.sampled {
        stats::STATS.record_alloc(size as u64, false, 0, None, cfg.window_size);
        crate::diag::trace(
            cfg.event_trace_enabled,
            format_args!("op=malloc size={size} sampled=false weight=0"),
        );
        return plain;
    }
    unsafe { real().free(plain) };
    finish_malloc(cfg, size, decision)
}

fn finish_malloc(cfg: &Config, size: usize, decision: Decision) -> *mut c_void {
    if !decision.sampled {
        let ptr = unsafe { real().malloc(size) };
        if !ptr.is_null() {
            stats::STATS.record_alloc(size as u64, false, 0, None, cfg.window_size);
            crate::diag::trace(
                cfg.event_trace_enabled,
                format_args!("op=malloc size={size} sampled=false weight=0"),
            );
        }
        return ptr;
    }

    let block_len = Header::block_len_for(size);
    let block = unsafe { real().malloc(block_len) };
    if block.is_null() {
        return block;
    }
    let user_ptr = unsafe { Header::user_ptr_for_block(block as *mut u8) };
    unsafe { Header::write_at(user_ptr, Header::new(true, size)) };
    insert(user_ptr as usize, block as usize);
    stats::STATS.record_alloc(size as u64, true, decision.weight, None, cfg.window_size);
    crate::diag::trace(
        cfg.event_trace_enabled,
        format_args!("op=malloc size={size} sampled=true weight={}", decision.weight),
    );
    user_ptr as *mut c_void
}

pub fn on_calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(user_size) = nmemb.checked_mul(size) else {
        return std::ptr::null_mut();
    };
    let cfg = config::config();

    if decision::decides_without_address(cfg.scheme) {
        let decision = decision::decide(cfg, 0, user_size);
        return finish_calloc(cfg, user_size, decision);
    }

    let plain = unsafe { real().calloc(1, user_size) };
    if plain.is_null() {
        return plain;
    }
    let addr = plain as usize;
    let decision = decision::decide(cfg, addr, user_size);
    if !decision.sampled {
        stats::STATS.record_alloc(user_size as u64, false, 0, None, cfg.window_size);
        crate::diag::trace(
            cfg.event_trace_enabled,
            format_args!("op=calloc size={user_size} sampled=false weight=0"),
        );
        return plain;
    }
    unsafe { real().free(plain) };
    finish_calloc(cfg, user_size, decision)
}

fn finish_calloc(cfg: &Config, user_size: usize, decision: Decision) -> *mut c_void {
    if !decision.sampled {
        let ptr = unsafe { real().calloc(1, user_size) };
        if !ptr.is_null() {
            stats::STATS.record_alloc(user_size as u64, false, 0, None, cfg.window_size);
            crate::diag::trace(
                cfg.event_trace_enabled,
                format_args!("op=calloc size={user_size} sampled=false weight=0"),
            );
        }
        return ptr;
    }

    let block_len = Header::block_len_for(user_size);
    let block = unsafe { real().calloc(1, block_len) };
    if block.is_null() {
        return block;
    }
    let user_ptr = unsafe { Header::user_ptr_for_block(block as *mut u8) };
    unsafe { Header::write_at(user_ptr, Header::new(true, user_size)) };
    insert(user_ptr as usize, block as usize);
    stats::STATS.record_alloc(user_size as u64, true, decision.weight, None, cfg.window_size);
    crate::diag::trace(
        cfg.event_trace_enabled,
        format_args!("op=calloc size={user_size} sampled=true weight={}", decision.weight),
    );
    user_ptr as *mut c_void
}

pub fn on_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let cfg = config::config();
    match remove(ptr as usize) {
        Some(block_ptr) => {
            let reserved = unsafe { Header::read_at(ptr as *mut u8) }.map(|h| h.reserved_size as u64);
            stats::STATS.record_free(true, reserved);
            crate::diag::trace(
                cfg.event_trace_enabled,
                format_args!("op=free sampled=true size={}", reserved.unwrap_or(0)),
            );
            unsafe { real().free(block_ptr as *mut c_void) };
        }
        None => {
            stats::STATS.record_free(false, None);
            crate::diag::trace(cfg.event_trace_enabled, format_args!("op=free sampled=false"));
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

    let cfg = config::config();
    let old_user_addr = ptr as usize;
    let will_sample = if decision::decides_without_address(cfg.scheme) {
        decision::decide(cfg, 0, new_size)
    } else {
        // The index has no concept of "foreign": every live user pointer
        // is either in the index (was sampled) or not. For the
        // address-based re-decision we reuse the existing address rather
        // than paying for another throwaway allocation.
        decision::decide(cfg, old_user_addr, new_size)
    };

    match remove(old_user_addr) {
        Some(old_block_ptr) => realloc_was_sampled(cfg, ptr, old_user_addr, old_block_ptr, new_size, will_sample),
        None => realloc_was_unsampled(cfg, ptr, new_size, will_sample),
    }
}

fn realloc_was_sampled(
    cfg: &Config,
    old_user_ptr: *mut c_void,
    old_user_addr: usize,
    old_block_ptr: usize,
    new_size: usize,
    will_sample: Decision,
) -> *mut c_void {
    let old_reserved = unsafe { Header::read_at(old_user_ptr as *mut u8) }.map(|h| h.reserved_size as u64);

    if will_sample.sampled {
        // both sampled: realloc the prefixed block in place, re-insert
        // under whatever user pointer comes back.
        let new_block_len = Header::block_len_for(new_size);
        let new_block = unsafe { real().realloc(old_block_ptr as *mut c_void, new_block_len) };
        if new_block.is_null() {
            insert(old_user_addr, old_block_ptr);
            return std::ptr::null_mut();
        }
        let new_user_ptr = unsafe { Header::user_ptr_for_block(new_block as *mut u8) };
        unsafe { Header::write_at(new_user_ptr, Header::new(true, new_size)) };
        insert(new_user_ptr as usize, new_block as usize);
        stats::STATS.record_free(true, old_reserved);
        stats::STATS.record_alloc(new_size as u64, true, will_sample.weight, None, cfg.window_size);
        crate::diag::trace(
            cfg.event_trace_enabled,
            format_args!(
                "op=realloc case=sampled_to_sampled old_size={} new_size={new_size} new_weight={}",
                old_reserved.unwrap_or(0),
                will_sample.weight
            ),
        );
        new_user_ptr as *mut c_void
    } else {
        // sampled -> unsampled: move to a plain block.
        let new_ptr = unsafe { real().malloc(new_size) };
        if new_ptr.is_null() {
            insert(old_user_addr, old_block_ptr);
            return std::ptr::null_mut();
        }
        let old_usable = old_reserved.unwrap_or(0) as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(
                old_user_ptr as *const u8,
                new_ptr as *mut u8,
                old_usable.min(new_size),
            );
            real().free(old_block_ptr as *mut c_void);
        }
        stats::STATS.record_free(true, old_reserved);
        stats::STATS.record_alloc(new_size as u64, false, 0, None, cfg.window_size);
        crate::diag::trace(
            cfg.event_trace_enabled,
            format_args!(
                "op=realloc case=sampled_to_unsampled old_size={} new_size={new_size}",
                old_reserved.unwrap_or(0)
            ),
        );
        new_ptr
    }
}

fn realloc_was_unsampled(cfg: &Config, old_ptr: *mut c_void, new_size: usize, will_sample: Decision) -> *mut c_void {
    if will_sample.sampled {
        // unsampled -> sampled: move to a prefixed block.
        let old_usable = unsafe { libc::malloc_usable_size(old_ptr) };
        let block_len = Header::block_len_for(new_size);
        let new_block = unsafe { real().malloc(block_len) };
        if new_block.is_null() {
            return std::ptr::null_mut();
        }
        let new_user_ptr = unsafe { Header::user_ptr_for_block(new_block as *mut u8) };
        unsafe {
            std::ptr::copy_nonoverlapping(old_ptr as *const u8, new_user_ptr, old_usable.min(new_size));
            Header::write_at(new_user_ptr, Header::new(true, new_size));
            real().free(old_ptr);
        }
        insert(new_user_ptr as usize, new_block as usize);
        stats::STATS.record_free(false, None);
        stats::STATS.record_alloc(new_size as u64, true, will_sample.weight, None, cfg.window_size);
        crate::diag::trace(
            cfg.event_trace_enabled,
            format_args!(
                "op=realloc case=unsampled_to_sampled new_size={new_size} new_weight={}",
                will_sample.weight
            ),
        );
        new_user_ptr as *mut c_void
    } else {
        // both unsampled: plain realloc.
        let new_ptr = unsafe { real().realloc(old_ptr, new_size) };
        if new_ptr.is_null() {
            return std::ptr::null_mut();
        }
        stats::STATS.record_free(false, None);
        stats::STATS.record_alloc(new_size as u64, false, 0, None, cfg.window_size);
        crate::diag::trace(
            cfg.event_trace_enabled,
            format_args!("op=realloc case=unsampled_to_unsampled new_size={new_size}"),
        );
        new_ptr
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_insert_then_remove_round_trips() {
        let before = index_metrics().unwrap();
        assert!(insert(0x1000, 0x0FF0));
        assert_eq!(remove(0x1000), Some(0x0FF0));
        assert_eq!(remove(0x1000), None);
        let after = index_metrics().unwrap();
        assert_eq!(after.index_inserts, before.index_inserts + 1);
        assert_eq!(after.index_deletes, before.index_deletes + 1);
    }

    #[test]
    fn test_remove_on_empty_index_is_none() {
        assert_eq!(remove(0xDEAD_BEEF), None);
    }

    #[test]
    fn test_bucket_for_is_deterministic() {
        assert_eq!(bucket_for(0x1234), bucket_for(0x1234));
    }

    #[test]
    fn test_colliding_bucket_chain_preserves_both_entries() {
        // Two distinct user pointers may land in the same bucket; both
        // must still be independently findable and removable.
        let a = 0x2000;
        let b = 0x2000 + (BUCKETS * 8); // arbitrary distinct address
        insert(a, a + 16);
        insert(b, b + 16);
        let got_a = remove(a);
        let got_b = remove(b);
        assert_eq!(got_a, Some(a + 16));
        assert_eq!(got_b, Some(b + 16));
    }
}

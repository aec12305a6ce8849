//! A bump arena backed directly by anonymous `mmap` pages, used by the
//! `sample-headers` policy to allocate pointer-index nodes without ever
//! going through the wrapped `malloc` (spec.md section 9: "allocations
//! for index nodes must bypass the wrappers, to prevent recursion").

use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

const CHUNK_SIZE: usize = 1 << 20; // 1 MiB per chunk.

struct Chunk {
    ptr: NonNull<u8>,
    len: usize,
    used: AtomicUsize,
}

// Safety: `ptr` points at a private anonymous mapping this struct owns
// exclusively; concurrent bumping of `used` is synchronized by the atomic
// fetch_add in `Arena::alloc`, and nothing ever reads/writes through `ptr`
// without first reserving a disjoint byte range via that fetch_add.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    fn new(len: usize) -> Option<Chunk> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        Some(Chunk { ptr: NonNull::new(ptr as *mut u8)?, len, used: AtomicUsize::new(0) })
    }

    /// Reserves `size` bytes aligned to `align`, returning a pointer into
    /// this chunk if it still has room.
    fn try_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        loop {
            let used = self.used.load(Ordering::Relaxed);
            let aligned = (used + align - 1) & !(align - 1);
            let new_used = aligned.checked_add(size)?;
            if new_used > self.len {
                return None;
            }
            if self
                .used
                .compare_exchange_weak(used, new_used, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                let base = self.ptr.as_ptr();
                return NonNull::new(unsafe { base.add(aligned) });
            }
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// A growable bump arena. Individual allocations are never freed
/// (spec.md section 9, open question: "no eviction policy is specified");
/// whole chunks are unmapped when the arena itself drops, which in
/// practice is never, since it lives for the duration of the process.
pub struct Arena {
    chunks: Mutex<Vec<Chunk>>,
}

impl Arena {
    pub const fn new() -> Self {
        Arena { chunks: Mutex::new(Vec::new()) }
    }

    /// Allocates `size` bytes aligned to `align` from direct-`mmap`
    /// memory. Returns `None` on allocation failure (e.g. `mmap` itself
    /// failing under memory pressure); the caller must treat that the
    /// same way spec.md section 7 treats index-insertion failure: the
    /// sample is still recorded in counters, just not tracked for
    /// free-side reconciliation.
    pub fn alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut chunks = self.chunks.lock().unwrap();
        if let Some(last) = chunks.last() {
            if let Some(ptr) = last.try_alloc(size, align) {
                return Some(ptr);
            }
        }
        let chunk_len = size.max(CHUNK_SIZE).next_power_of_two();
        let chunk = Chunk::new(chunk_len)?;
        let ptr = chunk.try_alloc(size, align)?;
        chunks.push(chunk);
        Some(ptr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_alloc_returns_distinct_pointers() {
        let arena = Arena::new();
        let a = arena.alloc(64, 8).unwrap();
        let b = arena.alloc(64, 8).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn test_alloc_respects_alignment() {
        let arena = Arena::new();
        for _ in 0..32 {
            let _ = arena.alloc(3, 8).unwrap();
        }
        let ptr = arena.alloc(16, 16).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
    }

    #[test]
    fn test_alloc_spans_chunk_boundary() {
        let arena = Arena::new();
        // Force a chunk rollover.
        let first = arena.alloc(CHUNK_SIZE - 8, 8).unwrap();
        let second = arena.alloc(64, 8).unwrap();
        assert_ne!(first.as_ptr(), second.as_ptr());
    }
}

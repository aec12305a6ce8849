//! Resolves the real, underlying `malloc`/`calloc`/`realloc`/`free`
//! symbols via `dlsym(RTLD_NEXT, ...)` (spec.md section 3: "the wrapper
//! must locate and call through to the next allocator in the dynamic
//! linker's symbol chain"). Pairs the raw libc call with
//! `Error::last_os_error()` on failure, the same way any other fallible
//! libc call in this crate is checked, adapted here to `dlsym`, whose
//! failure is signalled by a null return rather than `-1`.

use std::ffi::{c_void, CStr};
use std::io::{Error, Result};
use std::sync::OnceLock;

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);

/// Function pointers for the real allocator, resolved once at first use.
pub struct RealAllocator {
    malloc: MallocFn,
    calloc: CallocFn,
    realloc: ReallocFn,
    free: FreeFn,
}

impl RealAllocator {
    fn resolve() -> Result<Self> {
        Ok(RealAllocator {
            malloc: unsafe { resolve_symbol(c"malloc")? },
            calloc: unsafe { resolve_symbol(c"calloc")? },
            realloc: unsafe { resolve_symbol(c"realloc")? },
            free: unsafe { resolve_symbol(c"free")? },
        })
    }

    /// # Safety
    /// Same preconditions as the libc `malloc`.
    pub unsafe fn malloc(&self, size: usize) -> *mut c_void {
        (self.malloc)(size)
    }

    /// # Safety
    /// Same preconditions as the libc `calloc`.
    pub unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
        (self.calloc)(nmemb, size)
    }

    /// # Safety
    /// Same preconditions as the libc `realloc`.
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        (self.realloc)(ptr, size)
    }

    /// # Safety
    /// Same preconditions as the libc `free`.
    pub unsafe fn free(&self, ptr: *mut c_void) {
        (self.free)(ptr)
    }
}

/// # Safety
/// `name` must name a function symbol whose ABI matches `F`.
unsafe fn resolve_symbol<F: Copy>(name: &CStr) -> Result<F> {
    let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
    if sym.is_null() {
        return Err(Error::last_os_error());
    }
    // Safety: `F` is always one of the `*Fn` aliases above, all of which
    // are plain function pointers, the same size and representation as
    // the `*mut c_void` `dlsym` returns.
    Ok(std::mem::transmute_copy::<*mut c_void, F>(&sym))
}

static REAL: OnceLock<RealAllocator> = OnceLock::new();

/// Returns the resolved real allocator, resolving it on first call.
///
/// Failure here means `dlsym` itself failed, which spec.md section 7
/// treats as unrecoverable: there is no allocator left to delegate to, so
/// the process aborts rather than limping on.
pub fn real() -> &'static RealAllocator {
    REAL.get_or_init(|| match RealAllocator::resolve() {
        Ok(real) => real,
        Err(e) => {
            crate::diag::fatal(format_args!("failed to resolve real allocator symbols: {e}"));
            std::process::abort();
        }
    })
}

//! Allocator Shim
//!
//! A thin wrapper over the system allocator with debug logging, kept as a
//! collaborator of the two managed subsystems rather than part of them.
//! Callers observe only the raw pointer of the returned [`ShimPtr`];
//! ownership of the storage stays with a registry owned by the shim.
//!
//! The registry retains every allocation for the life of the process: there
//! is no release operation on this surface, so entries accumulate. This
//! mirrors the behaviour of the interface this shim replaces and is a
//! suspected defect of that interface, not a contract.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::log::{self, LogLevel, Subsystem};

/// Result of a shim allocation. Only `raw` is meaningful to callers.
#[derive(Debug, Clone, Copy)]
pub struct ShimPtr {
    raw: *mut u8,
}

impl ShimPtr {
    /// The raw pointer, or null if the allocation failed.
    pub fn raw(&self) -> *mut u8 {
        self.raw
    }

    /// Whether the allocation failed.
    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }
}

/// One registry-owned allocation.
struct ShimAllocation {
    raw: *mut u8,
    layout: Layout,
}

impl Drop for ShimAllocation {
    fn drop(&mut self) {
        log::event(LogLevel::Debug, Subsystem::Shim, "freed")
            .addr("at", self.raw as usize)
            .bytes("size", self.layout.size())
            .emit();
        unsafe { alloc::dealloc(self.raw, self.layout) };
    }
}

// Entries own raw heap storage that is valid until dropped.
unsafe impl Send for ShimAllocation {}

/// Registry of live shim allocations, keyed by address.
static SHIM_REGISTRY: OnceLock<Mutex<HashMap<usize, ShimAllocation>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<usize, ShimAllocation>> {
    SHIM_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn allocate(size: usize, zeroed: bool, kind: &'static str) -> ShimPtr {
    let null = ShimPtr {
        raw: std::ptr::null_mut(),
    };
    let Ok(layout) = Layout::from_size_align(size, std::mem::align_of::<usize>()) else {
        return null;
    };
    if layout.size() == 0 {
        return null;
    }
    let raw = unsafe {
        if zeroed {
            alloc::alloc_zeroed(layout)
        } else {
            alloc::alloc(layout)
        }
    };
    if raw.is_null() {
        return null;
    }

    registry()
        .lock()
        .insert(raw as usize, ShimAllocation { raw, layout });

    log::event(LogLevel::Debug, Subsystem::Shim, "allocated")
        .name("kind", kind)
        .addr("at", raw as usize)
        .bytes("size", size)
        .emit();
    ShimPtr { raw }
}

/// Allocate `size` bytes. Returns a null [`ShimPtr`] on failure.
pub fn new_malloc(size: usize) -> ShimPtr {
    allocate(size, false, "malloc")
}

/// Allocate `count * size` zeroed bytes. Returns a null [`ShimPtr`] on
/// failure or multiplication overflow.
pub fn new_calloc(count: usize, size: usize) -> ShimPtr {
    match count.checked_mul(size) {
        Some(total) => allocate(total, true, "calloc"),
        None => ShimPtr {
            raw: std::ptr::null_mut(),
        },
    }
}

/// Number of live registry entries. Diagnostic.
pub fn shim_live_count() -> usize {
    registry().lock().len()
}

//! Atomic Shared Pointers
//!
//! An atomically reference-counted shared-pointer facility with weak
//! references for non-cyclic sharing with deterministic destruction.
//!
//! Every managed object is owned by a [`ControlBlock`]: separate strong and
//! weak counters (cache-line-separated to avoid false sharing), the managed
//! pointer, an object-destroyed flag and a shared/exclusive lock that
//! serialises destruction against concurrent dereferences. The managed
//! object dies when the strong count reaches zero; the control block dies
//! when both counters have reached zero.
//!
//! [`Shared<T>`] is the dual-mode handle over a control block: strong
//! handles own the object, weak handles own only the right to test for
//! liveness and to try an upgrade. Dereferencing takes a scoped read view
//! holding the shared lock; mutation takes the exclusive write view.
//!
//! Two 64-bit sentinels flank each control block and every counter mutation
//! verifies them, catching writes through dangling handles: violations
//! panic with a diagnostic carrying the caller's source location when the
//! safety checks are enabled (debug builds by default) and abort the
//! process otherwise.

use std::alloc::{self, Layout};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::process;
use std::ptr::{self, NonNull};
use std::sync::atomic::{
    fence, AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering,
};

use crossbeam_utils::CachePadded;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config;
use crate::gc::AllocError;
use crate::log::{self, LogLevel, Subsystem};

// ============================================================================
// Safety Violations
// ============================================================================

/// Sentinel value of a live control block.
const SENTINEL_ALIVE: u64 = 0xA5A5_5A5A_C0DE_FEED;
/// Sentinel value written when the control block is destroyed.
const SENTINEL_DESTROYED: u64 = 0xDEAD_0000_DEAD_0000;

/// A detected memory-safety violation: weak or null dereference, corrupted
/// sentinels, or use of a destroyed control block.
#[derive(Debug, Clone)]
pub struct SafetyViolation {
    message: &'static str,
    location: &'static Location<'static>,
}

impl SafetyViolation {
    /// Describe the violation.
    pub fn message(&self) -> &'static str {
        self.message
    }

    /// Source location of the offending call.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory-safety violation: {} at {}:{}:{}",
            self.message,
            self.location.file(),
            self.location.line(),
            self.location.column()
        )
    }
}

impl std::error::Error for SafetyViolation {}

/// Report a violation: panic with a diagnostic when the safety checks are
/// enabled, abort otherwise.
#[track_caller]
fn violation(message: &'static str) -> ! {
    let failure = SafetyViolation {
        message,
        location: Location::caller(),
    };
    if config::safety_checks_enabled() {
        panic!("{}", failure);
    }
    log::event(LogLevel::Error, Subsystem::Shared, "memory-safety violation")
        .name("fault", failure.message)
        .name("file", failure.location.file())
        .count("line", failure.location.line() as u64)
        .emit();
    process::abort();
}

// ============================================================================
// Statistics
// ============================================================================

static SHARED_BLOCKS_CREATED: AtomicU64 = AtomicU64::new(0);
static SHARED_BLOCKS_DESTROYED: AtomicU64 = AtomicU64::new(0);
static SHARED_WEAK_UPGRADES: AtomicU64 = AtomicU64::new(0);
static SHARED_WEAK_UPGRADE_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Snapshot of shared-pointer statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedStats {
    /// Control blocks created.
    pub blocks_created: u64,
    /// Control blocks destroyed.
    pub blocks_destroyed: u64,
    /// Successful weak-to-strong upgrades.
    pub weak_upgrades: u64,
    /// Upgrades that failed because the object was already destroyed.
    pub weak_upgrade_failures: u64,
}

/// Get a snapshot of shared-pointer statistics.
pub fn shared_stats() -> SharedStats {
    SharedStats {
        blocks_created: SHARED_BLOCKS_CREATED.load(Ordering::Relaxed),
        blocks_destroyed: SHARED_BLOCKS_DESTROYED.load(Ordering::Relaxed),
        weak_upgrades: SHARED_WEAK_UPGRADES.load(Ordering::Relaxed),
        weak_upgrade_failures: SHARED_WEAK_UPGRADE_FAILURES.load(Ordering::Relaxed),
    }
}

// ============================================================================
// Control Block
// ============================================================================

/// Reference counts plus managed-object lifetime for one shared allocation.
struct ControlBlock<T> {
    header_sentinel: AtomicU64,
    /// Strong count. Padded: the strong and weak counters are hammered by
    /// different handles and must not share a cache line.
    strong: CachePadded<AtomicUsize>,
    /// Weak count.
    weak: CachePadded<AtomicUsize>,
    /// The managed object. Swapped to null during destruction.
    target: AtomicPtr<T>,
    /// Set once by the thread that wins the destruction race.
    object_destroyed: AtomicBool,
    /// Whether the payload is an element array.
    is_array: bool,
    /// Element count (1 for single values).
    len: usize,
    /// Protects the managed object: dereferences hold it shared,
    /// destruction holds it exclusive until readers drain.
    lock: RwLock<()>,
    /// Set by the destructor for use-after-free detection.
    destroyed: AtomicBool,
    footer_sentinel: AtomicU64,
}

impl<T> ControlBlock<T> {
    fn new(target: *mut T, is_array: bool, len: usize) -> Self {
        Self {
            header_sentinel: AtomicU64::new(SENTINEL_ALIVE),
            strong: CachePadded::new(AtomicUsize::new(1)),
            weak: CachePadded::new(AtomicUsize::new(0)),
            target: AtomicPtr::new(target),
            object_destroyed: AtomicBool::new(false),
            is_array,
            len,
            lock: RwLock::new(()),
            destroyed: AtomicBool::new(false),
            footer_sentinel: AtomicU64::new(SENTINEL_ALIVE),
        }
    }

    /// Check the sentinels and the destroyed flag. Only active when the
    /// safety checks are enabled.
    #[track_caller]
    fn verify(&self) {
        if !config::safety_checks_enabled() {
            return;
        }
        if self.header_sentinel.load(Ordering::Relaxed) != SENTINEL_ALIVE
            || self.footer_sentinel.load(Ordering::Relaxed) != SENTINEL_ALIVE
        {
            violation("control block corrupted");
        }
        if self.destroyed.load(Ordering::Acquire) {
            violation("control block used after destruction");
        }
    }

    /// Add one strong unit. The caller must already hold a strong unit.
    #[track_caller]
    fn add_strong(&self) {
        self.verify();
        self.strong.fetch_add(1, Ordering::Relaxed);
    }

    /// Add one weak unit. The caller must hold a unit of either kind.
    #[track_caller]
    fn add_weak(&self) {
        self.verify();
        self.weak.fetch_add(1, Ordering::Relaxed);
    }

    /// Add one strong unit iff the count is currently positive. The only
    /// safe path for a weak handle to obtain ownership.
    fn try_add_strong(&self) -> bool {
        let mut count = self.strong.load(Ordering::Acquire);
        while count > 0 {
            match self.strong.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => count = observed,
            }
        }
        false
    }

    fn strong_count(&self) -> usize {
        self.strong.load(Ordering::Acquire)
    }

    fn weak_count(&self) -> usize {
        self.weak.load(Ordering::Acquire)
    }

    fn is_alive(&self) -> bool {
        self.strong_count() > 0
    }

    fn get_target(&self) -> *mut T {
        self.target.load(Ordering::Acquire)
    }

    /// Destroy the managed object exactly once.
    ///
    /// Gated by a CAS on the destroyed flag; the winner takes the exclusive
    /// lock, which drains every reader that saw a non-null pointer, then
    /// swaps the pointer to null and deletes the payload.
    fn destroy_object(&self) {
        if self.object_destroyed.load(Ordering::Acquire) {
            return;
        }
        if self
            .object_destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let _guard = self.lock.write();
        let target = self.target.swap(ptr::null_mut(), Ordering::AcqRel);
        if target.is_null() {
            return;
        }
        unsafe {
            if self.is_array {
                // Reverse of construction order.
                for i in (0..self.len).rev() {
                    ptr::drop_in_place(target.add(i));
                }
                if let Ok(layout) = Layout::array::<T>(self.len) {
                    if layout.size() > 0 {
                        alloc::dealloc(target.cast(), layout);
                    }
                }
            } else {
                drop(Box::from_raw(target));
            }
        }
    }

    /// Release one strong unit; the last one destroys the managed object
    /// and, if no weak units remain, the control block itself.
    ///
    /// # Safety
    ///
    /// `this` must point to a live control block and the caller must own
    /// one strong unit.
    unsafe fn release_strong(this: NonNull<Self>) {
        let block = this.as_ref();
        let prior = block.strong.fetch_sub(1, Ordering::Release);
        if prior == 0 {
            // Underflow guard.
            return;
        }
        if prior == 1 {
            // Synchronise with every earlier release.
            fence(Ordering::Acquire);
            block.destroy_object();

            // Read the weak count before any self-deallocation: reading it
            // after would race a concurrent weak release freeing the block.
            let weak = block.weak_count();
            if weak == 0 {
                fence(Ordering::Acquire);
                drop(Box::from_raw(this.as_ptr()));
            }
        }
    }

    /// Release one weak unit; the last one frees the control block if the
    /// strong count has already reached zero.
    ///
    /// # Safety
    ///
    /// `this` must point to a live control block and the caller must own
    /// one weak unit.
    unsafe fn release_weak(this: NonNull<Self>) {
        let block = this.as_ref();
        let prior = block.weak.fetch_sub(1, Ordering::Release);
        if prior == 0 {
            // Underflow guard.
            return;
        }
        if prior == 1 {
            fence(Ordering::Acquire);

            // Same rule as the strong side: read before any deallocation.
            let strong = block.strong_count();
            if strong == 0 {
                fence(Ordering::Acquire);
                drop(Box::from_raw(this.as_ptr()));
            }
        }
    }
}

impl<T> Drop for ControlBlock<T> {
    fn drop(&mut self) {
        self.destroyed.store(true, Ordering::Release);
        self.header_sentinel
            .store(SENTINEL_DESTROYED, Ordering::Release);
        self.footer_sentinel
            .store(SENTINEL_DESTROYED, Ordering::Release);
        SHARED_BLOCKS_DESTROYED.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Scoped Views
// ============================================================================

/// Shared access to a managed object; holds the control block's lock in
/// shared mode until dropped. Destruction cannot begin while it exists.
pub struct ReadGuard<'a, T> {
    _lock: RwLockReadGuard<'a, ()>,
    value: &'a T,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

/// Exclusive access to a managed object; holds the control block's lock in
/// exclusive mode until dropped.
pub struct WriteGuard<'a, T> {
    _lock: RwLockWriteGuard<'a, ()>,
    value: &'a mut T,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for WriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

// ============================================================================
// Shared<T> Handle
// ============================================================================

/// A dual-mode (strong or weak) handle over a reference-counted allocation.
///
/// A live handle has contributed exactly one unit to either the strong or
/// the weak counter of its control block, according to its mode. Cloning
/// adds a unit of the same kind; dropping releases it. The managed object
/// is destroyed when the last strong unit is released; weak handles then
/// observe [`expired`](Shared::expired) and fail to
/// [`lock`](Shared::lock).
pub struct Shared<T> {
    ctrl: AtomicPtr<ControlBlock<T>>,
    is_weak: AtomicBool,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Sync> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    /// Create a null handle.
    pub const fn null() -> Self {
        Self {
            ctrl: AtomicPtr::new(ptr::null_mut()),
            is_weak: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }

    fn from_raw(ctrl: NonNull<ControlBlock<T>>, weak: bool) -> Self {
        Self {
            ctrl: AtomicPtr::new(ctrl.as_ptr()),
            is_weak: AtomicBool::new(weak),
            _marker: PhantomData,
        }
    }

    fn block(&self) -> Option<&ControlBlock<T>> {
        unsafe { self.ctrl.load(Ordering::Acquire).as_ref() }
    }

    /// Release this handle's unit.
    fn release(&self) {
        if let Some(ctrl) = NonNull::new(self.ctrl.load(Ordering::Acquire)) {
            unsafe {
                if self.is_weak.load(Ordering::Acquire) {
                    ControlBlock::release_weak(ctrl);
                } else {
                    ControlBlock::release_strong(ctrl);
                }
            }
        }
    }

    /// The exposed pointer: null for null and weak handles.
    pub fn get(&self) -> *const T {
        if self.is_weak.load(Ordering::Acquire) {
            return ptr::null();
        }
        match self.block() {
            Some(block) => block.get_target(),
            None => ptr::null(),
        }
    }

    /// Whether the handle refers to no control block.
    pub fn is_null(&self) -> bool {
        self.ctrl.load(Ordering::Acquire).is_null()
    }

    /// Scoped shared access to the managed object.
    ///
    /// The object is alive and cannot begin destruction for the lifetime of
    /// the returned view. Dereferencing a weak or null handle is a safety
    /// violation.
    #[track_caller]
    pub fn read(&self) -> ReadGuard<'_, T> {
        if self.is_weak.load(Ordering::Acquire) {
            violation("cannot dereference a weak handle");
        }
        let Some(block) = self.block() else {
            violation("null handle dereferenced");
        };
        block.verify();
        let lock = block.lock.read();
        let target = block.get_target();
        ReadGuard {
            _lock: lock,
            value: unsafe { &*target },
        }
    }

    /// Non-panicking variant of [`read`](Shared::read); `None` on weak or
    /// null handles.
    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        if self.is_weak.load(Ordering::Acquire) {
            return None;
        }
        let block = self.block()?;
        block.verify();
        let lock = block.lock.read();
        let target = block.get_target();
        Some(ReadGuard {
            _lock: lock,
            value: unsafe { &*target },
        })
    }

    /// Scoped exclusive access to the managed object.
    #[track_caller]
    pub fn write(&self) -> WriteGuard<'_, T> {
        if self.is_weak.load(Ordering::Acquire) {
            violation("cannot dereference a weak handle");
        }
        let Some(block) = self.block() else {
            violation("null handle dereferenced");
        };
        block.verify();
        let lock = block.lock.write();
        let target = block.get_target();
        WriteGuard {
            _lock: lock,
            value: unsafe { &mut *target },
        }
    }

    /// Non-panicking variant of [`write`](Shared::write).
    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        if self.is_weak.load(Ordering::Acquire) {
            return None;
        }
        let block = self.block()?;
        block.verify();
        let lock = block.lock.write();
        let target = block.get_target();
        Some(WriteGuard {
            _lock: lock,
            value: unsafe { &mut *target },
        })
    }

    /// Scoped shared access to one element of an array allocation.
    #[track_caller]
    pub fn read_at(&self, index: usize) -> ReadGuard<'_, T> {
        if self.is_weak.load(Ordering::Acquire) {
            violation("cannot dereference a weak handle");
        }
        let Some(block) = self.block() else {
            violation("null handle dereferenced");
        };
        block.verify();
        if !block.is_array {
            violation("element access on a non-array handle");
        }
        if index >= block.len {
            violation("array element index out of bounds");
        }
        let lock = block.lock.read();
        let base = block.get_target();
        ReadGuard {
            _lock: lock,
            value: unsafe { &*base.add(index) },
        }
    }

    /// Scoped exclusive access to one element of an array allocation.
    #[track_caller]
    pub fn write_at(&self, index: usize) -> WriteGuard<'_, T> {
        if self.is_weak.load(Ordering::Acquire) {
            violation("cannot dereference a weak handle");
        }
        let Some(block) = self.block() else {
            violation("null handle dereferenced");
        };
        block.verify();
        if !block.is_array {
            violation("element access on a non-array handle");
        }
        if index >= block.len {
            violation("array element index out of bounds");
        }
        let lock = block.lock.write();
        let base = block.get_target();
        WriteGuard {
            _lock: lock,
            value: unsafe { &mut *base.add(index) },
        }
    }

    /// Number of elements in the allocation (1 for single values, 0 for
    /// null handles).
    pub fn len(&self) -> usize {
        self.block().map(|b| b.len).unwrap_or(0)
    }

    /// Whether the handle is null or the allocation is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a weak handle sharing this handle's control block.
    ///
    /// Returns a null handle if this handle is null or already weak.
    pub fn make_weak(&self) -> Shared<T> {
        if self.is_weak.load(Ordering::Acquire) {
            return Shared::null();
        }
        let Some(ctrl) = NonNull::new(self.ctrl.load(Ordering::Acquire)) else {
            return Shared::null();
        };
        unsafe { ctrl.as_ref() }.add_weak();
        Shared::from_raw(ctrl, true)
    }

    /// Promote to a strong handle.
    ///
    /// A strong handle returns a copy of itself. A weak handle attempts the
    /// upgrade and returns a null handle if the managed object has already
    /// been destroyed.
    pub fn lock(&self) -> Shared<T> {
        if !self.is_weak.load(Ordering::Acquire) {
            return self.clone();
        }
        let Some(ctrl) = NonNull::new(self.ctrl.load(Ordering::Acquire)) else {
            return Shared::null();
        };
        if unsafe { ctrl.as_ref() }.try_add_strong() {
            SHARED_WEAK_UPGRADES.fetch_add(1, Ordering::Relaxed);
            Shared::from_raw(ctrl, false)
        } else {
            SHARED_WEAK_UPGRADE_FAILURES.fetch_add(1, Ordering::Relaxed);
            Shared::null()
        }
    }

    /// Whether the managed object has been destroyed (or the handle is
    /// null).
    pub fn expired(&self) -> bool {
        match self.block() {
            Some(block) => !block.is_alive(),
            None => true,
        }
    }

    /// Current strong count (0 for null handles).
    pub fn ref_count(&self) -> usize {
        self.block().map(|b| b.strong_count()).unwrap_or(0)
    }

    /// Current weak count (0 for null handles).
    pub fn weak_count(&self) -> usize {
        self.block().map(|b| b.weak_count()).unwrap_or(0)
    }

    /// Whether this is the only strong handle.
    pub fn unique(&self) -> bool {
        self.ref_count() == 1
    }

    /// Whether this handle is weak.
    pub fn is_weak(&self) -> bool {
        self.is_weak.load(Ordering::Acquire)
    }

    /// Whether the allocation is an element array.
    pub fn is_array(&self) -> bool {
        self.block().map(|b| b.is_array).unwrap_or(false)
    }

    /// Release this handle's unit and null it.
    pub fn reset(&self) {
        if let Some(ctrl) = NonNull::new(self.ctrl.swap(ptr::null_mut(), Ordering::AcqRel)) {
            let was_weak = self.is_weak.swap(false, Ordering::AcqRel);
            unsafe {
                if was_weak {
                    ControlBlock::release_weak(ctrl);
                } else {
                    ControlBlock::release_strong(ctrl);
                }
            }
        } else {
            self.is_weak.store(false, Ordering::Release);
        }
    }

    /// Replace the managed object with a freshly allocated `value`.
    pub fn reset_to(&self, value: T) -> Result<(), AllocError> {
        let fresh = make_shared(value)?;
        self.swap(&fresh);
        Ok(())
    }

    /// Exchange the contents of two handles.
    ///
    /// The two fields are exchanged independently; the pair is *not* one
    /// atomic operation. Callers that need an atomic multi-handle exchange
    /// must provide external synchronisation.
    pub fn swap(&self, other: &Shared<T>) {
        let my_ctrl = self.ctrl.swap(other.ctrl.load(Ordering::Acquire), Ordering::AcqRel);
        let my_weak = self
            .is_weak
            .swap(other.is_weak.load(Ordering::Acquire), Ordering::AcqRel);
        other.ctrl.store(my_ctrl, Ordering::Release);
        other.is_weak.store(my_weak, Ordering::Release);
    }
}

/// Exchange the contents of two handles. See [`Shared::swap`] for the
/// atomicity contract.
pub fn swap<T>(a: &Shared<T>, b: &Shared<T>) {
    a.swap(b);
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        let ctrl = self.ctrl.load(Ordering::Acquire);
        let weak = self.is_weak.load(Ordering::Acquire);
        if let Some(block) = unsafe { ctrl.as_ref() } {
            if weak {
                block.add_weak();
            } else {
                block.add_strong();
            }
        }
        Self {
            ctrl: AtomicPtr::new(ctrl),
            is_weak: AtomicBool::new(weak),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Shared<T> {
    fn default() -> Self {
        Shared::null()
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> PartialEq for Shared<T> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.get(), other.get())
    }
}

impl<T> Eq for Shared<T> {}

impl<T> PartialOrd for Shared<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Shared<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.get() as usize).cmp(&(other.get() as usize))
    }
}

impl<T> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("ptr", &self.get())
            .field("weak", &self.is_weak())
            .field("strong_count", &self.ref_count())
            .field("weak_count", &self.weak_count())
            .finish()
    }
}

// ============================================================================
// Factories
// ============================================================================

/// Allocate storage for one `T` and move `value` into it.
fn alloc_value<T>(value: T) -> Result<NonNull<T>, AllocError> {
    let layout = Layout::new::<T>();
    let target = if layout.size() == 0 {
        NonNull::<T>::dangling()
    } else {
        let raw = unsafe { alloc::alloc(layout) }.cast::<T>();
        NonNull::new(raw).ok_or(AllocError::OutOfMemory)?
    };
    unsafe { target.as_ptr().write(value) };
    Ok(target)
}

/// Destroy and free a payload allocated by [`alloc_value`].
unsafe fn release_value<T>(target: NonNull<T>) {
    ptr::drop_in_place(target.as_ptr());
    let layout = Layout::new::<T>();
    if layout.size() > 0 {
        alloc::dealloc(target.as_ptr().cast(), layout);
    }
}

/// Allocate a control block around an existing payload.
fn new_control_block<T>(
    target: *mut T,
    is_array: bool,
    len: usize,
) -> Result<NonNull<ControlBlock<T>>, AllocError> {
    let layout = Layout::new::<ControlBlock<T>>();
    let raw = unsafe { alloc::alloc(layout) }.cast::<ControlBlock<T>>();
    let Some(block) = NonNull::new(raw) else {
        return Err(AllocError::OutOfMemory);
    };
    unsafe { block.as_ptr().write(ControlBlock::new(target, is_array, len)) };
    SHARED_BLOCKS_CREATED.fetch_add(1, Ordering::Relaxed);
    Ok(block)
}

/// Allocate a shared object holding `value`.
///
/// Returns a strong handle with a strong count of one. If the control block
/// cannot be allocated, the payload is destroyed and the error propagates.
pub fn make_shared<T>(value: T) -> Result<Shared<T>, AllocError> {
    let payload = alloc_value(value)?;
    match new_control_block(payload.as_ptr(), false, 1) {
        Ok(block) => Ok(Shared::from_raw(block, false)),
        Err(err) => {
            unsafe { release_value(payload) };
            Err(err)
        }
    }
}

/// Reverse-destroys a partially constructed element array on unwind.
struct ElementsGuard<T> {
    base: *mut T,
    constructed: usize,
    layout: Option<Layout>,
}

impl<T> Drop for ElementsGuard<T> {
    fn drop(&mut self) {
        for i in (0..self.constructed).rev() {
            unsafe { ptr::drop_in_place(self.base.add(i)) };
        }
        if let Some(layout) = self.layout {
            unsafe { alloc::dealloc(self.base.cast(), layout) };
        }
    }
}

/// Allocate a shared array of `count` default-constructed elements.
///
/// Elements are destroyed in reverse construction order when the last
/// strong handle is released. A panicking element constructor destroys the
/// constructed prefix in reverse order and propagates.
pub fn make_shared_array<T: Default>(count: usize) -> Result<Shared<T>, AllocError> {
    let layout = Layout::array::<T>(count).map_err(|_| AllocError::ExtentOverflow)?;
    let base = if layout.size() == 0 {
        NonNull::<T>::dangling()
    } else {
        let raw = unsafe { alloc::alloc(layout) }.cast::<T>();
        NonNull::new(raw).ok_or(AllocError::OutOfMemory)?
    };

    let mut built = ElementsGuard {
        base: base.as_ptr(),
        constructed: 0,
        layout: (layout.size() > 0).then_some(layout),
    };
    for i in 0..count {
        unsafe { base.as_ptr().add(i).write(T::default()) };
        built.constructed = i + 1;
    }

    match new_control_block(base.as_ptr(), true, count) {
        Ok(block) => {
            mem::forget(built);
            Ok(Shared::from_raw(block, false))
        }
        Err(err) => Err(err),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    struct Probe {
        drops: Arc<AtomicUsize>,
    }

    impl Probe {
        fn new(drops: &Arc<AtomicUsize>) -> Self {
            Self {
                drops: Arc::clone(drops),
            }
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_make_shared_counts() {
        let s = make_shared(41u32).unwrap();
        assert_eq!(s.ref_count(), 1);
        assert_eq!(s.weak_count(), 0);
        assert!(s.unique());
        assert!(!s.is_weak());
        assert_eq!(*s.read(), 41);

        let s2 = s.clone();
        assert_eq!(s.ref_count(), 2);
        assert!(!s.unique());
        drop(s2);
        assert_eq!(s.ref_count(), 1);
    }

    #[test]
    fn test_object_destroyed_with_last_strong() {
        let drops = Arc::new(AtomicUsize::new(0));
        let s = make_shared(Probe::new(&drops)).unwrap();
        let s2 = s.clone();
        drop(s);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(s2);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_guard_mutates() {
        let s = make_shared(1u64).unwrap();
        *s.write() += 41;
        assert_eq!(*s.read(), 42);
    }

    #[test]
    fn test_weak_expiry() {
        let drops = Arc::new(AtomicUsize::new(0));
        let s = make_shared(Probe::new(&drops)).unwrap();
        let w = s.make_weak();
        assert!(w.is_weak());
        assert!(!w.expired());
        assert_eq!(s.weak_count(), 1);

        let upgraded = w.lock();
        assert!(!upgraded.is_null());
        assert_eq!(s.ref_count(), 2);
        drop(upgraded);

        drop(s);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(w.expired());
        assert!(w.lock().is_null());
    }

    #[test]
    fn test_weak_of_weak_is_null() {
        let s = make_shared(5u8).unwrap();
        let w = s.make_weak();
        assert!(w.make_weak().is_null());
        assert!(Shared::<u8>::null().make_weak().is_null());
    }

    #[test]
    fn test_weak_cycle_destroyed_deterministically() {
        struct WNode {
            prev: Shared<WNode>,
            _probe: Probe,
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let x = make_shared(WNode {
                prev: Shared::null(),
                _probe: Probe::new(&drops),
            })
            .unwrap();
            let y = make_shared(WNode {
                prev: Shared::null(),
                _probe: Probe::new(&drops),
            })
            .unwrap();
            x.write().prev = y.make_weak();
            y.write().prev = x.make_weak();
            assert_eq!(drops.load(Ordering::SeqCst), 0);
        }
        // Strong counts reached zero at scope exit: both objects destroyed
        // without any collector involvement.
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_array_elements_reverse_drop_order() {
        use parking_lot::Mutex;
        static ORDER: Mutex<Vec<i64>> = Mutex::new(Vec::new());

        #[derive(Default)]
        struct Tagged(i64);
        impl Drop for Tagged {
            fn drop(&mut self) {
                ORDER.lock().push(self.0);
            }
        }

        {
            let arr = make_shared_array::<Tagged>(5).unwrap();
            assert_eq!(arr.len(), 5);
            for i in 0..5 {
                arr.write_at(i).0 = (i as i64) * 10;
            }
            assert_eq!(arr.read_at(3).0, 30);
        }
        let order = ORDER.lock();
        assert_eq!(&*order, &[40, 30, 20, 10, 0]);
    }

    #[test]
    fn test_array_constructor_failure_rolls_back() {
        use std::cell::Cell;
        thread_local! {
            static BUILT: Cell<u32> = const { Cell::new(0) };
        }
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Explosive;
        impl Default for Explosive {
            fn default() -> Self {
                if BUILT.with(|b| {
                    let n = b.get();
                    b.set(n + 1);
                    n
                }) == 2
                {
                    panic!("element constructor failure");
                }
                Explosive
            }
        }
        impl Drop for Explosive {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let result = std::panic::catch_unwind(|| make_shared_array::<Explosive>(6));
        assert!(result.is_err());
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reset_and_reset_to() {
        let drops = Arc::new(AtomicUsize::new(0));
        let s = make_shared(Probe::new(&drops)).unwrap();
        s.reset();
        assert!(s.is_null());
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        let n = make_shared(1u32).unwrap();
        n.reset_to(2).unwrap();
        assert_eq!(*n.read(), 2);
    }

    #[test]
    fn test_swap_and_comparisons() {
        let a = make_shared(1u32).unwrap();
        let b = make_shared(2u32).unwrap();
        let a2 = a.clone();
        assert_eq!(a, a2);
        assert_ne!(a, b);

        let a_ptr = a.get();
        let b_ptr = b.get();
        a.swap(&b);
        assert_eq!(a.get(), b_ptr);
        assert_eq!(b.get(), a_ptr);

        let null = Shared::<u32>::null();
        assert_eq!(null.get(), ptr::null());
        assert!(null.expired());
    }

    #[test]
    fn test_weak_handles_keep_control_block_only() {
        let drops = Arc::new(AtomicUsize::new(0));
        let s = make_shared(Probe::new(&drops)).unwrap();
        let w1 = s.make_weak();
        let w2 = w1.clone();
        assert_eq!(s.weak_count(), 2);
        drop(s);
        // Object gone, control block retained by the weak handles.
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(w1.expired());
        assert_eq!(w1.ref_count(), 0);
        drop(w1);
        drop(w2);
    }

    #[test]
    fn test_concurrent_clone_and_drop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let s = make_shared(Probe::new(&drops)).unwrap();
        let mut workers = Vec::new();
        for _ in 0..8 {
            let handle = s.clone();
            workers.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let copy = handle.clone();
                    let weak = copy.make_weak();
                    assert!(!weak.expired());
                    let upgraded = weak.lock();
                    assert!(!upgraded.is_null());
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        drop(s);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_read_during_release() {
        let drops = Arc::new(AtomicUsize::new(0));
        let s = make_shared(Probe::new(&drops)).unwrap();
        let reader = {
            let handle = s.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    let guard = handle.read();
                    // The object is alive and not being destroyed while a
                    // read view exists.
                    let _ = &*guard;
                }
            })
        };
        drop(s);
        reader.join().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "cannot dereference a weak handle")]
    fn test_weak_dereference_panics() {
        let s = make_shared(0u8).unwrap();
        let w = s.make_weak();
        let _ = w.read();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "null handle dereferenced")]
    fn test_null_dereference_panics() {
        let null = Shared::<u8>::null();
        let _ = null.read();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "element access on a non-array handle")]
    fn test_index_on_scalar_panics() {
        let s = make_shared(0u8).unwrap();
        let _ = s.read_at(0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "array element index out of bounds")]
    fn test_index_out_of_bounds_panics() {
        let arr = make_shared_array::<u8>(3).unwrap();
        let _ = arr.read_at(3);
    }

    #[test]
    fn test_stats_advance() {
        let before = shared_stats();
        let s = make_shared(0u64).unwrap();
        let w = s.make_weak();
        drop(s);
        let _ = w.lock(); // failed upgrade
        drop(w);
        let after = shared_stats();
        assert!(after.blocks_created > before.blocks_created);
        assert!(after.blocks_destroyed > before.blocks_destroyed);
        assert!(after.weak_upgrade_failures > before.weak_upgrade_failures);
    }
}

//! Tracing Collector
//!
//! A mark-and-sweep garbage collector that reclaims arbitrarily cyclic
//! object graphs. Each managed object is a single contiguous block
//! `[GcHeader | payload]`; the header records the payload extent, a
//! type-erased destructor thunk, a root-reference count and the head of an
//! intrusive list of the handles embedded in the payload.
//!
//! ## Handles
//!
//! [`Gc<T>`] is the user-held reference. Every handle is classified by where
//! its *storage* lives:
//!
//! - **Root**: storage on the stack, in a static, or inside foreign-owned
//!   memory. A root handle pins its referent through the header's
//!   root-reference count.
//! - **Heap-embedded**: storage inside a managed object's payload. Embedded
//!   handles do not pin; they are linked into the owning header's intrusive
//!   list and traced during marking.
//!
//! Rust constructs values in temporary storage and moves them into place, so
//! a handle cannot always learn its final address at construction the way a
//! placement-constructed handle can. Classification is therefore resolved at
//! the first operation that needs it: a handle created *with* a referent
//! (clone, alias) pins as a root immediately, while a null handle stays
//! unclassified and inert until its first store, at which point its address
//! is tested against the in-progress allocation frames of the current thread
//! and then against the object registry. Fields that start null and are
//! wired after allocation — the ordinary way to build a graph — classify
//! exactly.
//!
//! ## Collection
//!
//! Collection runs automatically when a global allocation countdown expires,
//! once more at process exit, or on demand via [`collect_now`]. A cycle
//! seeds from every object with a positive root count, propagates marks
//! through the embedded-handle lists, detaches the unmarked tail of the
//! registry, and only then — with the collector lock released — runs the
//! destructor thunks, so destructors are free to allocate.

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{
    fence, AtomicBool, AtomicI64, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering,
};
use std::sync::Once;

use parking_lot::Mutex;

use crate::log::{self, LogLevel, Subsystem};

// ============================================================================
// Errors
// ============================================================================

/// Error returned when a managed allocation cannot be performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The underlying allocator returned null.
    OutOfMemory,
    /// The requested payload extent overflows the address space.
    ExtentOverflow,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "allocation failed: out of memory"),
            AllocError::ExtentOverflow => write!(f, "allocation failed: payload extent overflow"),
        }
    }
}

impl std::error::Error for AllocError {}

// ============================================================================
// Object Header
// ============================================================================

/// Per-allocation control record.
///
/// Lives immediately before the payload in the same block. The mark flag is
/// only read or written during a collection cycle, under the collector lock.
pub(crate) struct GcHeader {
    /// First byte of the payload.
    start: *mut u8,
    /// One-past-end of the payload.
    end: *mut u8,
    /// Destructor thunk over the payload byte range `[start, end)`.
    destructor: unsafe fn(*mut u8, *mut u8),
    /// Layout of the whole block, kept for deallocation.
    layout: Layout,
    /// Number of root handles currently referring to this object.
    root_refs: AtomicU32,
    /// Head of the intrusive list of handles embedded in the payload.
    first: AtomicPtr<HandleCore>,
    /// Mark flag for the current collection cycle.
    mark: AtomicBool,
}

impl GcHeader {
    fn new(
        start: *mut u8,
        end: *mut u8,
        destructor: unsafe fn(*mut u8, *mut u8),
        layout: Layout,
    ) -> Self {
        Self {
            start,
            end,
            destructor,
            layout,
            root_refs: AtomicU32::new(0),
            first: AtomicPtr::new(ptr::null_mut()),
            mark: AtomicBool::new(false),
        }
    }

    fn extent(&self) -> usize {
        self.end as usize - self.start as usize
    }
}

/// Destroy a single payload value.
unsafe fn drop_value<T>(start: *mut u8, _end: *mut u8) {
    ptr::drop_in_place(start.cast::<T>());
}

/// Destroy an array payload in reverse construction order.
unsafe fn drop_array<T>(start: *mut u8, end: *mut u8) {
    if mem::size_of::<T>() == 0 {
        return;
    }
    let base = start.cast::<T>();
    let len = (end as usize - start as usize) / mem::size_of::<T>();
    for i in (0..len).rev() {
        ptr::drop_in_place(base.add(i));
    }
}

// ============================================================================
// Root-Reference Counting
// ============================================================================

/// Increment a root count. Requires the collector lock only for the 0 -> 1
/// transition, which may race with a collection examining the object.
fn inc_root(header: &GcHeader) {
    let mut count = header.root_refs.load(Ordering::Acquire);
    while count != 0 {
        match header.root_refs.compare_exchange_weak(
            count,
            count + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return,
            Err(observed) => count = observed,
        }
    }
    let _reg = REGISTRY.lock();
    header.root_refs.fetch_add(1, Ordering::Relaxed);
}

/// Decrement a root count. Never needs the lock.
fn dec_root(header: &GcHeader) {
    header.root_refs.fetch_sub(1, Ordering::Relaxed);
}

// ============================================================================
// Handle Core
// ============================================================================

/// Storage classification of a handle, fixed once resolved.
const STATE_UNBOUND: u8 = 0;
const STATE_ROOT: u8 = 1;
const STATE_EMBEDDED: u8 = 2;

/// Type-erased part of a handle: classification, referent, and the link used
/// when the handle is embedded in a managed object.
pub(crate) struct HandleCore {
    state: AtomicU8,
    object: AtomicPtr<GcHeader>,
    next: AtomicPtr<HandleCore>,
}

impl HandleCore {
    const fn unbound() -> Self {
        Self {
            state: AtomicU8::new(STATE_UNBOUND),
            object: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

// ============================================================================
// Gc<T> Handle
// ============================================================================

/// A handle to a garbage-collected object.
///
/// Handles are cheap to clone; a clone pins the referent as a root until it
/// is dropped or re-targeted. Handles stored inside managed payloads are
/// traced by the collector instead of pinning, so cycles built through them
/// are reclaimed.
///
/// All mutation goes through `&self`: [`set`](Gc::set) and
/// [`clear`](Gc::clear) retarget the handle in place. Payload access through
/// [`get`](Gc::get) or `Deref` yields shared references only, which keeps
/// embedded handles at stable addresses for the lifetime of their object.
pub struct Gc<T> {
    core: HandleCore,
    /// Display pointer exposed by `get`/`Deref`. Decoupled from the tracked
    /// object so aliased and offset handles can present interior pointers.
    display: AtomicPtr<T>,
    _marker: PhantomData<*const T>,
}

// A handle hands out `&T` across threads and may drop the payload's roots on
// any thread, so both auto traits require `T: Send + Sync`.
unsafe impl<T: Send + Sync> Send for Gc<T> {}
unsafe impl<T: Send + Sync> Sync for Gc<T> {}

impl<T> Gc<T> {
    /// Create a null handle. Null handles are inert: they classify
    /// themselves at their first store.
    pub const fn null() -> Self {
        Self {
            core: HandleCore::unbound(),
            display: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Create a handle that pins `object` as a root. Used for every handle
    /// that is born with a referent: such a handle necessarily lives in
    /// temporary storage at that moment.
    fn adopt(object: *mut GcHeader, display: *mut T) -> Self {
        let handle = Self {
            core: HandleCore::unbound(),
            display: AtomicPtr::new(display),
            _marker: PhantomData,
        };
        if let Some(header) = NonNull::new(object) {
            handle.core.state.store(STATE_ROOT, Ordering::Relaxed);
            handle.core.object.store(object, Ordering::Relaxed);
            inc_root(unsafe { header.as_ref() });
        }
        handle
    }

    /// Create the root handle returned by a factory. The factory has already
    /// seeded the header's root count with this handle's unit.
    fn rooted(header: NonNull<GcHeader>, display: NonNull<T>) -> Self {
        let handle = Self {
            core: HandleCore::unbound(),
            display: AtomicPtr::new(display.as_ptr()),
            _marker: PhantomData,
        };
        handle.core.state.store(STATE_ROOT, Ordering::Relaxed);
        handle.core.object.store(header.as_ptr(), Ordering::Relaxed);
        handle
    }

    fn core_addr(&self) -> usize {
        &self.core as *const HandleCore as usize
    }

    fn core_ptr(&self) -> *mut HandleCore {
        &self.core as *const HandleCore as *mut HandleCore
    }

    /// Retarget this handle at `other`'s referent.
    pub fn set(&self, other: &Gc<T>) {
        self.set_raw(
            other.core.object.load(Ordering::Relaxed),
            other.display.load(Ordering::Relaxed),
        );
    }

    /// Null this handle. Root handles release their pin.
    pub fn clear(&self) {
        self.set_raw(ptr::null_mut(), ptr::null_mut());
    }

    fn set_raw(&self, new_object: *mut GcHeader, new_display: *mut T) {
        let old_object = self.core.object.load(Ordering::Relaxed);
        if old_object == new_object {
            // Same referent: bookkeeping is untouched, only the display
            // pointer may change.
            self.display.store(new_display, Ordering::Relaxed);
            return;
        }
        match self.core.state.load(Ordering::Acquire) {
            STATE_ROOT => {
                if let Some(old) = NonNull::new(old_object) {
                    dec_root(unsafe { old.as_ref() });
                }
                self.core.object.store(new_object, Ordering::Relaxed);
                self.display.store(new_display, Ordering::Relaxed);
                if let Some(new) = NonNull::new(new_object) {
                    inc_root(unsafe { new.as_ref() });
                }
            }
            STATE_EMBEDDED => {
                if new_object.is_null() {
                    self.core.object.store(ptr::null_mut(), Ordering::Relaxed);
                } else {
                    // Serialise the publication against marking. Mark flags
                    // are unaffected; the next cycle recomputes them.
                    let _reg = REGISTRY.lock();
                    self.core.object.store(new_object, Ordering::Relaxed);
                }
                self.display.store(new_display, Ordering::Relaxed);
            }
            _ => self.bind_first(new_object, new_display),
        }
    }

    /// First non-trivial operation on a null-constructed handle: decide the
    /// classification from the storage address, then perform the store.
    #[cold]
    fn bind_first(&self, new_object: *mut GcHeader, new_display: *mut T) {
        let addr = self.core_addr();
        let hint = frame_containing(addr);
        let reg = REGISTRY.lock();
        if self.core.state.load(Ordering::Acquire) != STATE_UNBOUND {
            // Another thread resolved the classification first.
            drop(reg);
            self.set_raw(new_object, new_display);
            return;
        }
        let owner = hint.or_else(|| reg.containing(addr));
        match owner {
            Some(owner) => {
                let owner = unsafe { owner.as_ref() };
                // Publish the referent before the handle becomes reachable
                // from the owner's list, so a concurrent marker never sees a
                // linked handle with an unpublished referent.
                self.core.object.store(new_object, Ordering::Relaxed);
                self.core
                    .next
                    .store(owner.first.load(Ordering::Relaxed), Ordering::Relaxed);
                fence(Ordering::Release);
                owner.first.store(self.core_ptr(), Ordering::Relaxed);
                self.core.state.store(STATE_EMBEDDED, Ordering::Release);
            }
            None => {
                self.core.object.store(new_object, Ordering::Relaxed);
                if let Some(new) = NonNull::new(new_object) {
                    // The collector lock is held, so the 0 -> 1 transition
                    // cannot race a cycle.
                    unsafe { new.as_ref() }.root_refs.fetch_add(1, Ordering::Relaxed);
                }
                self.core.state.store(STATE_ROOT, Ordering::Release);
            }
        }
        self.display.store(new_display, Ordering::Relaxed);
    }

    /// The exposed pointer. May be an interior pointer for aliased handles.
    pub fn as_ptr(&self) -> *const T {
        self.display.load(Ordering::Relaxed)
    }

    /// Shared access to the referent.
    ///
    /// The returned borrow is valid while the object stays reachable, which
    /// holds whenever this handle is reachable from a root for the duration
    /// of the borrow. A handle must not be concurrently re-targeted while it
    /// is being read.
    pub fn get(&self) -> Option<&T> {
        let p = self.display.load(Ordering::Relaxed);
        if p.is_null() {
            None
        } else {
            unsafe { Some(&*p) }
        }
    }

    /// Whether the handle is null.
    pub fn is_null(&self) -> bool {
        self.display.load(Ordering::Relaxed).is_null()
    }

    /// Shared access to one element of an array payload.
    ///
    /// Indexes from the payload start regardless of the display pointer.
    /// Returns `None` for null handles and out-of-range indexes.
    pub fn at(&self, index: usize) -> Option<&T> {
        if index >= self.array_len() {
            return None;
        }
        let header = NonNull::new(self.core.object.load(Ordering::Relaxed))?;
        let base = unsafe { header.as_ref() }.start.cast::<T>();
        unsafe { Some(&*base.add(index)) }
    }

    /// Number of `T` elements in the referenced payload (1 for single-value
    /// objects, 0 for null handles and zero-sized element types).
    pub fn array_len(&self) -> usize {
        let Some(header) = NonNull::new(self.core.object.load(Ordering::Relaxed)) else {
            return 0;
        };
        if mem::size_of::<T>() == 0 {
            return 0;
        }
        unsafe { header.as_ref() }.extent() / mem::size_of::<T>()
    }

    /// Create a handle that tracks the same object but exposes `display`.
    ///
    /// The display pointer has no independent lifetime contract.
    pub fn alias(&self, display: *mut T) -> Gc<T> {
        Gc::adopt(self.core.object.load(Ordering::Relaxed), display)
    }

    /// Pointer arithmetic over an array payload: a handle displaced by
    /// `count` elements, tracking the same object.
    pub fn offset(&self, count: isize) -> Gc<T> {
        let display = self.display.load(Ordering::Relaxed);
        let display = if display.is_null() {
            display
        } else {
            display.wrapping_offset(count)
        };
        Gc::adopt(self.core.object.load(Ordering::Relaxed), display)
    }

    /// Number of embedded handles currently linked to the referenced object.
    ///
    /// Diagnostic; takes the collector lock.
    pub fn embedded_count(&self) -> usize {
        let Some(header) = NonNull::new(self.core.object.load(Ordering::Relaxed)) else {
            return 0;
        };
        let _reg = REGISTRY.lock();
        let header = unsafe { header.as_ref() };
        let mut count = 0;
        let mut link = header.first.load(Ordering::Relaxed);
        while let Some(handle) = NonNull::new(link) {
            count += 1;
            link = unsafe { handle.as_ref() }.next.load(Ordering::Relaxed);
        }
        count
    }

    /// Current root-reference count of the referenced object. Diagnostic.
    pub fn root_count(&self) -> u32 {
        match NonNull::new(self.core.object.load(Ordering::Relaxed)) {
            Some(header) => unsafe { header.as_ref() }.root_refs.load(Ordering::Relaxed),
            None => 0,
        }
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        Gc::adopt(
            self.core.object.load(Ordering::Relaxed),
            self.display.load(Ordering::Relaxed),
        )
    }
}

impl<T> Default for Gc<T> {
    fn default() -> Self {
        Gc::null()
    }
}

impl<T> Drop for Gc<T> {
    fn drop(&mut self) {
        // Embedded handles need no unlink: their storage dies with the
        // enclosing object, and the list is only walked under the collector
        // lock, which excludes the sweep that frees it.
        if self.core.state.load(Ordering::Acquire) == STATE_ROOT {
            if let Some(header) = NonNull::new(self.core.object.load(Ordering::Relaxed)) {
                dec_root(unsafe { header.as_ref() });
            }
        }
    }
}

impl<T> Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => panic!("null garbage-collected handle dereferenced"),
        }
    }
}

impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.as_ptr(), other.as_ptr())
    }
}

impl<T> Eq for Gc<T> {}

impl<T> PartialOrd for Gc<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Gc<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.as_ptr() as usize).cmp(&(other.as_ptr() as usize))
    }
}

impl<T> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.core.state.load(Ordering::Relaxed) {
            STATE_ROOT => "root",
            STATE_EMBEDDED => "embedded",
            _ => "unbound",
        };
        f.debug_struct("Gc")
            .field("ptr", &self.as_ptr())
            .field("state", &state)
            .finish()
    }
}

// ============================================================================
// Allocation Frames
// ============================================================================

/// An in-progress allocation on the current thread.
#[derive(Clone, Copy)]
struct Frame {
    start: usize,
    end: usize,
    header: NonNull<GcHeader>,
}

thread_local! {
    /// Stack of in-progress allocations; payload constructors may allocate
    /// recursively. Restored on completion or failure.
    static ALLOC_FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Innermost in-progress allocation covering `addr` on this thread.
fn frame_containing(addr: usize) -> Option<NonNull<GcHeader>> {
    ALLOC_FRAMES.with(|frames| {
        frames
            .borrow()
            .iter()
            .rev()
            .find(|frame| frame.start <= addr && addr < frame.end)
            .map(|frame| frame.header)
    })
}

/// Pops its frame when dropped, including on unwind.
struct FrameGuard;

impl FrameGuard {
    fn push(start: usize, end: usize, header: NonNull<GcHeader>) -> Self {
        ALLOC_FRAMES.with(|frames| frames.borrow_mut().push(Frame { start, end, header }));
        FrameGuard
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        ALLOC_FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

// ============================================================================
// Object Registry
// ============================================================================

/// Global registry of live objects.
///
/// `objects` preserves insertion order for the stable partition of the
/// sweep; `by_addr` is the address index used to classify handle storage.
struct Registry {
    objects: Vec<NonNull<GcHeader>>,
    by_addr: std::collections::BTreeMap<usize, NonNull<GcHeader>>,
}

impl Registry {
    const fn new() -> Self {
        Self {
            objects: Vec::new(),
            by_addr: std::collections::BTreeMap::new(),
        }
    }

    fn insert(&mut self, header: NonNull<GcHeader>) {
        let start = unsafe { header.as_ref() }.start as usize;
        self.objects.push(header);
        self.by_addr.insert(start, header);
    }

    fn remove(&mut self, header: NonNull<GcHeader>) {
        let start = unsafe { header.as_ref() }.start as usize;
        self.by_addr.remove(&start);
        if let Some(pos) = self.objects.iter().rposition(|&h| h == header) {
            self.objects.remove(pos);
        }
    }

    /// The live object whose payload contains `addr`, if any.
    fn containing(&self, addr: usize) -> Option<NonNull<GcHeader>> {
        let (_, &header) = self.by_addr.range(..=addr).next_back()?;
        if addr < unsafe { header.as_ref() }.end as usize {
            Some(header)
        } else {
            None
        }
    }
}

// The registry only stores pointers to headers whose shared state is atomic.
unsafe impl Send for Registry {}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());

// ============================================================================
// Trigger Policy and Statistics
// ============================================================================

/// Allocation countdown to the next automatic collection.
static GC_COUNTDOWN: AtomicI64 = AtomicI64::new(1024);

/// Floor for the recalibrated countdown.
static GC_MIN_COUNTDOWN: AtomicI64 = AtomicI64::new(1024);

static GC_ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static GC_COLLECTIONS: AtomicU64 = AtomicU64::new(0);
static GC_OBJECTS_SWEPT: AtomicU64 = AtomicU64::new(0);

/// Snapshot of collector statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// Managed allocations performed.
    pub allocations: u64,
    /// Collection cycles run.
    pub collections: u64,
    /// Objects finalised and freed.
    pub objects_swept: u64,
    /// Objects currently registered.
    pub live_objects: usize,
}

/// Get a snapshot of collector statistics.
pub fn gc_stats() -> GcStats {
    GcStats {
        allocations: GC_ALLOCATIONS.load(Ordering::Relaxed),
        collections: GC_COLLECTIONS.load(Ordering::Relaxed),
        objects_swept: GC_OBJECTS_SWEPT.load(Ordering::Relaxed),
        live_objects: REGISTRY.lock().objects.len(),
    }
}

/// Number of objects currently registered.
pub fn live_object_count() -> usize {
    REGISTRY.lock().objects.len()
}

/// Set the collector trigger thresholds. Applied by
/// [`config::install`](crate::config::install).
pub(crate) fn set_collect_thresholds(initial: i64, min: i64) {
    GC_MIN_COUNTDOWN.store(min, Ordering::Relaxed);
    GC_COUNTDOWN.store(initial, Ordering::Relaxed);
}

fn recalibrate(live: usize) {
    let floor = GC_MIN_COUNTDOWN.load(Ordering::Relaxed);
    GC_COUNTDOWN.store((live as i64 * 2).max(floor), Ordering::Relaxed);
}

/// Final collection at process exit.
extern "C" fn final_collect_at_exit() {
    collect_now();
}

static EXIT_HOOK: Once = Once::new();

fn ensure_exit_hook() {
    EXIT_HOOK.call_once(|| unsafe {
        libc::atexit(final_collect_at_exit);
    });
}

/// Decrement the countdown; when it expires, run a cycle before the
/// enclosing allocation is committed.
fn maybe_collect() {
    ensure_exit_hook();
    if GC_COUNTDOWN.fetch_sub(1, Ordering::Relaxed) <= 0 {
        collect_now();
    }
}

// ============================================================================
// Collection
// ============================================================================

/// Push the referents of every handle embedded in `header`'s payload.
fn push_referents(header: &GcHeader, pending: &mut Vec<NonNull<GcHeader>>) {
    let mut link = header.first.load(Ordering::Relaxed);
    while let Some(handle) = NonNull::new(link) {
        let handle = unsafe { handle.as_ref() };
        if let Some(target) = NonNull::new(handle.object.load(Ordering::Relaxed)) {
            pending.push(target);
        }
        link = handle.next.load(Ordering::Relaxed);
    }
}

/// Run a full collection cycle.
///
/// Mark, propagation and the registry partition run under the collector
/// lock; finalisation runs after it is released so destructors may allocate
/// (and even trigger a nested collection) without deadlocking.
pub fn collect_now() {
    let garbage: Vec<NonNull<GcHeader>> = {
        let mut reg = REGISTRY.lock();

        // Seed from the root set.
        let mut pending: Vec<NonNull<GcHeader>> = Vec::with_capacity(reg.objects.len() / 4 + 1);
        for &obj in &reg.objects {
            let header = unsafe { obj.as_ref() };
            if header.root_refs.load(Ordering::Relaxed) != 0 {
                header.mark.store(true, Ordering::Relaxed);
                // Pair with the release fence of handle publication: the
                // list head observed below includes every linked handle.
                fence(Ordering::Acquire);
                push_referents(header, &mut pending);
            } else {
                header.mark.store(false, Ordering::Relaxed);
            }
        }

        // Propagate marks.
        while let Some(obj) = pending.pop() {
            let header = unsafe { obj.as_ref() };
            if header.mark.load(Ordering::Relaxed) {
                continue;
            }
            header.mark.store(true, Ordering::Relaxed);
            fence(Ordering::Acquire);
            push_referents(header, &mut pending);
        }

        // Partition: live objects keep their order, garbage is detached.
        let mut live = Vec::with_capacity(reg.objects.len());
        let mut garbage = Vec::new();
        for obj in mem::take(&mut reg.objects) {
            if unsafe { obj.as_ref() }.mark.load(Ordering::Relaxed) {
                live.push(obj);
            } else {
                garbage.push(obj);
            }
        }
        reg.objects = live;
        for &obj in &garbage {
            reg.by_addr.remove(&(unsafe { obj.as_ref() }.start as usize));
        }

        recalibrate(reg.objects.len());
        garbage
    };

    GC_COLLECTIONS.fetch_add(1, Ordering::Relaxed);
    if garbage.is_empty() {
        return;
    }

    // Finalise on the detached list. A destructor that allocates re-enters
    // the collector through a fresh cycle; the garbage here is already
    // invisible to it.
    for &obj in &garbage {
        let header = unsafe { obj.as_ref() };
        unsafe { (header.destructor)(header.start, header.end) };
    }
    GC_OBJECTS_SWEPT.fetch_add(garbage.len() as u64, Ordering::Relaxed);

    if log::enabled(LogLevel::Debug) {
        log::event(LogLevel::Debug, Subsystem::Collector, "cycle complete")
            .count("swept", garbage.len() as u64)
            .count("live", live_object_count() as u64)
            .emit();
    }

    // Free the raw storage. Re-acquiring the lock here is an allocator
    // serialisation hint only; correctness does not depend on it.
    let _reg = REGISTRY.lock();
    for obj in garbage {
        let (block, layout) = {
            let header = unsafe { obj.as_ref() };
            (obj.as_ptr().cast::<u8>(), header.layout)
        };
        unsafe { alloc::dealloc(block, layout) };
    }
}

// ============================================================================
// Typed Factories
// ============================================================================

/// Allocate one `[GcHeader | payload]` block aligned for both parts.
fn allocate_block<T>(count: usize) -> Result<(NonNull<GcHeader>, NonNull<T>, Layout), AllocError> {
    let payload = Layout::array::<T>(count).map_err(|_| AllocError::ExtentOverflow)?;
    let (layout, offset) = Layout::new::<GcHeader>()
        .extend(payload)
        .map_err(|_| AllocError::ExtentOverflow)?;
    let layout = layout.pad_to_align();
    let raw = unsafe { alloc::alloc(layout) };
    let Some(block) = NonNull::new(raw) else {
        return Err(AllocError::OutOfMemory);
    };
    let header = block.cast::<GcHeader>();
    let payload = unsafe { NonNull::new_unchecked(raw.add(offset).cast::<T>()) };
    Ok((header, payload, layout))
}

/// Detaches the header and frees the block on unwind; disarmed on success.
struct RegistrationGuard {
    header: NonNull<GcHeader>,
    layout: Layout,
    armed: bool,
}

impl RegistrationGuard {
    fn new(header: NonNull<GcHeader>, layout: Layout) -> Self {
        Self {
            header,
            layout,
            armed: true,
        }
    }

    fn commit(&mut self) {
        self.armed = false;
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if self.armed {
            REGISTRY.lock().remove(self.header);
            unsafe { alloc::dealloc(self.header.as_ptr().cast(), self.layout) };
        }
    }
}

/// Reverse-destroys a partially constructed element prefix on unwind.
struct PartialGuard<T> {
    base: *mut T,
    constructed: usize,
}

impl<T> Drop for PartialGuard<T> {
    fn drop(&mut self) {
        for i in (0..self.constructed).rev() {
            unsafe { ptr::drop_in_place(self.base.add(i)) };
        }
    }
}

/// Write the header and append it to the registry, with the creating root
/// handle's unit already counted.
fn register_block(
    header: NonNull<GcHeader>,
    start: *mut u8,
    end: *mut u8,
    destructor: unsafe fn(*mut u8, *mut u8),
    layout: Layout,
) {
    let mut reg = REGISTRY.lock();
    unsafe {
        header.as_ptr().write(GcHeader::new(start, end, destructor, layout));
        header.as_ref().root_refs.store(1, Ordering::Relaxed);
    }
    reg.insert(header);
}

/// Allocate a managed object holding `value`.
///
/// Returns a root handle owning one root reference on the new object.
pub fn new_value<T: Send + 'static>(value: T) -> Result<Gc<T>, AllocError> {
    new_value_with(move || value)
}

/// Allocate a managed object whose payload is produced by `init`.
///
/// `init` runs with the allocation frame pushed, so it may allocate further
/// managed objects. If it panics, the block is detached from the registry
/// and freed, and the panic propagates; nothing leaks.
pub fn new_value_with<T, F>(init: F) -> Result<Gc<T>, AllocError>
where
    T: Send + 'static,
    F: FnOnce() -> T,
{
    maybe_collect();
    let (header, payload, layout) = allocate_block::<T>(1)?;
    let start = payload.as_ptr().cast::<u8>();
    let end = unsafe { start.add(mem::size_of::<T>()) };
    register_block(header, start, end, drop_value::<T>, layout);

    let mut registration = RegistrationGuard::new(header, layout);
    let _frame = FrameGuard::push(start as usize, end as usize, header);
    let value = init();
    unsafe { payload.as_ptr().write(value) };
    registration.commit();

    GC_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    Ok(Gc::rooted(header, payload))
}

/// Allocate a managed array of `count` default-constructed elements.
///
/// Elements are destroyed in reverse construction order when the object is
/// swept. If an element constructor panics, the constructed prefix is
/// destroyed in reverse order and the allocation is rolled back.
pub fn new_array<T>(count: usize) -> Result<Gc<T>, AllocError>
where
    T: Default + Send + 'static,
{
    maybe_collect();
    let (header, payload, layout) = allocate_block::<T>(count.max(1))?;
    let start = payload.as_ptr().cast::<u8>();
    let end = unsafe { start.add(mem::size_of::<T>() * count) };
    register_block(header, start, end, drop_array::<T>, layout);

    let mut registration = RegistrationGuard::new(header, layout);
    let _frame = FrameGuard::push(start as usize, end as usize, header);
    let mut built = PartialGuard {
        base: payload.as_ptr(),
        constructed: 0,
    };
    for i in 0..count {
        unsafe { payload.as_ptr().add(i).write(T::default()) };
        built.constructed = i + 1;
    }
    mem::forget(built);
    registration.commit();

    GC_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    Ok(Gc::rooted(header, payload))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Flags its drop so tests can observe finalisation without touching
    /// global registry counts (other tests allocate concurrently).
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

    struct Node {
        next: Gc<Node>,
        _probe: Probe,
    }

    #[test]
    fn test_root_handle_pins_object() {
        let drops = Arc::new(AtomicUsize::new(0));
        let value = new_value(Probe::new(&drops)).unwrap();
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(value);
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clone_pins_after_original_dropped() {
        let drops = Arc::new(AtomicUsize::new(0));
        let value = new_value(Probe::new(&drops)).unwrap();
        let copy = value.clone();
        drop(value);
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(copy);
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_two_node_cycle_reclaimed() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let a = new_value_with(|| Node {
                next: Gc::null(),
                _probe: Probe::new(&drops),
            })
            .unwrap();
            let b = new_value_with(|| Node {
                next: Gc::null(),
                _probe: Probe::new(&drops),
            })
            .unwrap();
            a.next.set(&b);
            b.next.set(&a);
            collect_now();
            assert_eq!(drops.load(Ordering::SeqCst), 0);
        }
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_self_cycle_reclaimed() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let a = new_value_with(|| Node {
                next: Gc::null(),
                _probe: Probe::new(&drops),
            })
            .unwrap();
            a.next.set(&a);
        }
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_chain_survives_through_embedded_edges() {
        let drops = Arc::new(AtomicUsize::new(0));
        let head = new_value_with(|| Node {
            next: Gc::null(),
            _probe: Probe::new(&drops),
        })
        .unwrap();
        {
            let tail = new_value_with(|| Node {
                next: Gc::null(),
                _probe: Probe::new(&drops),
            })
            .unwrap();
            head.next.set(&tail);
        }
        // The tail's only root is gone; it survives through the edge.
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        head.next.clear();
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(head);
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_embedded_handle_registration() {
        struct Wide {
            a: Gc<Wide>,
            b: Gc<Wide>,
            c: Gc<Wide>,
        }

        let target = new_value_with(|| Wide {
            a: Gc::null(),
            b: Gc::null(),
            c: Gc::null(),
        })
        .unwrap();
        let holder = new_value_with(|| Wide {
            a: Gc::null(),
            b: Gc::null(),
            c: Gc::null(),
        })
        .unwrap();
        assert_eq!(holder.embedded_count(), 0);
        holder.a.set(&target);
        holder.b.set(&target);
        assert_eq!(holder.embedded_count(), 2);
        // Re-targeting an already linked handle does not relink it.
        holder.a.set(&holder);
        assert_eq!(holder.embedded_count(), 2);
        holder.c.set(&target);
        assert_eq!(holder.embedded_count(), 3);
    }

    #[test]
    fn test_root_promotion_from_static_slot() {
        static SLOT: Gc<u64> = Gc::null();

        let drops = Arc::new(AtomicUsize::new(0));
        let probe = new_value(Probe::new(&drops)).unwrap();
        // A static slot is outside every managed payload: it pins.
        let value = new_value(7u64).unwrap();
        SLOT.set(&value);
        drop(value);
        collect_now();
        assert_eq!(*SLOT.get().unwrap(), 7);
        SLOT.clear();
        drop(probe);
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_array_elements_dropped_on_sweep() {
        // Sized: zero-sized element types have no traced extent.
        #[derive(Default)]
        struct Counted {
            _tag: u8,
        }
        static LIVE: AtomicI64 = AtomicI64::new(0);

        impl Counted {
            fn touch(&self) {
                LIVE.fetch_add(1, Ordering::SeqCst);
            }
        }
        impl Drop for Counted {
            fn drop(&mut self) {
                LIVE.fetch_sub(1, Ordering::SeqCst);
            }
        }

        let array = new_array::<Counted>(5).unwrap();
        assert_eq!(array.array_len(), 5);
        for i in 0..5 {
            array.at(i).unwrap().touch();
        }
        assert!(array.at(5).is_none());
        drop(array);
        collect_now();
        assert_eq!(LIVE.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_array_constructor_failure_rolls_back() {
        thread_local! {
            static BUILT: RefCell<u32> = const { RefCell::new(0) };
        }
        static PARTIAL_DROPS: AtomicU64 = AtomicU64::new(0);

        struct Explosive;
        impl Default for Explosive {
            fn default() -> Self {
                BUILT.with(|b| {
                    let mut b = b.borrow_mut();
                    if *b == 3 {
                        panic!("constructor failure");
                    }
                    *b += 1;
                });
                Explosive
            }
        }
        impl Drop for Explosive {
            fn drop(&mut self) {
                PARTIAL_DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let result = std::panic::catch_unwind(|| new_array::<Explosive>(8));
        assert!(result.is_err());
        // The three constructed elements were destroyed during rollback.
        assert_eq!(PARTIAL_DROPS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_destructor_may_allocate() {
        struct Spawner {
            drops: Arc<AtomicUsize>,
        }
        impl Drop for Spawner {
            fn drop(&mut self) {
                // Re-entrant allocation during finalisation must not
                // deadlock: the collector lock is released by then.
                let child = new_value(Probe::new(&self.drops)).unwrap();
                drop(child);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let spawner = new_value_with(|| Spawner {
            drops: Arc::clone(&drops),
        })
        .unwrap();
        drop(spawner);
        collect_now();
        // The spawned child is garbage for the next cycle.
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_collect_idempotent() {
        let drops = Arc::new(AtomicUsize::new(0));
        let value = new_value(Probe::new(&drops)).unwrap();
        collect_now();
        collect_now();
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(value);
        collect_now();
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_null_roundtrip_restores_reachability() {
        let drops = Arc::new(AtomicUsize::new(0));
        let keeper = new_value_with(|| Node {
            next: Gc::null(),
            _probe: Probe::new(&drops),
        })
        .unwrap();
        let target = new_value_with(|| Node {
            next: Gc::null(),
            _probe: Probe::new(&drops),
        })
        .unwrap();
        keeper.next.set(&target);
        keeper.next.clear();
        keeper.next.set(&target);
        drop(target);
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(keeper);
        collect_now();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_alias_and_offset_display() {
        let array = new_array::<u32>(4).unwrap();
        let second = array.offset(1);
        assert_eq!(second.as_ptr() as usize - array.as_ptr() as usize, 4);
        assert_eq!(second.array_len(), 4);

        let alias = array.alias(std::ptr::null_mut());
        assert!(alias.is_null());
        // The alias still pins the array.
        assert!(alias.root_count() >= 1);
    }

    #[test]
    fn test_handle_comparisons() {
        let a = new_value(1u8).unwrap();
        let b = new_value(2u8).unwrap();
        let a2 = a.clone();
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert!(Gc::<u8>::null().is_null());
        assert_eq!(Gc::<u8>::null(), Gc::<u8>::null());
        let mut pair = [a.clone(), b.clone()];
        pair.sort();
        assert!(pair[0].as_ptr() <= pair[1].as_ptr());
    }

    #[test]
    fn test_stats_advance() {
        let before = gc_stats();
        let value = new_value(0u128).unwrap();
        collect_now();
        drop(value);
        collect_now();
        let after = gc_stats();
        assert!(after.allocations > before.allocations);
        assert!(after.collections >= before.collections + 2);
    }
}

//! End-to-end lifecycle scenarios exercising both managed subsystems
//! through the public API.
//!
//! Assertions observe per-object drop counters rather than global registry
//! counts so the scenarios stay valid under the parallel test harness.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use marrow::{collect_now, make_shared, make_shared_array, new_value, new_value_with, Gc, Shared};

/// Bumps a counter when dropped.
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

fn new_node(drops: &Arc<AtomicUsize>) -> Gc<Node> {
    let drops = Arc::clone(drops);
    new_value_with(move || Node {
        next: Gc::null(),
        _probe: Probe::new(&drops),
    })
    .expect("node allocation")
}

/// Scenario: a two-node cycle is reclaimed once both roots are gone.
#[test]
fn two_node_cycle_reclaimed() {
    let drops = Arc::new(AtomicUsize::new(0));
    {
        let a = new_node(&drops);
        let b = new_node(&drops);
        a.next.set(&b);
        b.next.set(&a);
    }
    // Root counts dropped to zero at scope exit; the next collection
    // destroys both nodes exactly once.
    collect_now();
    assert_eq!(drops.load(Ordering::SeqCst), 2);
    collect_now();
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

/// Scenario: an orphan survives while a static root slot holds it and dies
/// once the slot is cleared.
#[test]
fn root_promotion_of_orphan() {
    static SLOT: Gc<Node> = Gc::null();

    let drops = Arc::new(AtomicUsize::new(0));
    {
        let a = new_node(&drops);
        SLOT.set(&a);
    }
    collect_now();
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    SLOT.clear();
    collect_now();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

/// Scenario: a strong/weak cycle needs no collector; the managed objects
/// die with their strong counts and the control blocks with the weak ones.
#[test]
fn strong_weak_cycle() {
    struct RcNode {
        prev: Shared<RcNode>,
        _probe: Probe,
    }

    let drops = Arc::new(AtomicUsize::new(0));
    {
        let x = make_shared(RcNode {
            prev: Shared::null(),
            _probe: Probe::new(&drops),
        })
        .expect("allocation");
        let y = make_shared(RcNode {
            prev: Shared::null(),
            _probe: Probe::new(&drops),
        })
        .expect("allocation");
        x.write().prev = y.make_weak();
        y.write().prev = x.make_weak();
        assert_eq!(x.weak_count(), 1);
        assert_eq!(y.weak_count(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

/// Scenario: array elements are destroyed in reverse construction order
/// when the last handle dies.
#[test]
fn array_allocation_and_destruction_order() {
    use parking_lot::Mutex;
    static ORDER: Mutex<Vec<i64>> = Mutex::new(Vec::new());

    #[derive(Default)]
    struct Slot(i64);
    impl Drop for Slot {
        fn drop(&mut self) {
            ORDER.lock().push(self.0);
        }
    }

    {
        let array = make_shared_array::<Slot>(5).expect("allocation");
        for i in 0..5 {
            array.write_at(i).0 = (i as i64) * 10;
        }
        assert_eq!(array.ref_count(), 1);
    }
    assert_eq!(&*ORDER.lock(), &[40, 30, 20, 10, 0]);
}

/// Scenario: a weak handle expires when the last strong handle dies.
#[test]
fn weak_expiry() {
    let drops = Arc::new(AtomicUsize::new(0));
    let s = make_shared(Probe::new(&drops)).expect("allocation");
    let w = s.make_weak();
    assert!(!w.expired());
    drop(s);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(w.lock().is_null());
    assert!(w.expired());
}

/// Scenario: a finaliser that allocates does not deadlock the collector,
/// and its allocation is registered before the cycle finishes.
#[test]
fn reentrant_allocation_in_finaliser() {
    struct Spawner {
        drops: Arc<AtomicUsize>,
        spawned: Arc<AtomicUsize>,
    }

    impl Drop for Spawner {
        fn drop(&mut self) {
            let child = new_value(Probe::new(&self.drops)).expect("allocation in finaliser");
            assert!(!child.is_null());
            self.spawned.fetch_add(1, Ordering::SeqCst);
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));
    let spawned = Arc::new(AtomicUsize::new(0));
    {
        let _victim = new_value_with(|| Spawner {
            drops: Arc::clone(&drops),
            spawned: Arc::clone(&spawned),
        })
        .expect("allocation");
    }
    collect_now();
    assert_eq!(spawned.load(Ordering::SeqCst), 1);
    // The child lost its only root inside the finaliser; a later cycle
    // reclaims it.
    collect_now();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

/// Handles of both kinds interoperate inside one record.
#[test]
fn mixed_record_fields() {
    struct Mixed {
        traced: Gc<Mixed>,
        counted: Shared<u64>,
        _probe: Probe,
    }

    let drops = Arc::new(AtomicUsize::new(0));
    let shared = make_shared(77u64).expect("allocation");
    {
        let record = new_value_with(|| Mixed {
            traced: Gc::null(),
            counted: Shared::null(),
            _probe: Probe::new(&drops),
        })
        .expect("allocation");
        record.counted.swap(&shared.clone());
        record.traced.set(&record);
        assert_eq!(shared.ref_count(), 2);
    }
    collect_now();
    // The record (a self-cycle) is gone and released its shared unit.
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(shared.ref_count(), 1);
    assert_eq!(*shared.read(), 77);
}

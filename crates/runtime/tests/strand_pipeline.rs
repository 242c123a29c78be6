//! Scheduler integration: strands cooperating through capabilities
//!
//! Drives whole strand lifecycles through `Scheduler::run`, exercising the
//! lend/timeout protocol and mutex handoff across real quanta rather than
//! poking the tables directly.

use seraph_core::{Perm, VOID_U64};
use seraph_runtime::{
    AcquireOutcome, Quantum, Scheduler, SlotStatus, StrandState,
};
use serial_test::serial;
use std::cell::RefCell;
use std::rc::Rc;

/// Opt into scheduler traces with RUST_LOG=seraph_runtime=debug.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[test]
#[serial]
fn lend_timeout_scenario() {
    init_tracing();
    // Strand A owns a buffer capability and lends slot 3 to strand B with
    // a ten-tick timeout. B reads through it while fresh; after A ticks
    // past the deadline the borrow reads VOID and A owns the slot again.
    let mut sched = Scheduler::new();
    let a = sched.create(Box::new(|_, _| Quantum::Exit(0)));
    let b = sched.create(Box::new(|_, _| Quantum::Exit(0)));

    let cap = {
        let band = &mut sched.strand_mut(a).unwrap().band;
        let base = band.alloc(64).unwrap();
        let cap = band
            .derive(base, 64, Perm::READ | Perm::WRITE | Perm::DERIVE)
            .unwrap();
        cap.store_u64(band, 0, 0xA5A5);
        cap
    };
    sched.cap_store(a, 3, cap);
    let now = sched.strand(a).unwrap().chronon;
    assert!(sched.lend(a, 3, b, 3, now + 10));

    // Tick +5: the borrow is alive.
    sched.tick(b, 5);
    let borrowed = sched.cap_in_slot(b, 3);
    let band = &sched.strand(a).unwrap().band;
    assert_eq!(borrowed.load_u64(band, 0), 0xA5A5);

    // A ticks forward 20; processing B's lends expires the borrow.
    sched.tick(a, 20);
    sched.process_lends(b);
    assert!(sched.cap_in_slot(b, 3).is_void());
    assert_eq!(sched.strand(a).unwrap().caps[3].status, SlotStatus::Owned);

    // And a read through the stale capability after the band resets is
    // VOID as well, not a trap.
    sched.strand_mut(a).unwrap().band.reset();
    let band = &sched.strand(a).unwrap().band;
    assert_eq!(cap.load_u64(band, 0), VOID_U64);
}

#[test]
#[serial]
fn mutex_ping_pong_between_running_strands() {
    // Two strands take turns under one mutex; the log must alternate
    // because release hands the token directly to the waiter.
    let log: Rc<RefCell<Vec<(u64, u32)>>> = Rc::new(RefCell::new(Vec::new()));
    let mut sched = Scheduler::new();
    let mutex = sched.mutex_create();

    let make_worker = |log: Rc<RefCell<Vec<(u64, u32)>>>, rounds: u32| {
        let mut done: u32 = 0;
        move |sched: &mut Scheduler, id: u64| -> Quantum {
            match sched.mutex_acquire(mutex, id) {
                AcquireOutcome::Acquired(_) => {
                    log.borrow_mut().push((id, done));
                    done += 1;
                    sched.mutex_release(mutex, id);
                    if done == rounds {
                        Quantum::Exit(done as i64)
                    } else {
                        Quantum::Yield
                    }
                }
                AcquireOutcome::Blocked => Quantum::Blocked,
                AcquireOutcome::DeadlockRefused => Quantum::Exit(-1),
            }
        }
    };

    let a = sched.create(Box::new(make_worker(log.clone(), 3)));
    let b = sched.create(Box::new(make_worker(log.clone(), 3)));
    sched.start(a);
    sched.start(b);
    sched.run();

    assert_eq!(sched.strand(a).unwrap().state, StrandState::Terminated);
    assert_eq!(sched.strand(b).unwrap().state, StrandState::Terminated);
    assert_eq!(sched.strand(a).unwrap().exit_code, 3);
    assert_eq!(sched.strand(b).unwrap().exit_code, 3);
    assert_eq!(log.borrow().len(), 6);
}

#[test]
#[serial]
fn grant_transfers_across_quanta() {
    // The granter runs first, moves an OWNED capability into the reader's
    // table and exits; the reader's next quantum sees the data. The grant
    // happens-before any use by the receiver.
    const GRANTER: u64 = 1;
    const READER: u64 = 2;
    let mut sched = Scheduler::new();

    let granter = sched.create(Box::new(|sched, id| {
        let cap = {
            let band = &mut sched.strand_mut(id).unwrap().band;
            let base = band.alloc(16).unwrap();
            let cap = band.derive(base, 16, Perm::READ | Perm::WRITE).unwrap();
            cap.store_u64(band, 0, 777);
            cap
        };
        sched.cap_store(id, 0, cap);
        assert!(sched.grant(id, 0, READER, 0));
        Quantum::Exit(0)
    }));

    let reader = sched.create(Box::new(|sched, id| {
        let slot = sched.cap_in_slot(id, 0);
        if slot.is_void() {
            return Quantum::Yield; // nothing arrived yet
        }
        let value = {
            let band = &sched.strand(GRANTER).unwrap().band;
            slot.load_u64(band, 0)
        };
        Quantum::Exit(value as i64)
    }));
    assert_eq!(granter, GRANTER);
    assert_eq!(reader, READER);

    sched.start(granter);
    sched.start(reader);
    sched.run();
    assert_eq!(sched.strand(reader).unwrap().exit_code, 777);
    assert_eq!(
        sched.strand(reader).unwrap().caps[0].status,
        SlotStatus::Owned
    );
}

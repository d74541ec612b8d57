//! Integration tests: racing release triggers on one handle.
//!
//! Managed close and owner teardown are fired from different threads in
//! randomized orders. The resource must be released exactly once and
//! neither call site may fail.

use dualstate_core::sim::SimNative;
use dualstate_core::{ContextId, DualHandle, Key, OwnerId, ReleaseCause};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_concurrent_release_exactly_once() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let key = Key::mint();

    for round in 0..200u64 {
        let sim = SimNative::new();
        let owner = OwnerId(round);
        let resource = sim.park(ContextId(round), b"contended");
        let handle = DualHandle::new(&key, &sim.env(), owner, ContextId(round), resource, ());

        let barrier = Arc::new(Barrier::new(2));
        let managed_spins: u32 = rng.gen_range(0..64);
        let native_spins: u32 = rng.gen_range(0..64);

        let managed = {
            let handle = handle.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..managed_spins {
                    std::hint::spin_loop();
                }
                handle.release_managed()
            })
        };
        let native = {
            let sim = Arc::clone(&sim);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..native_spins {
                    std::hint::spin_loop();
                }
                sim.release_owner(owner);
            })
        };

        let managed_won = managed.join().unwrap();
        native.join().unwrap();

        assert_eq!(sim.release_count(resource), 1, "round {round}");
        let expected = if managed_won {
            ReleaseCause::ManagedClose
        } else {
            ReleaseCause::OwnerReleased
        };
        assert_eq!(handle.released_by(), Some(expected), "round {round}");
        assert!(handle.assert_valid().is_err());
    }
}

#[test]
fn test_sequential_orders_all_release_once() {
    let key = Key::mint();
    let orders: [&[u8]; 4] = [b"mo", b"om", b"mmo", b"oom"];

    for order in orders {
        let sim = SimNative::new();
        let resource = sim.park(ContextId(1), b"x");
        let handle = DualHandle::new(&key, &sim.env(), OwnerId(1), ContextId(1), resource, ());
        for step in order {
            match step {
                b'm' => {
                    handle.release_managed();
                }
                _ => sim.release_owner(OwnerId(1)),
            }
        }
        assert_eq!(sim.release_count(resource), 1);
    }
}

#[test]
fn test_many_handles_one_owner() {
    let key = Key::mint();
    let sim = SimNative::new();
    let handles: Vec<_> = (0..16)
        .map(|i| {
            let resource = sim.park(ContextId(i), b"batch");
            (
                DualHandle::new(&key, &sim.env(), OwnerId(42), ContextId(i), resource, ()),
                resource,
            )
        })
        .collect();

    handles[3].0.release_managed();
    sim.release_owner(OwnerId(42));

    for (i, (handle, resource)) in handles.iter().enumerate() {
        assert_eq!(sim.release_count(*resource), 1);
        let expected = if i == 3 {
            ReleaseCause::ManagedClose
        } else {
            ReleaseCause::OwnerReleased
        };
        assert_eq!(handle.released_by(), Some(expected));
    }
}

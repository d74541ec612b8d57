//! Integration tests: owner teardown racing managed-side stream use.

use std::io::Write;
use std::sync::{Arc, Barrier};
use std::thread;

use dualstate_core::sim::{SimEvent, SimNative};
use dualstate_core::{ContextId, Key, OwnerId, ReleaseCause, SnapshotId};
use dualstate_stream::{Placement, StreamReader, StreamWriter};
use dualstate_verify::{AcceptAll, PoolConfig, Verifier, WorkerPool};

fn pool() -> WorkerPool {
    WorkerPool::new(PoolConfig {
        thread_name_prefix: "teardown".to_string(),
        keep_alive_ms: 100,
        stack_size: None,
    })
}

#[test]
fn test_writer_racing_owner_release_never_hangs() {
    let key = Key::mint();
    let pool = pool();

    for round in 0..50u64 {
        let sim = SimNative::with_region_limit(7);
        let owner = OwnerId(round);
        let (resource, region) = sim.allocate(ContextId(round), 7);
        let mut writer = StreamWriter::new(&key, &sim.env(), Placement::new(owner, ContextId(round), resource), region);
        writer.set_verifier(Verifier::with_pool(AcceptAll, pool.clone())).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let teardown = {
            let sim = Arc::clone(&sim);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                sim.release_owner(owner);
            })
        };

        barrier.wait();
        // Either side may win; neither may deadlock or release twice.
        for _ in 0..20 {
            if writer.write_all(b"0123456789").is_err() {
                break;
            }
        }
        let _ = writer.free();
        teardown.join().unwrap();

        assert_eq!(sim.release_count(resource), 1, "round {round}");
    }
}

#[test]
fn test_snapshot_unregistered_before_owner_finalizes() {
    let key = Key::mint();
    let sim = SimNative::new();
    let resource = sim.park(ContextId(5), b"parked value");
    let reader = StreamReader::parked(
        &key,
        &sim.env(),
        Placement::new(OwnerId(5), ContextId(5), resource),
        12,
        Some(SnapshotId(99)),
    );

    sim.release_owner(OwnerId(5));

    let events = sim.events();
    let unregistered = events
        .iter()
        .position(|e| *e == SimEvent::SnapshotUnregistered { snapshot: SnapshotId(99), owner: OwnerId(5) })
        .unwrap();
    let finalized = events
        .iter()
        .position(|e| *e == SimEvent::OwnerFinalized(OwnerId(5)))
        .unwrap();
    assert!(unregistered < finalized);
    assert_eq!(reader.handle().released_by(), Some(ReleaseCause::OwnerReleased));
    assert!(reader.buffer().is_err());
}

#[test]
fn test_close_does_not_hold_lock_while_waiting() {
    let key = Key::mint();
    let sim = SimNative::with_region_limit(4);
    let (resource, region) = sim.allocate(ContextId(1), 4);
    let mut writer = StreamWriter::new(&key, &sim.env(), Placement::new(OwnerId(1), ContextId(1), resource), region);

    // The routine inspects the writer's handle while the writer is closing.
    let handle = writer.handle();
    let routine = move |input: &mut dyn dualstate_verify::MarkRead| -> Result<(), dualstate_verify::VerifyError> {
        let mut sink = Vec::new();
        std::io::Read::read_to_end(input, &mut sink)?;
        handle.assert_valid().map_err(|e| dualstate_verify::VerifyError::Unexpected(e.to_string()))?;
        Ok(())
    };
    writer.set_verifier(Verifier::with_pool(routine, pool())).unwrap();
    writer.write_all(b"abcdefghij").unwrap();
    writer.close().unwrap();
    writer.free().unwrap();
    assert_eq!(sim.release_count(resource), 1);
}

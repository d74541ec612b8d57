//! The no-op verifier must never touch the worker pool.
//!
//! Kept in its own test binary so nothing else in the process can have
//! created the global pool first.

use dualstate_verify::{Verifier, VerifierState, WorkerPool};

#[test]
fn test_noop_never_starts_a_worker() {
    let v = Verifier::NoOp;

    // Any order, any number of times.
    for _ in 0..3 {
        assert_eq!(v.finish(), Ok(()));
        assert_eq!(v.update(b"ignored".as_slice().into()), Ok(()));
        v.cancel();
        assert_eq!(v.schedule(), Ok(()));
        assert_eq!(v.end_of_input(), Ok(()));
        assert_eq!(v.update(b"after end".as_slice().into()), Ok(()));
    }

    assert!(v.is_noop());
    assert_eq!(v.state(), VerifierState::Succeeded);
    assert!(Verifier::default().is_noop());
    assert!(WorkerPool::try_global().is_none());
}

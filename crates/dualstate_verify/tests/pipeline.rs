//! Integration tests: verifiers driven the way a writer drives them.

use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dualstate_verify::{
    AcceptAll, MarkRead, PoolConfig, Range, Verifier, VerifierState, VerifyError, WorkerPool,
};

fn pool() -> WorkerPool {
    WorkerPool::new(PoolConfig::from_toml_str("thread_name_prefix = \"it\"\nkeep_alive_ms = 200").unwrap())
}

/// Accepts a sequence of length-prefixed records, rewinding over each
/// header once so the mark/reset path is exercised.
fn records(input: &mut dyn MarkRead) -> Result<(), VerifyError> {
    let mut header = [0u8; 1];
    loop {
        input.mark(1);
        if input.read(&mut header)? == 0 {
            return Ok(());
        }
        input.reset()?;
        input.read_exact(&mut header)?;
        let mut body = vec![0u8; usize::from(header[0])];
        input
            .read_exact(&mut body)
            .map_err(|_| VerifyError::rejected("truncated record"))?;
        if body.iter().any(|b| !b.is_ascii_alphabetic()) {
            return Err(VerifyError::rejected("record is not alphabetic"));
        }
    }
}

fn chop(bytes: &[u8], size: usize) -> Vec<Range> {
    bytes.chunks(size).map(Range::from).collect()
}

#[test]
fn test_records_split_across_ranges() {
    let content = b"\x03abc\x05hello\x00\x02ok";
    for size in 1..=content.len() {
        let v = Verifier::with_pool(records, pool());
        v.schedule().unwrap();
        for range in chop(content, size) {
            v.update(range).unwrap();
        }
        v.end_of_input().unwrap();
        assert_eq!(v.finish(), Ok(()), "range size {size}");
    }
}

#[test]
fn test_concatenation_preserves_order() {
    let content: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let expected = content.clone();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let v = Verifier::with_pool(
        move |input: &mut dyn MarkRead| -> Result<(), VerifyError> {
            let mut all = Vec::new();
            input.read_to_end(&mut all)?;
            *sink.lock() = all;
            Ok(())
        },
        pool(),
    );
    v.schedule().unwrap();
    for range in chop(&content, 333) {
        v.update(range).unwrap();
    }
    v.end_of_input().unwrap();
    v.finish().unwrap();
    assert_eq!(*seen.lock(), expected);
}

#[test]
fn test_bad_record_rejected() {
    let v = Verifier::with_pool(records, pool());
    v.schedule().unwrap();
    v.update(b"\x02a1".as_slice().into()).unwrap();
    v.end_of_input().unwrap();
    assert_eq!(v.finish(), Err(VerifyError::rejected("record is not alphabetic")));
}

#[test]
fn test_failure_surfaces_on_later_update() {
    let v = Verifier::with_pool(records, pool());
    v.schedule().unwrap();
    v.update(b"\x01!".as_slice().into()).unwrap();

    // The record is complete, so the routine fails without more input.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while v.state() == VerifierState::Running && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(v.state(), VerifierState::Failed);
    assert_eq!(
        v.update(b"\x01a".as_slice().into()),
        Err(VerifyError::rejected("record is not alphabetic"))
    );
}

#[test]
fn test_cancelled_verifier_does_not_leak_its_worker() {
    let pool = pool();
    let v = Verifier::with_pool(AcceptAll, pool.clone());
    v.schedule().unwrap();
    v.update(b"never finished".as_slice().into()).unwrap();
    v.cancel();
    assert!(matches!(v.finish(), Err(VerifyError::Cancelled(_))));

    // The worker went back to the pool and eventually retires.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while pool.stats().live_threads > 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(pool.stats().live_threads, 0);
}

#[test]
fn test_dropped_verifier_releases_its_worker() {
    let pool = pool();
    {
        let v = Verifier::with_pool(AcceptAll, pool.clone());
        v.schedule().unwrap();
        v.update(b"abandoned".as_slice().into()).unwrap();
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while pool.stats().live_threads > 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(pool.stats().live_threads, 0);
}

#[test]
fn test_each_active_verifier_gets_its_own_thread() {
    let pool = pool();
    let verifiers: Vec<_> = (0..4).map(|_| Verifier::with_pool(AcceptAll, pool.clone())).collect();
    for v in &verifiers {
        v.schedule().unwrap();
    }
    assert!(pool.stats().threads_spawned >= 4);
    for v in &verifiers {
        v.end_of_input().unwrap();
        v.finish().unwrap();
    }
}

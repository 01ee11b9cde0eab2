//! Completion Bridge Tests
//!
//! Tests verify:
//! - Worker polling runs only what was queued before the poll
//! - Completion flags are set once
//! - Drive loops return results, propagate errors and honour the budget
//! - A stopped worker is reported instead of spinning

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use blobvfs::bridge::{Bridge, Completion, Worker};
use blobvfs::VfsError;

// =============================================================================
// Worker Tests
// =============================================================================

#[test]
fn test_new_worker_is_idle() {
    let worker = Worker::new("idle");

    assert_eq!(worker.name(), "idle");
    assert_eq!(worker.pending(), 0);
    assert_eq!(worker.poll(), 0);
    assert!(!worker.is_stopped());
}

#[test]
fn test_messages_run_only_when_polled() {
    let worker = Worker::new("w");
    let counter = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&counter);
    worker
        .send_msg(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(worker.pending(), 1);

    assert_eq!(worker.poll(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(worker.executed(), 1);
}

#[test]
fn test_poll_defers_messages_sent_during_poll() {
    let worker = Worker::new("w");
    let counter = Arc::new(AtomicUsize::new(0));

    let inner_worker = Arc::clone(&worker);
    let c = Arc::clone(&counter);
    worker
        .send_msg(Box::new(move || {
            let c2 = Arc::clone(&c);
            inner_worker
                .send_msg(Box::new(move || {
                    c2.fetch_add(10, Ordering::SeqCst);
                }))
                .unwrap();
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    assert_eq!(worker.poll(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    assert_eq!(worker.poll(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 11);
}

#[test]
fn test_stopped_worker_rejects_and_drops_messages() {
    let worker = Worker::new("w");
    let counter = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&counter);
    worker
        .send_msg(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    worker.stop();
    assert!(worker.is_stopped());
    assert_eq!(worker.pending(), 0);
    assert_eq!(worker.poll(), 0);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    let result = worker.send_msg(Box::new(|| {}));
    assert!(matches!(result, Err(VfsError::WorkerStopped { .. })));
}

// =============================================================================
// Completion Tests
// =============================================================================

#[test]
fn test_completion_starts_unset() {
    let completion: Completion<u32> = Completion::new();

    assert!(!completion.is_done());
    assert_eq!(completion.take(), None);
}

#[test]
fn test_completion_is_set_once() {
    let completion = Completion::new();
    let other = completion.clone();

    assert!(other.complete(1));
    assert!(!other.complete(2));

    assert!(completion.is_done());
    assert_eq!(completion.take(), Some(1));
    assert!(completion.is_done());
}

// =============================================================================
// Drive Tests
// =============================================================================

#[test]
fn test_drive_returns_value_set_by_callback() {
    let worker = Worker::new("w");
    let bridge = Bridge::default();
    let completion = Completion::new();
    let done = completion.clone();

    let value = bridge
        .drive(&worker, "answer", move || {
            done.complete(Ok(42u32));
        }, &completion)
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(worker.executed(), 1);
}

#[test]
fn test_drive_waits_for_chained_completion() {
    let worker = Worker::new("w");
    let bridge = Bridge::new(10);
    let completion = Completion::new();
    let done = completion.clone();
    let inner = Arc::clone(&worker);

    let value = bridge
        .drive(&worker, "chain", move || {
            inner
                .send_msg(Box::new(move || {
                    done.complete(Ok("second hop"));
                }))
                .unwrap();
        }, &completion)
        .unwrap();

    assert_eq!(value, "second hop");
    assert_eq!(worker.executed(), 2);
}

#[test]
fn test_drive_propagates_operation_error() {
    let worker = Worker::new("w");
    let bridge = Bridge::default();
    let completion: Completion<blobvfs::Result<()>> = Completion::new();
    let done = completion.clone();

    let result = bridge.drive(&worker, "failing", move || {
        done.complete(Err(VfsError::Config("boom".into())));
    }, &completion);

    assert!(matches!(result, Err(VfsError::Config(_))));
}

#[test]
fn test_drive_times_out_after_budget() {
    let worker = Worker::new("w");
    let bridge = Bridge::new(25);
    let completion: Completion<blobvfs::Result<()>> = Completion::new();

    let result = bridge.drive(&worker, "never", || {}, &completion);

    match result {
        Err(VfsError::Timeout { operation, attempts }) => {
            assert_eq!(operation, "never");
            assert_eq!(attempts, 25);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(libc::ETIMEDOUT, VfsError::Timeout { operation: "x", attempts: 1 }.errno());
}

#[test]
fn test_zero_budget_still_polls_once() {
    let bridge = Bridge::new(0);
    assert_eq!(bridge.budget(), 1);

    let worker = Worker::new("w");
    let completion = Completion::new();
    let done = completion.clone();
    let result = bridge.drive(&worker, "once", move || {
        done.complete(Ok(()));
    }, &completion);

    assert!(result.is_ok());
}

#[test]
fn test_drive_on_stopped_worker_fails_fast() {
    let worker = Worker::new("w");
    worker.stop();
    let completion: Completion<blobvfs::Result<()>> = Completion::new();

    let result = Bridge::default().drive(&worker, "late", || {}, &completion);

    assert!(matches!(result, Err(VfsError::WorkerStopped { operation: "late" })));
}

#[test]
fn test_worker_stopped_mid_operation() {
    let worker = Worker::new("w");
    let stopper = Arc::clone(&worker);
    let completion: Completion<blobvfs::Result<()>> = Completion::new();

    let result = Bridge::default().drive(&worker, "abandoned", move || stopper.stop(), &completion);

    assert!(matches!(result, Err(VfsError::WorkerStopped { .. })));
    assert_eq!(worker.executed(), 1);
}

// Unit tests for the per-route concurrency limiter.
//
// UNIT UNDER TEST: server::limiter::RouteLimiter
//
// BUSINESS RESPONSIBILITY:
//   - At most max_concurrent permits held at any instant
//   - Bounded FIFO wait queue with per-entry timeout and abort skipping
//   - Idempotent release

use crate::server::limiter::RouteLimiter;
use std::time::Duration;

#[tokio::test]
async fn test_grants_immediately_under_capacity() {
    let limiter = RouteLimiter::new(Some(2), 4, Duration::from_millis(100));
    let _a = limiter.acquire().await.unwrap();
    let _b = limiter.acquire().await.unwrap();
    assert_eq!(limiter.active(), 2);
}

#[tokio::test]
async fn test_full_queue_is_server_busy() {
    let limiter = RouteLimiter::new(Some(1), 0, Duration::from_millis(100));
    let _held = limiter.acquire().await.unwrap();
    let err = limiter.acquire().await.unwrap_err();
    assert_eq!(err.code(), "server_busy");
}

#[tokio::test]
async fn test_queued_waiter_times_out() {
    let limiter = RouteLimiter::new(Some(1), 2, Duration::from_millis(30));
    let _held = limiter.acquire().await.unwrap();
    let err = limiter.acquire().await.unwrap_err();
    assert_eq!(err.code(), "queue_timeout");
}

#[tokio::test]
async fn test_release_hands_slot_to_oldest_waiter() {
    let limiter = RouteLimiter::new(Some(1), 4, Duration::from_millis(500));
    let held = limiter.acquire().await.unwrap();

    let first = tokio::spawn({
        let limiter = limiter.clone();
        async move { limiter.acquire().await.map(|permit| (1, permit)) }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = tokio::spawn({
        let limiter = limiter.clone();
        async move { limiter.acquire().await.map(|permit| (2, permit)) }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    held.release();
    let (winner, permit) = first.await.unwrap().unwrap();
    assert_eq!(winner, 1, "FIFO order");
    assert_eq!(limiter.active(), 1);

    permit.release();
    let (next, _permit) = second.await.unwrap().unwrap();
    assert_eq!(next, 2);
}

#[tokio::test]
async fn test_canceled_waiter_is_skipped_at_dequeue() {
    let limiter = RouteLimiter::new(Some(1), 4, Duration::from_millis(500));
    let held = limiter.acquire().await.unwrap();

    // A waiter whose future is dropped before the slot frees.
    let aborted = tokio::spawn({
        let limiter = limiter.clone();
        async move { limiter.acquire().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    aborted.abort();
    let _ = aborted.await;

    let survivor = tokio::spawn({
        let limiter = limiter.clone();
        async move { limiter.acquire().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    held.release();
    assert!(survivor.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let limiter = RouteLimiter::new(Some(2), 4, Duration::from_millis(100));
    let a = limiter.acquire().await.unwrap();
    let _b = limiter.acquire().await.unwrap();

    a.release();
    a.release();
    a.release();

    // One release freed exactly one slot.
    assert_eq!(limiter.active(), 1);
}

#[tokio::test]
async fn test_unlimited_when_no_max() {
    let limiter = RouteLimiter::new(None, 0, Duration::from_millis(10));
    let mut permits = Vec::new();
    for _ in 0..64 {
        permits.push(limiter.acquire().await.unwrap());
    }
    assert_eq!(limiter.active(), 64);
}

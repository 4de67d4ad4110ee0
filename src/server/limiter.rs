//! Per-route concurrency limiting with a bounded FIFO wait queue.
//!
//! `max_concurrent` permits are live at any instant; excess requests queue
//! up to `max_queue_size` deep, each with its own timer and implicit abort
//! (a dropped waiter is skipped at dequeue). Release is idempotent and
//! hands the freed slot to the oldest surviving waiter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::error::{CoordResult, CoordinatorError};
use crate::logging::log_debug;

#[derive(Debug)]
struct Waiter {
    grant: oneshot::Sender<()>,
}

#[derive(Debug)]
struct LimiterState {
    active: usize,
    queue: VecDeque<Waiter>,
}

/// A concurrency limiter for one route family.
#[derive(Debug)]
pub struct RouteLimiter {
    /// `None` means unlimited (a non-finite configured max).
    max_concurrent: Option<usize>,
    max_queue_size: usize,
    queue_timeout: Duration,
    state: Mutex<LimiterState>,
}

impl RouteLimiter {
    pub fn new(
        max_concurrent: Option<usize>,
        max_queue_size: usize,
        queue_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            max_concurrent,
            max_queue_size,
            queue_timeout,
            state: Mutex::new(LimiterState {
                active: 0,
                queue: VecDeque::new(),
            }),
        })
    }

    /// Acquire a permit: immediately when capacity allows, else by queueing.
    ///
    /// Fails with `server_busy` when the queue is full and `queue_timeout`
    /// when the wait expires. Dropping the returned future while queued
    /// cancels the wait; the dead entry is skipped at dequeue.
    pub async fn acquire(self: &Arc<Self>) -> CoordResult<Permit> {
        let receiver = {
            let mut state = self.state.lock().expect("limiter poisoned");
            let Some(max) = self.max_concurrent else {
                state.active += 1;
                return Ok(Permit::new(self.clone()));
            };
            if state.active < max {
                state.active += 1;
                return Ok(Permit::new(self.clone()));
            }

            // Dead waiters (aborted clients) should not count against the
            // queue bound.
            state.queue.retain(|w| !w.grant.is_closed());
            if state.queue.len() >= self.max_queue_size {
                return Err(CoordinatorError::ServerBusy);
            }
            let (grant, receiver) = oneshot::channel();
            state.queue.push_back(Waiter { grant });
            receiver
        };

        let started = Instant::now();
        match tokio::time::timeout(self.queue_timeout, receiver).await {
            // The releaser already counted us active.
            Ok(Ok(())) => Ok(Permit::new(self.clone())),
            Ok(Err(_)) => Err(CoordinatorError::Internal(anyhow::anyhow!(
                "limiter dropped while waiting"
            ))),
            Err(_) => Err(CoordinatorError::queue_timeout(
                started.elapsed().as_millis() as u64,
            )),
        }
    }

    /// Currently held permits (for tests and introspection).
    pub fn active(&self) -> usize {
        self.state.lock().expect("limiter poisoned").active
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("limiter poisoned");
        state.active = state.active.saturating_sub(1);
        // FIFO handoff, skipping canceled waiters.
        while let Some(waiter) = state.queue.pop_front() {
            if waiter.grant.send(()).is_ok() {
                state.active += 1;
                break;
            }
            log_debug!("Skipping canceled limiter waiter");
        }
    }
}

/// A held capacity slot; released on drop. Multiple releases of one permit
/// have the same effect as one.
#[derive(Debug)]
pub struct Permit {
    limiter: Arc<RouteLimiter>,
    released: AtomicBool,
}

impl Permit {
    fn new(limiter: Arc<RouteLimiter>) -> Self {
        Self {
            limiter,
            released: AtomicBool::new(false),
        }
    }

    /// Release explicitly (idempotent).
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.limiter.release();
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}

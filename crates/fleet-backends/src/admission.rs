//! Per-backend admission queue.
//!
//! A bounded binary heap ordered by (priority, enqueue sequence) in front of
//! a fixed number of concurrency slots. Callers wait on a oneshot channel
//! until the dispatcher hands them a [`SlotGuard`]; dropping the guard frees
//! the slot and triggers the next dispatch pass.

use fleet_core::{BackendId, FleetError, FleetResult, Priority};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// What `enqueue` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Return `OverCapacity` immediately. Preferred by interactive callers.
    FailFast,
    /// Wait for room until the deadline. Preferred by batch callers.
    #[default]
    Block,
}

/// Counters for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub queued: usize,
    pub active: usize,
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub dispatched: u64,
    pub expired: u64,
    pub rejected: u64,
    pub paused: bool,
}

struct QueuedRequest {
    request_id: Uuid,
    priority: Priority,
    seq: u64,
    deadline: Instant,
    grant: oneshot::Sender<SlotGuard>,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    /// Max-heap order: lower priority value first, then earlier enqueue.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedRequest>,
    active: usize,
    next_seq: u64,
    paused: bool,
    dispatched: u64,
    expired: u64,
    rejected: u64,
}

struct QueueInner {
    backend: BackendId,
    max_concurrent: usize,
    max_queue: usize,
    state: Mutex<QueueState>,
    space: Notify,
}

impl QueueInner {
    fn dispatch(self: &Arc<Self>) {
        let mut grants = Vec::new();
        let mut popped = false;
        {
            let mut state = self.state.lock();
            if state.paused {
                return;
            }
            let now = Instant::now();
            while state.active < self.max_concurrent {
                let Some(entry) = state.heap.pop() else {
                    break;
                };
                popped = true;
                if entry.deadline <= now || entry.grant.is_closed() {
                    state.expired += 1;
                    debug!(
                        backend = %self.backend,
                        request_id = %entry.request_id,
                        "Dropping expired queued request"
                    );
                    continue;
                }
                state.active += 1;
                state.dispatched += 1;
                grants.push(entry);
            }
        }
        if popped {
            self.space.notify_waiters();
        }
        for entry in grants {
            let guard = SlotGuard {
                inner: Arc::clone(self),
            };
            // A caller that gave up returns the guard, which frees the slot.
            if let Err(guard) = entry.grant.send(guard) {
                drop(guard);
            }
        }
    }

    fn release(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.dispatch();
    }
}

/// One occupied concurrency slot.
pub struct SlotGuard {
    inner: Arc<QueueInner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        QueueInner::release(&self.inner);
    }
}

/// Bounded, priority-ordered dispatcher for one backend.
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<QueueInner>,
}

impl AdmissionQueue {
    /// Queue with `max_concurrent` slots (at least one) and room for `max_queue` waiters.
    pub fn new(backend: BackendId, max_concurrent: usize, max_queue: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                backend,
                max_concurrent: max_concurrent.max(1),
                max_queue,
                state: Mutex::new(QueueState::default()),
                space: Notify::new(),
            }),
        }
    }

    /// Backend this queue fronts.
    pub fn backend(&self) -> BackendId {
        self.inner.backend
    }

    /// Queues `work` and runs it once a slot is granted.
    ///
    /// The deadline covers both the wait and the work. A request still
    /// queued at its deadline fails with `OverCapacity` (the backend was
    /// never contacted); work running past it fails with `Timeout`.
    pub async fn enqueue<F, Fut, T>(
        &self,
        priority: Priority,
        deadline: Duration,
        policy: OverflowPolicy,
        work: F,
    ) -> FleetResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        let deadline_at = Instant::now() + deadline;
        let rx = self.admit(priority, deadline_at, policy).await?;
        self.inner.dispatch();

        let slot = match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline_at), rx)
            .await
        {
            Ok(Ok(slot)) => slot,
            Ok(Err(_)) | Err(_) => {
                return Err(FleetError::OverCapacity {
                    backend: self.inner.backend,
                })
            }
        };

        let remaining = deadline_at.saturating_duration_since(Instant::now());
        let result = match tokio::time::timeout(remaining, work()).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::Timeout {
                backend: self.inner.backend,
                after: deadline,
            }),
        };
        drop(slot);
        result
    }

    async fn admit(
        &self,
        priority: Priority,
        deadline_at: Instant,
        policy: OverflowPolicy,
    ) -> FleetResult<oneshot::Receiver<SlotGuard>> {
        loop {
            let notified = self.inner.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.heap.len() >= self.inner.max_queue {
                    let now = Instant::now();
                    let before = state.heap.len();
                    state
                        .heap
                        .retain(|e| e.deadline > now && !e.grant.is_closed());
                    state.expired += (before - state.heap.len()) as u64;
                }
                if state.heap.len() < self.inner.max_queue {
                    let (tx, rx) = oneshot::channel();
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.heap.push(QueuedRequest {
                        request_id: Uuid::new_v4(),
                        priority,
                        seq,
                        deadline: deadline_at,
                        grant: tx,
                    });
                    return Ok(rx);
                }
                if policy == OverflowPolicy::FailFast {
                    state.rejected += 1;
                    warn!(backend = %self.inner.backend, %priority, "Admission queue full, rejecting");
                    return Err(FleetError::OverCapacity {
                        backend: self.inner.backend,
                    });
                }
            }

            let woke = tokio::time::timeout_at(tokio::time::Instant::from_std(deadline_at), notified)
                .await
                .is_ok();
            if !woke {
                self.inner.state.lock().rejected += 1;
                warn!(backend = %self.inner.backend, %priority, "Admission queue stayed full until deadline");
                return Err(FleetError::OverCapacity {
                    backend: self.inner.backend,
                });
            }
        }
    }

    /// Holds dispatch; queued requests wait (and may expire) until resumed.
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    /// Restarts dispatch after [`Self::pause`].
    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        self.inner.dispatch();
    }

    /// Current counters.
    pub fn stats(&self) -> AdmissionStats {
        let state = self.inner.state.lock();
        AdmissionStats {
            queued: state.heap.len(),
            active: state.active,
            max_concurrent: self.inner.max_concurrent,
            max_queue: self.inner.max_queue,
            dispatched: state.dispatched,
            expired: state.expired,
            rejected: state.rejected,
            paused: state.paused,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    // ── Test 1: priority then enqueue order ──

    #[tokio::test]
    async fn test_dispatch_order_by_priority_then_fifo() {
        // One slot, so every grant is observable in order.
        let queue = AdmissionQueue::new(BackendId::Fast, 1, 10);
        queue.pause();

        let started = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let mut finish = Vec::new();
        let mut handles = Vec::new();
        for (label, rank) in [("a", 1u8), ("b", 3), ("c", 1), ("d", 2), ("e", 3)] {
            let (tx, rx) = oneshot::channel::<()>();
            finish.push((label, tx));
            let task_queue = queue.clone();
            let started = started.clone();
            handles.push(tokio::spawn(async move {
                task_queue
                    .enqueue(
                        Priority::from_rank(rank),
                        Duration::from_secs(10),
                        OverflowPolicy::Block,
                        || async move {
                            started.lock().push(label);
                            let _ = rx.await;
                            Ok::<_, FleetError>(label)
                        },
                    )
                    .await
            }));
            // Enqueue order must follow the loop order.
            let expected = handles.len();
            let q = queue.clone();
            wait_until(move || q.stats().queued == expected).await;
        }

        queue.resume();
        let s = started.clone();
        wait_until(move || s.lock().len() == 1).await;
        assert_eq!(*started.lock(), vec!["a"]);
        assert_eq!(queue.stats().active, 1);

        let mut senders: std::collections::HashMap<_, _> = finish.into_iter().collect();
        let mut expected_len = 1;
        for finished in ["a", "c", "d", "b"] {
            senders.remove(finished).unwrap().send(()).unwrap();
            expected_len += 1;
            let s = started.clone();
            wait_until(move || s.lock().len() == expected_len).await;
        }
        assert_eq!(*started.lock(), vec!["a", "c", "d", "b", "e"]);
        for (_, tx) in senders {
            let _ = tx.send(());
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let stats = queue.stats();
        assert_eq!(stats.dispatched, 5);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.queued, 0);
    }

    // ── Test 2: concurrency bound ──

    #[tokio::test]
    async fn test_never_exceeds_max_concurrent() {
        let queue = AdmissionQueue::new(BackendId::Batch, 3, 100);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let queue = queue.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(Priority::Medium, Duration::from_secs(10), OverflowPolicy::Block, || async {
                        let now = in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                        peak.fetch_max(now, AtomicOrdering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
                        Ok::<_, FleetError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(AtomicOrdering::SeqCst) <= 3);
        assert_eq!(queue.stats().dispatched, 20);
    }

    // ── Test 3: full queue with fail-fast ──

    #[tokio::test]
    async fn test_fail_fast_when_full() {
        let queue = AdmissionQueue::new(BackendId::Fast, 1, 1);
        queue.pause();

        let q = queue.clone();
        let waiting = tokio::spawn(async move {
            q.enqueue(Priority::Low, Duration::from_secs(5), OverflowPolicy::Block, || async {
                Ok::<_, FleetError>(1)
            })
            .await
        });
        let q = queue.clone();
        wait_until(move || q.stats().queued == 1).await;

        let err = queue
            .enqueue(Priority::High, Duration::from_secs(5), OverflowPolicy::FailFast, || async {
                Ok::<_, FleetError>(2)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::OverCapacity { backend: BackendId::Fast }));
        assert_eq!(queue.stats().rejected, 1);

        queue.resume();
        assert_eq!(waiting.await.unwrap().unwrap(), 1);
    }

    // ── Test 4: blocking caller gets room when it frees up ──

    #[tokio::test]
    async fn test_block_waits_for_room() {
        let queue = AdmissionQueue::new(BackendId::Fast, 1, 1);
        queue.pause();

        let q = queue.clone();
        let first = tokio::spawn(async move {
            q.enqueue(Priority::Low, Duration::from_secs(5), OverflowPolicy::Block, || async {
                Ok::<_, FleetError>("first")
            })
            .await
        });
        let q = queue.clone();
        wait_until(move || q.stats().queued == 1).await;

        let q = queue.clone();
        let second = tokio::spawn(async move {
            q.enqueue(Priority::High, Duration::from_secs(5), OverflowPolicy::Block, || async {
                Ok::<_, FleetError>("second")
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.stats().queued, 1);

        queue.resume();
        assert_eq!(first.await.unwrap().unwrap(), "first");
        assert_eq!(second.await.unwrap().unwrap(), "second");
    }

    #[tokio::test]
    async fn test_block_gives_up_at_deadline() {
        let queue = AdmissionQueue::new(BackendId::Fast, 1, 1);
        queue.pause();
        let q = queue.clone();
        let _holder = tokio::spawn(async move {
            q.enqueue(Priority::Low, Duration::from_secs(5), OverflowPolicy::Block, || async {
                Ok::<_, FleetError>(())
            })
            .await
        });
        let q = queue.clone();
        wait_until(move || q.stats().queued == 1).await;

        let err = queue
            .enqueue(Priority::High, Duration::from_millis(30), OverflowPolicy::Block, || async {
                Ok::<_, FleetError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::OverCapacity { .. }));
    }

    // ── Test 5: deadlines ──

    #[tokio::test]
    async fn test_expired_entry_is_dropped() {
        let queue = AdmissionQueue::new(BackendId::Batch, 1, 10);
        queue.pause();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let err = queue
            .enqueue(Priority::Medium, Duration::from_millis(20), OverflowPolicy::Block, || async move {
                r.fetch_add(1, AtomicOrdering::SeqCst);
                Ok::<_, FleetError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::OverCapacity { .. }));

        queue.resume();
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 0);
        let stats = queue.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.dispatched, 0);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_work_past_deadline_times_out() {
        let queue = AdmissionQueue::new(BackendId::Fast, 1, 10);
        let err = queue
            .enqueue(Priority::High, Duration::from_millis(20), OverflowPolicy::FailFast, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, FleetError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Timeout { backend: BackendId::Fast, .. }));
        // The slot is free again.
        let ok = queue
            .enqueue(Priority::High, Duration::from_secs(1), OverflowPolicy::FailFast, || async {
                Ok::<_, FleetError>(7)
            })
            .await
            .unwrap();
        assert_eq!(ok, 7);
        assert_eq!(queue.stats().active, 0);
    }
}

//! Time-ordered action scheduler
//!
//! Every synthesized key or mouse event goes through here, even the ones due
//! immediately, so that output leaves the daemon in one well-defined order.
//! Actions are kept in a min-heap keyed by `(wake, seq)`: the wake time is
//! fixed at enqueue time and `seq` is a monotonic insertion counter, so two
//! actions due at the same instant fire in the order they were enqueued.
//!
//! The queue lock is only held to insert, remove or pop. Dispatching happens
//! after the lock is released, so a slow injection never stalls a reader
//! that is trying to enqueue.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::future::Future;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nostromo_config::StrokeKind;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

/// Default upper bound on pending actions.
pub const DEFAULT_CAPACITY: usize = 4096;

/// How long the loop sleeps when nothing is queued.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// Identifies every action created by one key press, for bulk cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(NonZeroU64);

impl GroupId {
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// What to do when an action comes due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Press or release a key or mouse button.
    Inject {
        kind: StrokeKind,
        code: u16,
        pressed: bool,
        remote: bool,
    },
    /// Re-run a held multi-stroke mapping.
    Repeat { key: usize, group: GroupId },
}

#[derive(Debug, Clone)]
pub struct ScheduledAction {
    pub group: Option<GroupId>,
    pub wake: Instant,
    pub seq: u64,
    pub payload: Payload,
}

impl PartialEq for ScheduledAction {
    fn eq(&self, other: &Self) -> bool {
        self.wake == other.wake && self.seq == other.seq
    }
}

impl Eq for ScheduledAction {}

impl PartialOrd for ScheduledAction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledAction {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wake
            .cmp(&other.wake)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Returned by a successful [`Scheduler::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionHandle {
    pub seq: u64,
    pub wake: Instant,
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<ScheduledAction>>,
    next_seq: u64,
}

pub struct Scheduler {
    queue: Mutex<Queue>,
    wakeup: Notify,
    next_group: AtomicU64,
    capacity: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            wakeup: Notify::new(),
            next_group: AtomicU64::new(1),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh group id.
    pub fn new_group(&self) -> GroupId {
        let raw = self.next_group.fetch_add(1, AtomicOrdering::Relaxed);
        // Starts at 1 and would need 2^64 presses to wrap
        GroupId(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Schedule `payload` to fire `delay_ms` from now.
    ///
    /// # Errors
    ///
    /// Returns `None` when the queue already holds `capacity` actions. The
    /// action is dropped and a warning is logged.
    pub fn enqueue(
        &self,
        group: Option<GroupId>,
        delay_ms: u64,
        payload: Payload,
    ) -> Option<ActionHandle> {
        self.enqueue_at(Instant::now(), group, delay_ms, payload)
    }

    /// Like [`enqueue`](Self::enqueue) with an explicit reference time, so
    /// every action of one input event shares the same `now`.
    ///
    /// # Errors
    ///
    /// Returns `None` when the queue is full, as for `enqueue`.
    pub fn enqueue_at(
        &self,
        now: Instant,
        group: Option<GroupId>,
        delay_ms: u64,
        payload: Payload,
    ) -> Option<ActionHandle> {
        let wake = now + Duration::from_millis(delay_ms);

        let (handle, earliest) = {
            let mut queue = self.lock();
            if queue.heap.len() >= self.capacity {
                tracing::warn!(
                    "Scheduler queue full ({} actions), dropping {:?}",
                    self.capacity,
                    payload
                );
                return None;
            }

            let seq = queue.next_seq;
            queue.next_seq += 1;

            let earliest = queue
                .heap
                .peek()
                .map(|Reverse(head)| wake < head.wake)
                .unwrap_or(true);

            queue.heap.push(Reverse(ScheduledAction {
                group,
                wake,
                seq,
                payload,
            }));

            (ActionHandle { seq, wake }, earliest)
        };

        if earliest {
            self.wakeup.notify_one();
        }

        Some(handle)
    }

    /// Remove every pending action in `group`. Returns how many were removed.
    ///
    /// Removal happens under the queue lock, so once this returns none of
    /// them can be handed out by [`take_due`](Self::take_due).
    pub fn cancel_all(&self, group: GroupId) -> usize {
        let mut queue = self.lock();
        let before = queue.heap.len();
        queue
            .heap
            .retain(|Reverse(action)| action.group != Some(group));
        let removed = before - queue.heap.len();
        if removed > 0 {
            tracing::debug!("Cancelled {} action(s) in group {}", removed, group.get());
        }
        removed
    }

    /// Pop every action due at or before `now`, earliest first.
    pub fn take_due(&self, now: Instant) -> Vec<ScheduledAction> {
        let mut queue = self.lock();
        let mut due = Vec::new();
        while queue
            .heap
            .peek()
            .map(|Reverse(head)| head.wake <= now)
            .unwrap_or(false)
        {
            if let Some(Reverse(action)) = queue.heap.pop() {
                due.push(action);
            }
        }
        due
    }

    pub fn next_wake(&self) -> Option<Instant> {
        self.lock().heap.peek().map(|Reverse(head)| head.wake)
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drive the queue until `shutdown` flips to `true`.
    ///
    /// Sleeps until the earliest wake time, or [`IDLE_TIMEOUT`] when the queue
    /// is empty, and wakes early whenever an enqueue produces a new earliest
    /// action. Due actions are passed to `dispatch` one at a time, in order.
    pub async fn run<F, Fut>(&self, mut dispatch: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut(ScheduledAction) -> Fut,
        Fut: Future<Output = ()>,
    {
        tracing::debug!("Scheduler loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            for action in self.take_due(Instant::now()) {
                tracing::trace!("Dispatching action #{}: {:?}", action.seq, action.payload);
                dispatch(action).await;
            }

            let deadline = self
                .next_wake()
                .unwrap_or_else(|| Instant::now() + IDLE_TIMEOUT);

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }

        tracing::debug!("Scheduler loop stopped ({} action(s) discarded)", self.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(code: u16) -> Payload {
        Payload::Inject {
            kind: StrokeKind::Key,
            code,
            pressed: true,
            remote: false,
        }
    }

    fn codes(actions: &[ScheduledAction]) -> Vec<u16> {
        actions
            .iter()
            .map(|a| match a.payload {
                Payload::Inject { code, .. } => code,
                Payload::Repeat { key, .. } => key as u16,
            })
            .collect()
    }

    #[test]
    fn test_dispatch_order_is_wake_then_insertion() {
        let scheduler = Scheduler::new();
        let now = Instant::now();

        scheduler.enqueue_at(now, None, 20, key(1));
        scheduler.enqueue_at(now, None, 5, key(2));
        scheduler.enqueue_at(now, None, 20, key(3));
        scheduler.enqueue_at(now, None, 0, key(4));
        scheduler.enqueue_at(now, None, 5, key(5));

        let due = scheduler.take_due(now + Duration::from_millis(100));
        assert_eq!(codes(&due), vec![4, 2, 5, 1, 3]);
        for pair in due.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_take_due_leaves_future_actions() {
        let scheduler = Scheduler::new();
        let now = Instant::now();

        scheduler.enqueue_at(now, None, 0, key(1));
        scheduler.enqueue_at(now, None, 50, key(2));

        assert_eq!(codes(&scheduler.take_due(now)), vec![1]);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(
            scheduler.next_wake(),
            Some(now + Duration::from_millis(50))
        );
    }

    #[test]
    fn test_cancel_all_removes_only_that_group() {
        let scheduler = Scheduler::new();
        let now = Instant::now();
        let a = scheduler.new_group();
        let b = scheduler.new_group();
        assert_ne!(a, b);

        scheduler.enqueue_at(now, Some(a), 1, key(1));
        scheduler.enqueue_at(now, Some(b), 2, key(2));
        scheduler.enqueue_at(now, Some(a), 3, key(3));
        scheduler.enqueue_at(now, None, 4, key(4));

        assert_eq!(scheduler.cancel_all(a), 2);
        assert_eq!(scheduler.cancel_all(a), 0);

        let due = scheduler.take_due(now + Duration::from_secs(1));
        assert_eq!(codes(&due), vec![2, 4]);
        assert!(due.iter().all(|action| action.group != Some(a)));
    }

    #[test]
    fn test_full_queue_drops_action() {
        let scheduler = Scheduler::with_capacity(2);
        assert!(scheduler.enqueue(None, 0, key(1)).is_some());
        assert!(scheduler.enqueue(None, 0, key(2)).is_some());
        assert!(scheduler.enqueue(None, 0, key(3)).is_none());
        assert_eq!(scheduler.len(), 2);
    }

    #[test]
    fn test_handles_carry_increasing_sequence() {
        let scheduler = Scheduler::new();
        let first = scheduler.enqueue(None, 10, key(1)).unwrap();
        let second = scheduler.enqueue(None, 0, key(2)).unwrap();
        assert!(second.seq > first.seq);
        assert!(second.wake <= first.wake);
    }

    #[tokio::test]
    async fn test_run_dispatches_in_order_and_stops() {
        let scheduler = Arc::new(Scheduler::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .run(
                        |action| {
                            let seen_tx = seen_tx.clone();
                            async move {
                                let _ = seen_tx.send(action.payload);
                            }
                        },
                        shutdown_rx,
                    )
                    .await;
            })
        };

        // Enqueued after the loop is already sleeping on an empty queue
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.enqueue(None, 30, key(2));
        scheduler.enqueue(None, 0, key(1));
        scheduler.enqueue(None, 30, key(3));

        let mut order = Vec::new();
        for _ in 0..3 {
            let payload = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
                .await
                .expect("action not dispatched in time")
                .unwrap();
            if let Payload::Inject { code, .. } = payload {
                order.push(code);
            }
        }
        assert_eq!(order, vec![1, 2, 3]);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_actions_never_fire() {
        let scheduler = Arc::new(Scheduler::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

        let group = scheduler.new_group();
        scheduler.enqueue(Some(group), 40, key(9));
        scheduler.enqueue(None, 60, key(1));
        scheduler.cancel_all(group);

        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .run(
                        |action| {
                            let seen_tx = seen_tx.clone();
                            async move {
                                let _ = seen_tx.send(action.payload);
                            }
                        },
                        shutdown_rx,
                    )
                    .await;
            })
        };

        let first = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, key(1));

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();
        assert!(seen_rx.try_recv().is_err());
    }
}

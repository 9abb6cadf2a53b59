use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;

/// Bounded-parallelism executor for write-behind work. Submission waits for a
/// free slot, then detaches the task from the submitting request so it runs
/// to completion even if the client goes away.
#[derive(Clone)]
pub struct TaskGroup {
    semaphore: Arc<Semaphore>,
}

impl TaskGroup {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    pub async fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("task group semaphore closed");
        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
    }
}

type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

struct TimerEntry {
    fire_at: Instant,
    seq: u64,
    callback: TimerCallback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops
        // first, with insertion order breaking ties.
        other
            .fire_at
            .cmp(&self.fire_at)
            .then(other.seq.cmp(&self.seq))
    }
}

/// A monotonic timer queue: scheduled callbacks fire in deadline order from a
/// single dispatcher task. Dropping the queue stops the dispatcher; pending
/// callbacks are discarded.
#[derive(Clone)]
pub struct TimerQueue {
    tx: mpsc::UnboundedSender<TimerEntry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx));
        Self { tx }
    }

    pub fn schedule(&self, fire_at: Instant, callback: impl FnOnce() + Send + 'static) {
        static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let entry = TimerEntry {
            fire_at,
            seq: SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            callback: Box::new(callback),
        };
        // A send failure means the dispatcher is gone, which only happens at
        // shutdown; the callback is dropped with everything else.
        let _ = self.tx.send(entry);
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<TimerEntry>) {
    let mut heap: BinaryHeap<TimerEntry> = BinaryHeap::new();
    loop {
        match heap.peek().map(|entry| entry.fire_at) {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        let now = Instant::now();
                        while heap.peek().is_some_and(|entry| entry.fire_at <= now) {
                            let entry = heap.pop().expect("peeked entry");
                            (entry.callback)();
                        }
                    }
                    received = rx.recv() => match received {
                        Some(entry) => heap.push(entry),
                        None => return,
                    },
                }
            }
            None => match rx.recv().await {
                Some(entry) => heap.push(entry),
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    #[tokio::test]
    async fn task_group_bounds_concurrency() {
        let group = TaskGroup::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            group
                .submit(async move {
                    let now = running.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    peak.fetch_max(now, AtomicOrdering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, AtomicOrdering::SeqCst);
                })
                .await;
        }

        // Wait for the stragglers to drain.
        for _ in 0..50 {
            if running.load(AtomicOrdering::SeqCst) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(
            peak.load(AtomicOrdering::SeqCst) <= 2,
            "more than two tasks ran at once"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timer_queue_fires_in_deadline_order() {
        let queue = TimerQueue::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let now = Instant::now();

        for (label, delay_ms) in [("late", 300u64), ("early", 100), ("middle", 200)] {
            let order = order.clone();
            queue.schedule(now + Duration::from_millis(delay_ms), move || {
                order.lock().push(label);
            });
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_queue_accepts_entries_while_waiting() {
        let queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        let f = fired.clone();
        queue.schedule(now + Duration::from_millis(500), move || {
            f.fetch_add(1, AtomicOrdering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // An earlier deadline scheduled later must still fire first.
        let f = fired.clone();
        queue.schedule(now + Duration::from_millis(50), move || {
            f.fetch_add(10, AtomicOrdering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 10);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 11);
    }
}

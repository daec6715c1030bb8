use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use crate::model::Priority;
use crate::ratelimit::RateLimiter;

const DRIVER_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueResult {
    Acquired,
    Timeout,
    Preempted,
}

#[derive(Clone, Copy)]
pub struct QueueConfig {
    pub max_size: usize,
    pub timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_size: 100, timeout: Duration::from_secs(30) }
    }
}

struct Entry {
    user_id: String,
    priority: Priority,
    enqueued_at: Instant,
    notify: Option<oneshot::Sender<bool>>,
}

/// Ordering is by (priority rank ascending, enqueue time ascending); a
/// `BinaryHeap` is a max-heap, so this is inverted to make it behave as the
/// min-heap the design calls for.
struct HeapKey {
    priority_rank: u8,
    enqueued_at: Instant,
    index: usize,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.priority_rank == other.priority_rank && self.enqueued_at == other.enqueued_at
    }
}
impl Eq for HeapKey {}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap pops the greatest, we want the smallest
        // (priority, time) pair at the top.
        other
            .priority_rank
            .cmp(&self.priority_rank)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
    }
}

struct Heap {
    keys: BinaryHeap<HeapKey>,
    entries: HashMap<usize, Entry>,
    next_index: usize,
}

impl Heap {
    fn new() -> Self {
        Self { keys: BinaryHeap::new(), entries: HashMap::new(), next_index: 0 }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn push(&mut self, user_id: String, priority: Priority, notify: oneshot::Sender<bool>) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        let enqueued_at = Instant::now();
        self.keys.push(HeapKey { priority_rank: priority.rank(), enqueued_at, index });
        self.entries.insert(index, Entry { user_id, priority, enqueued_at, notify: Some(notify) });
        index
    }

    fn pop_top(&mut self) -> Option<(usize, Entry)> {
        while let Some(key) = self.keys.pop() {
            if let Some(entry) = self.entries.remove(&key.index) {
                return Some((key.index, entry));
            }
        }
        None
    }

    fn remove(&mut self, index: usize) -> Option<Entry> {
        self.entries.remove(&index)
    }

    /// Finds the lowest-priority entry strictly lower priority than
    /// `incoming`, i.e. the best preemption candidate.
    fn find_preemption_candidate(&self, incoming: Priority) -> Option<usize> {
        self.entries
            .iter()
            .filter(|(_, e)| e.priority.rank() > incoming.rank())
            .max_by_key(|(_, e)| (e.priority.rank(), e.enqueued_at))
            .map(|(idx, _)| *idx)
    }

    fn priority_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries.values() {
            let key = match entry.priority {
                Priority::High => "high",
                Priority::Normal => "normal",
                Priority::Low => "low",
            };
            *counts.entry(key.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

/// Priority-ordered wait queue for non-SSE requests arriving while global
/// concurrency is saturated. A background driver task admits waiters as the
/// limiter reports free slots; HIGH/NORMAL arrivals may preempt a
/// strictly-lower-priority waiter when the heap is full.
pub struct RequestQueue {
    config: QueueConfig,
    heap: Mutex<Heap>,
    driver_running: Mutex<bool>,
    limiter: Arc<RateLimiter>,
}

impl RequestQueue {
    pub fn new(config: QueueConfig, limiter: Arc<RateLimiter>) -> Arc<Self> {
        Arc::new(Self {
            config,
            heap: Mutex::new(Heap::new()),
            driver_running: Mutex::new(false),
            limiter,
        })
    }

    pub async fn enqueue(self: &Arc<Self>, user_id: &str, priority: Priority) -> QueueResult {
        let (tx, rx) = oneshot::channel();
        let index = {
            let mut heap = self.heap.lock().await;
            if heap.len() >= self.config.max_size {
                match priority {
                    Priority::Low => return QueueResult::Timeout,
                    _ => match heap.find_preemption_candidate(priority) {
                        Some(idx) => {
                            if let Some(mut victim) = heap.remove(idx) {
                                if let Some(notify) = victim.notify.take() {
                                    let _ = notify.send(true);
                                }
                            }
                        }
                        None => return QueueResult::Timeout,
                    },
                }
            }
            let index = heap.push(user_id.to_string(), priority, tx);
            self.ensure_driver_running();
            index
        };

        match tokio::time::timeout(self.config.timeout, rx).await {
            Ok(Ok(true)) => QueueResult::Preempted,
            Ok(Ok(false)) => QueueResult::Acquired,
            Ok(Err(_)) => QueueResult::Timeout,
            Err(_) => {
                self.heap.lock().await.remove(index);
                QueueResult::Timeout
            }
        }
    }

    fn ensure_driver_running(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            {
                let mut running = this.driver_running.lock().await;
                if *running {
                    return;
                }
                *running = true;
            }
            this.drive().await;
            *this.driver_running.lock().await = false;
        });
    }

    async fn drive(self: &Arc<Self>) {
        loop {
            {
                let mut heap = self.heap.lock().await;
                if heap.len() == 0 {
                    return;
                }
                if self.limiter.try_take_global_slot().await {
                    if let Some((_, mut entry)) = heap.pop_top() {
                        if let Some(notify) = entry.notify.take() {
                            let _ = notify.send(false);
                        }
                    }
                }
            }
            tokio::time::sleep(DRIVER_POLL_INTERVAL).await;
        }
    }

    pub async fn notify_slot_available(self: &Arc<Self>) {
        self.ensure_driver_running();
    }

    pub async fn stats(&self) -> (usize, HashMap<String, usize>) {
        let heap = self.heap.lock().await;
        (heap.len(), heap.priority_counts())
    }
}

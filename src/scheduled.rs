//! In-memory scheduled delivery.
//!
//! A due-time priority heap with a background loop that plays envelopes
//! into a [`Receiver`] when their time arrives. Re-scheduling an id
//! replaces the earlier entry; stale heap entries are skipped on pop
//! rather than removed in place. Durable scheduling lives in the store;
//! this scheduler backs buffered endpoints and local retry cooldowns.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{envelope::Envelope, transport::Receiver};

struct Entry {
    due: DateTime<Utc>,
    generation: u64,
    envelope: Envelope,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.generation == other.generation
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap; reverse so the earliest due time pops first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    /// Live generation per envelope id. A heap entry whose generation no
    /// longer matches is stale and dropped on pop.
    generations: HashMap<Uuid, u64>,
    next_generation: u64,
}

impl Inner {
    fn is_live(&self, entry: &Entry) -> bool {
        self.generations.get(&entry.envelope.id) == Some(&entry.generation)
    }
}

#[derive(Default)]
pub struct InMemoryScheduler {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `envelope` for `due`. Idempotent per id: scheduling an
    /// id that is already queued moves it to the new time instead of
    /// queueing it twice.
    pub fn enqueue(&self, mut envelope: Envelope, due: DateTime<Utc>) {
        envelope.scheduled_time = Some(due);
        {
            let mut inner = self.inner.lock().expect("scheduler lock poisoned");
            inner.next_generation += 1;
            let generation = inner.next_generation;
            inner.generations.insert(envelope.id, generation);
            inner.heap.push(Entry {
                due,
                generation,
                envelope,
            });
        }
        self.changed.notify_one();
    }

    /// Removes a scheduled envelope. Returns whether it was queued.
    pub fn cancel(&self, id: Uuid) -> bool {
        let cancelled = self
            .inner
            .lock()
            .expect("scheduler lock poisoned")
            .generations
            .remove(&id)
            .is_some();
        if cancelled {
            self.changed.notify_one();
        }
        cancelled
    }

    /// Number of live scheduled envelopes.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("scheduler lock poisoned")
            .generations
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every envelope due at or before `cutoff`, in
    /// due order.
    pub fn play(&self, cutoff: DateTime<Utc>) -> Vec<Envelope> {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        let mut due = Vec::new();

        while let Some(head) = inner.heap.peek() {
            if head.due > cutoff && inner.is_live(head) {
                break;
            }
            let entry = inner.heap.pop().expect("peeked entry exists");
            if inner.is_live(&entry) {
                inner.generations.remove(&entry.envelope.id);
                due.push(entry.envelope);
            }
        }

        due
    }

    /// Drains everything regardless of due time, in due order.
    pub fn play_all(&self) -> Vec<Envelope> {
        self.play(DateTime::<Utc>::MAX_UTC)
    }

    pub fn empty_all(&self) {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        inner.heap.clear();
        inner.generations.clear();
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        while let Some(head) = inner.heap.peek() {
            if inner.is_live(head) {
                return Some(head.due);
            }
            inner.heap.pop();
        }
        None
    }

    /// Background loop delivering due envelopes to `receiver`. Wakes on
    /// new work, sleeps until the earliest due time otherwise. Delivery
    /// failures are logged and the envelopes are dropped from the
    /// in-memory queue; durable scheduling covers the cases where loss
    /// is unacceptable.
    pub async fn run(self: Arc<Self>, receiver: Arc<dyn Receiver>, cancel: CancellationToken) {
        loop {
            let now = Utc::now();
            let due = self.play(now);
            if !due.is_empty() {
                let count = due.len();
                if let Err(err) = receiver.received(due).await {
                    tracing::warn!(%err, count, "scheduled delivery failed");
                }
                continue;
            }

            let wait = self
                .next_due()
                .and_then(|due| (due - now).to_std().ok())
                .unwrap_or(std::time::Duration::from_secs(60));

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.changed.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

pub const DEFAULT_IN_FLIGHT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

enum Slot<T> {
    Pending,
    Done(T),
    Abandoned,
}

struct InFlight<T> {
    started: Instant,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T: Clone> InFlight<T> {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            slot: Mutex::new(Slot::Pending),
            ready: Condvar::new(),
        }
    }

    /// Blocks until the leader settles. `None` means the leader went away
    /// without a result.
    fn wait(&self) -> Option<T> {
        let mut slot = lock(&self.slot);
        loop {
            match &*slot {
                Slot::Pending => {
                    slot = self
                        .ready
                        .wait(slot)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Slot::Done(value) => return Some(value.clone()),
                Slot::Abandoned => return None,
            }
        }
    }

    fn is_settled(&self) -> bool {
        !matches!(*lock(&self.slot), Slot::Pending)
    }

    fn settle(&self, next: Slot<T>) {
        let mut slot = lock(&self.slot);
        if matches!(*slot, Slot::Pending) {
            *slot = next;
        }
        self.ready.notify_all();
    }
}

enum Registration<T> {
    Leader(Arc<InFlight<T>>),
    Joiner(Arc<InFlight<T>>),
}

/// Collapses concurrent work for the same target id into one execution whose
/// result every waiter receives.
pub struct InFlightQueue<T> {
    entries: Mutex<HashMap<i64, Arc<InFlight<T>>>>,
    max_age: Duration,
}

impl<T: Clone> Default for InFlightQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_IN_FLIGHT_MAX_AGE)
    }
}

impl<T: Clone> InFlightQueue<T> {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self, target_id: i64) -> bool {
        lock(&self.entries).contains_key(&target_id)
    }

    /// Runs `factory` unless a run for `target_id` is already in flight, in
    /// which case the caller blocks and receives a clone of that run's
    /// result. Without a target id there is nothing to collapse on.
    pub fn run_exclusive(&self, target_id: Option<i64>, factory: impl FnOnce() -> T) -> T {
        self.run(target_id, false, factory)
    }

    /// Like [`InFlightQueue::run_exclusive`], but never adopts another run's
    /// result: waits for a run already in flight for `target_id` to settle,
    /// then runs `factory` itself. Callers arriving meanwhile join this run.
    pub fn run_superseding(&self, target_id: Option<i64>, factory: impl FnOnce() -> T) -> T {
        self.run(target_id, true, factory)
    }

    fn run(&self, target_id: Option<i64>, supersede: bool, factory: impl FnOnce() -> T) -> T {
        let Some(id) = target_id else {
            return factory();
        };

        let entry = loop {
            match self.register(id, supersede) {
                Registration::Leader(entry) => break entry,
                Registration::Joiner(entry) => {
                    debug!("waiting on in-flight generation for target {id}");
                    match entry.wait() {
                        Some(value) if !supersede => return value,
                        Some(_) => debug!("in-flight generation for target {id} settled; superseding it"),
                        None => debug!(
                            "in-flight generation for target {id} was abandoned; starting over"
                        ),
                    }
                }
            }
        };

        let mut guard = SettleGuard {
            queue: self,
            id,
            entry: &entry,
            settled: false,
        };
        let value = factory();
        entry.settle(Slot::Done(value.clone()));
        guard.settled = true;
        value
    }

    /// Claims `id` or returns the entry already holding it. A superseding
    /// caller also claims entries that have settled but not yet been released.
    fn register(&self, id: i64, supersede: bool) -> Registration<T> {
        let mut entries = lock(&self.entries);
        let max_age = self.max_age;
        entries.retain(|stale_id, entry| {
            let fresh = entry.started.elapsed() <= max_age;
            if !fresh {
                debug!("sweeping stale in-flight entry for target {stale_id}");
            }
            fresh
        });
        if let Some(existing) = entries.get(&id) {
            if !(supersede && existing.is_settled()) {
                return Registration::Joiner(Arc::clone(existing));
            }
        }
        let entry = Arc::new(InFlight::new());
        entries.insert(id, Arc::clone(&entry));
        Registration::Leader(entry)
    }

    fn release(&self, id: i64, entry: &Arc<InFlight<T>>) {
        let mut entries = lock(&self.entries);
        if entries
            .get(&id)
            .map(|current| Arc::ptr_eq(current, entry))
            .unwrap_or(false)
        {
            entries.remove(&id);
        }
    }
}

struct SettleGuard<'a, T: Clone> {
    queue: &'a InFlightQueue<T>,
    id: i64,
    entry: &'a Arc<InFlight<T>>,
    settled: bool,
}

impl<T: Clone> Drop for SettleGuard<'_, T> {
    fn drop(&mut self) {
        if !self.settled {
            self.entry.settle(Slot::Abandoned);
        }
        self.queue.release(self.id, self.entry);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

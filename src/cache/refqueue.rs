//! Drop notifications for reachability-tracked entries.
//!
//! A `ReferenceQueue` collects the ids of entries whose last strong handle
//! went away. Owners drain it lazily on their next access.

use std::sync::Mutex;

use super::keys::EntryId;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::refqueue";

#[derive(Debug, Default)]
pub struct ReferenceQueue {
    pending: Mutex<Vec<EntryId>>,
}

impl ReferenceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, id: EntryId) {
        mutex_lock(&self.pending, SOURCE, "enqueue").push(id);
    }

    /// Take every pending id, oldest first.
    pub fn drain(&self) -> Vec<EntryId> {
        std::mem::take(&mut *mutex_lock(&self.pending, SOURCE, "drain"))
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.pending, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn drain_empties_queue_in_order() {
        let queue = ReferenceQueue::new();
        queue.enqueue(EntryId(2));
        queue.enqueue(EntryId(1));

        assert_eq!(queue.drain(), vec![EntryId(2), EntryId(1)]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn reference_queue_recovers_from_poisoned_lock() {
        let queue = ReferenceQueue::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = queue.pending.lock().expect("queue lock should be acquired");
            panic!("poison queue lock");
        }));

        queue.enqueue(EntryId(7));
        assert_eq!(queue.len(), 1);
    }
}

use slab::Slab;

use crate::runtime::{BoxFuture, TaskId};

/// Root tasks owned by an event loop.
///
/// A slot holds `None` while its future is out being polled, so a stale
/// ready-queue entry for a task that completed or is mid-poll simply finds
/// nothing to do. Slot indices are reused after removal.
pub(crate) struct RootTasks {
    tasks: Slab<Option<BoxFuture>>,
}

impl RootTasks {
    pub(crate) fn new() -> Self {
        RootTasks { tasks: Slab::new() }
    }

    /// Take ownership of a root future. The task is not polled here;
    /// spawning only queues it.
    pub(crate) fn insert(&mut self, future: BoxFuture) -> TaskId {
        TaskId(self.tasks.insert(Some(future)) as u32)
    }

    /// Take the future out for polling. `None` when the slot is vacant or
    /// the future is already out.
    pub(crate) fn take(&mut self, task: TaskId) -> Option<BoxFuture> {
        self.tasks.get_mut(task.0 as usize)?.take()
    }

    /// Put a pending future back after its poll.
    pub(crate) fn restore(&mut self, task: TaskId, future: BoxFuture) {
        if let Some(slot) = self.tasks.get_mut(task.0 as usize) {
            *slot = Some(future);
        }
    }

    /// Drop a completed task's slot, freeing the index for reuse.
    pub(crate) fn remove(&mut self, task: TaskId) {
        if self.tasks.contains(task.0 as usize) {
            self.tasks.remove(task.0 as usize);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_task() -> BoxFuture {
        Box::pin(std::future::pending::<()>())
    }

    #[test]
    fn insert_take_restore() {
        let mut tasks = RootTasks::new();
        let id = tasks.insert(pending_task());

        let future = tasks.take(id);
        assert!(future.is_some());
        // Out for polling; a second take finds nothing.
        assert!(tasks.take(id).is_none());

        tasks.restore(id, future.unwrap());
        assert!(tasks.take(id).is_some());
    }

    #[test]
    fn remove_frees_slot_for_reuse() {
        let mut tasks = RootTasks::new();
        let first = tasks.insert(pending_task());
        tasks.remove(first);
        assert!(tasks.is_empty());

        let second = tasks.insert(pending_task());
        assert_eq!(first, second);
    }

    #[test]
    fn stale_ids_are_harmless() {
        let mut tasks = RootTasks::new();
        let id = tasks.insert(pending_task());
        tasks.remove(id);

        assert!(tasks.take(id).is_none());
        tasks.restore(id, pending_task());
        assert!(tasks.is_empty());
        tasks.remove(id);
    }
}

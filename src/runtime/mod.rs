//! Single-threaded cooperative task runtime.
//!
//! # Portability boundary
//!
//! The machinery here is shared by both readiness backends:
//!
//! - **Backend-neutral**:
//!   - `task`: root-task slot storage
//!   - `waker`: task wakers, thread-local woken queue
//!   - `mod.rs`: the [`Scheduler`] interface, waiter ids, thread-local
//!     task/scheduler context installed around every poll
//!   - `io`, `resolver`, `write_queue`, `cancel`: async operations built
//!     purely on the `Scheduler` interface
//!
//! - **Backend-specific**:
//!   - `epoll_loop`: waiter slots with an interest mask over the epoll
//!     reactor
//!   - `uring_loop`: per-waiter poll tokens over the ring reactor
//!
//! Each loop runs on exactly one driver thread (the thread calling `run`).
//! All task storage, waiter maps, and queues are touched only by that
//! thread; the only cross-thread entry point is the stop flag plus wake
//! eventfd.

pub mod cancel;
pub(crate) mod epoll_loop;
pub mod io;
pub mod resolver;
pub(crate) mod task;
pub(crate) mod uring_loop;
pub(crate) mod waker;
pub mod write_queue;

use std::cell::Cell;
use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Slot index of a spawned root task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskId(pub(crate) u32);

/// Identifier of an armed readiness waiter, allocated at arming time.
///
/// Always nonzero. Keys the wait-result map in both backends; in the
/// completion-poll backend it doubles as the poll token threaded through
/// the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WaiterId(pub(crate) u64);

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// A parked task's record in a scheduler.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitRegistration {
    pub(crate) waiter: WaiterId,
    pub(crate) task: TaskId,
    pub(crate) deadline: Option<Instant>,
    pub(crate) timeout_error: Error,
}

/// Scheduling interface implemented by the event-loop cores.
pub(crate) trait Scheduler {
    /// Queue a task for resume on the loop thread. Duplicate entries are
    /// permitted; stale ones resolve to empty slots and are skipped.
    fn schedule(&mut self, task: TaskId);

    /// Note completion of a tracked root task.
    fn on_task_completed(&mut self);

    /// Park `task` until `fd` is readable or the timeout elapses. An
    /// already-elapsed timeout delivers `timeout_error` without touching
    /// the kernel.
    fn wait_for_readable(
        &mut self,
        fd: RawFd,
        task: TaskId,
        timeout: Option<Duration>,
        timeout_error: Error,
    ) -> Result<WaiterId>;

    /// Park `task` until `fd` is writable or the timeout elapses.
    fn wait_for_writable(
        &mut self,
        fd: RawFd,
        task: TaskId,
        timeout: Option<Duration>,
        timeout_error: Error,
    ) -> Result<WaiterId>;

    /// Exactly-once retrieval of the outcome delivered to a waiter.
    /// `None` means no outcome yet (spurious poll).
    fn consume_wait_result(&mut self, waiter: WaiterId) -> Option<Result<()>>;
}

thread_local! {
    /// Scheduler driving the task currently being polled. Set by the loop
    /// around each poll, cleared afterwards.
    static CURRENT_SCHEDULER: Cell<Option<NonNull<dyn Scheduler>>> = const { Cell::new(None) };

    /// Id of the task currently being polled.
    static CURRENT_TASK: Cell<u32> = const { Cell::new(0) };
}

/// Install the scheduler/task context before polling a task.
///
/// # Safety
///
/// The caller must clear the context with [`clear_task_context`] before the
/// pointed-to scheduler moves or is dropped, and must not touch the
/// scheduler through any other path while the context is installed. The
/// runtime is single-threaded, so the pointer is only ever dereferenced
/// from within the poll it brackets.
pub(crate) fn set_task_context(scheduler: *mut dyn Scheduler, task: TaskId) {
    CURRENT_SCHEDULER.with(|cell| cell.set(NonNull::new(scheduler)));
    CURRENT_TASK.with(|cell| cell.set(task.0));
}

/// Clear the scheduler/task context after a poll returns.
pub(crate) fn clear_task_context() {
    CURRENT_SCHEDULER.with(|cell| cell.set(None));
}

/// The task currently being polled.
pub(crate) fn current_task() -> TaskId {
    TaskId(CURRENT_TASK.with(|cell| cell.get()))
}

/// Reach the scheduler driving the current poll. `None` outside a poll.
pub(crate) fn with_scheduler<R>(f: impl FnOnce(&mut dyn Scheduler) -> R) -> Option<R> {
    let ptr = CURRENT_SCHEDULER.with(|cell| cell.get())?;
    // SAFETY: the pointer was installed by the loop for the duration of the
    // current poll and the runtime is single-threaded; see
    // `set_task_context`.
    Some(f(unsafe { &mut *ptr.as_ptr() }))
}

/// Write one wake token to an eventfd, retrying on `EINTR`. A full counter
/// (`EAGAIN`) means a wake is already pending, which is enough.
pub(crate) fn signal_eventfd(fd: RawFd) {
    if fd < 0 {
        return;
    }
    let signal: u64 = 1;
    loop {
        let written =
            unsafe { libc::write(fd, (&raw const signal).cast(), std::mem::size_of::<u64>()) };
        if written >= 0 {
            return;
        }
        let err = Error::last_os_error();
        if err.value() == libc::EINTR {
            continue;
        }
        return;
    }
}

/// Drain an eventfd counter, retrying on `EINTR` and stopping at `EAGAIN`.
pub(crate) fn drain_eventfd(fd: RawFd) {
    if fd < 0 {
        return;
    }
    let mut signal: u64 = 0;
    loop {
        let count =
            unsafe { libc::read(fd, (&raw mut signal).cast(), std::mem::size_of::<u64>()) };
        if count > 0 {
            continue;
        }
        if count < 0 && Error::last_os_error().value() == libc::EINTR {
            continue;
        }
        return;
    }
}

//! Readiness-poll event loop over the epoll reactor.
//!
//! Per descriptor the loop keeps one waiter slot (readable + writable
//! registration plus the interest mask currently registered with the
//! kernel). Interest is refreshed with mask deltas: add on 0→mask,
//! remove on mask→0, modify otherwise, so the common case of one
//! direction clearing while the other stays armed costs one `EPOLL_CTL_MOD`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use crate::epoll::{EpollReactor, ReadyEvent, has_event};
use crate::error::{Error, Result};
use crate::fd::UniqueFd;
use crate::metrics;
use crate::runtime::task::RootTasks;
use crate::runtime::waker::{drain_woken, task_waker};
use crate::runtime::{
    Scheduler, TaskId, WaitRegistration, WaiterId, clear_task_context, drain_eventfd,
    set_task_context, signal_eventfd,
};

const READ_READY_MASK: u32 =
    (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
const WRITE_READY_MASK: u32 = (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLHUP) as u32;
const COMMON_FLAGS: u32 =
    (libc::EPOLLET | libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;

const EVENT_BATCH: usize = 64;

/// Per-descriptor waiter pair plus the currently-registered interest mask.
#[derive(Default)]
struct WaiterSlot {
    readable: Option<WaitRegistration>,
    writable: Option<WaitRegistration>,
    registered_mask: u32,
}

impl WaiterSlot {
    fn is_empty(&self) -> bool {
        self.readable.is_none() && self.writable.is_none()
    }
}

/// Scheduler state reachable from futures through the thread-local context
/// while a task is being polled. Root-task storage lives outside it so a
/// running poll never aliases the slot it was taken from.
pub(crate) struct EpollCore {
    reactor: EpollReactor,
    wake_fd: Arc<UniqueFd>,
    ready: VecDeque<TaskId>,
    waiters: HashMap<RawFd, WaiterSlot>,
    wait_results: HashMap<WaiterId, Result<()>>,
    next_waiter_id: u64,
    active_task_count: usize,
    pending_waiter_count: usize,
    timed_waiter_count: usize,
    next_deadline: Option<Instant>,
    deadline_index_dirty: bool,
    stop_requested: Arc<AtomicBool>,
    loop_error: Option<Error>,
}

/// Single-threaded event loop driving root tasks over epoll readiness.
pub(crate) struct EpollLoop {
    tasks: RootTasks,
    core: EpollCore,
}

impl EpollLoop {
    pub(crate) fn new() -> Result<Self> {
        let reactor = EpollReactor::new()?;

        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(Error::last_os_error());
        }
        let wake_fd = Arc::new(UniqueFd::new(raw));

        reactor.add(wake_fd.get(), libc::EPOLLIN as u32)?;

        Ok(EpollLoop {
            tasks: RootTasks::new(),
            core: EpollCore {
                reactor,
                wake_fd,
                ready: VecDeque::new(),
                waiters: HashMap::with_capacity(256),
                wait_results: HashMap::with_capacity(256),
                next_waiter_id: 1,
                active_task_count: 0,
                pending_waiter_count: 0,
                timed_waiter_count: 0,
                next_deadline: None,
                deadline_index_dirty: false,
                stop_requested: Arc::new(AtomicBool::new(false)),
                loop_error: None,
            },
        })
    }

    /// Take ownership of a root task and queue it for its first poll.
    pub(crate) fn spawn(&mut self, future: impl Future<Output = ()> + 'static) {
        let task = self.tasks.insert(Box::pin(future));
        self.core.active_task_count += 1;
        self.core.ready.push_back(task);
        metrics::TASKS_SPAWNED.increment();
    }

    /// Drive until every root task completes, stop is requested, or a loop
    /// error latches.
    pub(crate) fn run(&mut self) -> Result<()> {
        self.core.stop_requested.store(false, Ordering::Release);
        self.core.loop_error = None;

        let mut events = [ReadyEvent::default(); EVENT_BATCH];

        while !self.core.stop_requested.load(Ordering::Acquire) {
            self.core.process_expired_waiters();
            if self.core.should_exit() {
                break;
            }

            self.drain_ready();
            if self.core.should_exit() {
                break;
            }

            if self.core.ready.is_empty() {
                if self.core.active_task_count == 0 && self.core.pending_waiter_count == 0 {
                    break;
                }
                if self.core.pending_waiter_count == 0 {
                    // Tasks exist but nothing can ever wake them.
                    return Err(Error::from_errno(libc::EDEADLK));
                }

                let timeout_ms = self.core.wait_timeout_ms();
                let count = self.core.reactor.wait(&mut events, timeout_ms)?;
                for event in &events[..count] {
                    self.core.process_ready_event(event);
                    if self.core.loop_error.is_some() {
                        break;
                    }
                }
            }
        }

        if let Some(err) = self.core.loop_error {
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn stop(&self) {
        self.core.stop_requested.store(true, Ordering::Release);
        signal_eventfd(self.core.wake_fd.get());
    }

    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        self.core.stop_requested.clone()
    }

    pub(crate) fn wake_fd(&self) -> Arc<UniqueFd> {
        self.core.wake_fd.clone()
    }

    /// Pop and poll ready tasks, re-collecting waker wake-ups and
    /// re-sweeping expiries between frames so timeouts stay observable even
    /// when the ready queue never empties.
    fn drain_ready(&mut self) {
        self.core.collect_woken();
        while let Some(task) = self.core.ready.pop_front() {
            self.poll_task(task);
            self.core.collect_woken();
            self.core.process_expired_waiters();
            if self.core.should_exit() {
                return;
            }
        }
    }

    fn poll_task(&mut self, task: TaskId) {
        // Stale queue entry: completed task or duplicate wake.
        let Some(mut future) = self.tasks.take(task) else {
            return;
        };

        let waker = task_waker(task);
        let mut cx = Context::from_waker(&waker);

        let scheduler: *mut dyn Scheduler = &mut self.core;
        // SAFETY: the context is cleared right after the poll and `self.core`
        // is not touched through `self` until then; the runtime is
        // single-threaded.
        set_task_context(scheduler, task);
        let poll = future.as_mut().poll(&mut cx);
        clear_task_context();

        match poll {
            Poll::Ready(()) => {
                self.tasks.remove(task);
                self.core.on_task_completed();
            }
            Poll::Pending => self.tasks.restore(task, future),
        }
    }
}

impl EpollCore {
    fn should_exit(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire) || self.loop_error.is_some()
    }

    fn collect_woken(&mut self) {
        drain_woken(&mut self.ready);
    }

    fn allocate_waiter_id(&mut self) -> WaiterId {
        let id = self.next_waiter_id;
        self.next_waiter_id = self.next_waiter_id.wrapping_add(1);
        if self.next_waiter_id == 0 {
            self.next_waiter_id = 1;
        }
        WaiterId(id)
    }

    fn wait_timeout_ms(&self) -> i32 {
        match self.next_deadline {
            None => -1,
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    0
                } else {
                    deadline
                        .duration_since(now)
                        .as_millis()
                        .min(i32::MAX as u128) as i32
                }
            }
        }
    }

    fn arm_waiter(
        &mut self,
        fd: RawFd,
        task: TaskId,
        readable: bool,
        timeout: Option<std::time::Duration>,
        timeout_error: Error,
    ) -> Result<WaiterId> {
        if fd < 0 {
            return Err(Error::from_errno(libc::EBADF));
        }

        // Already-elapsed deadline: deliver without touching the kernel.
        if timeout.is_some_and(|timeout| timeout.is_zero()) {
            let waiter = self.allocate_waiter_id();
            self.wait_results.insert(waiter, Err(timeout_error));
            self.schedule(task);
            metrics::WAITERS_TIMED_OUT.increment();
            return Ok(waiter);
        }

        let waiter = self.allocate_waiter_id();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let slot = self.waiters.entry(fd).or_default();
        let target = if readable {
            &mut slot.readable
        } else {
            &mut slot.writable
        };
        if target.is_some() {
            return Err(Error::from_errno(libc::EBUSY));
        }
        *target = Some(WaitRegistration {
            waiter,
            task,
            deadline,
            timeout_error,
        });

        if deadline.is_some() {
            self.timed_waiter_count += 1;
            if let Some(deadline) = deadline
                && self.next_deadline.is_none_or(|current| deadline < current)
            {
                self.next_deadline = Some(deadline);
            }
        }
        self.deadline_index_dirty = true;
        self.pending_waiter_count += 1;

        let slot = self
            .waiters
            .get_mut(&fd)
            .ok_or(Error::from_errno(libc::EBADF))?;
        if let Err(err) = refresh_interest(&self.reactor, fd, slot) {
            // Roll back the registration so the slot reflects the kernel.
            let target = if readable {
                &mut slot.readable
            } else {
                &mut slot.writable
            };
            *target = None;
            let slot_empty = slot.is_empty();
            if deadline.is_some() && self.timed_waiter_count > 0 {
                self.timed_waiter_count -= 1;
            }
            self.deadline_index_dirty = true;
            if self.pending_waiter_count > 0 {
                self.pending_waiter_count -= 1;
            }
            if slot_empty {
                self.waiters.remove(&fd);
            }
            return Err(err);
        }

        metrics::WAITERS_ARMED.increment();
        Ok(waiter)
    }

    /// Expire timed waiters whose deadlines have fired and recompute the
    /// earliest remaining deadline. A no-op when no timed waiters exist,
    /// and skipped entirely while the cached `next_deadline` is still in
    /// the future and the index is clean.
    fn process_expired_waiters(&mut self) {
        if self.timed_waiter_count == 0 {
            self.next_deadline = None;
            self.deadline_index_dirty = false;
            return;
        }

        let now = Instant::now();
        if !self.deadline_index_dirty && self.next_deadline.is_some_and(|deadline| now < deadline)
        {
            return;
        }

        let EpollCore {
            ref reactor,
            ref mut waiters,
            ref mut wait_results,
            ref mut ready,
            ref mut pending_waiter_count,
            ref mut timed_waiter_count,
            ..
        } = *self;

        let mut earliest: Option<Instant> = None;
        let mut failed: Option<Error> = None;

        waiters.retain(|&fd, slot| {
            if failed.is_some() {
                return true;
            }

            let mut changed = false;
            for registration in [&mut slot.readable, &mut slot.writable] {
                let Some(reg) = registration else {
                    continue;
                };
                let Some(deadline) = reg.deadline else {
                    continue;
                };
                if now >= deadline {
                    wait_results.insert(reg.waiter, Err(reg.timeout_error));
                    ready.push_back(reg.task);
                    *registration = None;
                    *timed_waiter_count = timed_waiter_count.saturating_sub(1);
                    *pending_waiter_count = pending_waiter_count.saturating_sub(1);
                    changed = true;
                    metrics::WAITERS_TIMED_OUT.increment();
                } else if earliest.is_none_or(|current| deadline < current) {
                    earliest = Some(deadline);
                }
            }

            if changed && let Err(err) = refresh_interest(reactor, fd, slot) {
                failed = Some(err);
                return true;
            }

            !slot.is_empty()
        });

        if let Some(err) = failed {
            self.loop_error = Some(err);
            self.stop_requested.store(true, Ordering::Release);
            return;
        }

        self.next_deadline = earliest;
        self.deadline_index_dirty = false;
    }

    fn process_ready_event(&mut self, event: &ReadyEvent) {
        if event.fd == self.wake_fd.get() {
            metrics::CROSS_THREAD_WAKES.increment();
            drain_eventfd(self.wake_fd.get());
            return;
        }

        let Some(slot) = self.waiters.get_mut(&event.fd) else {
            return;
        };

        let mut delivered: [Option<WaitRegistration>; 2] = [None, None];
        if has_event(event.events, READ_READY_MASK) {
            delivered[0] = slot.readable.take();
        }
        if has_event(event.events, WRITE_READY_MASK) {
            delivered[1] = slot.writable.take();
        }

        for reg in delivered.into_iter().flatten() {
            self.wait_results.insert(reg.waiter, Ok(()));
            self.ready.push_back(reg.task);
            if reg.deadline.is_some() {
                self.timed_waiter_count = self.timed_waiter_count.saturating_sub(1);
                self.deadline_index_dirty = true;
            }
            self.pending_waiter_count = self.pending_waiter_count.saturating_sub(1);
        }

        let Some(slot) = self.waiters.get_mut(&event.fd) else {
            return;
        };
        if let Err(err) = refresh_interest(&self.reactor, event.fd, slot) {
            self.loop_error = Some(err);
            self.stop_requested.store(true, Ordering::Release);
            return;
        }
        if slot.is_empty() {
            self.waiters.remove(&event.fd);
        }
    }
}

impl Scheduler for EpollCore {
    fn schedule(&mut self, task: TaskId) {
        self.ready.push_back(task);
    }

    fn on_task_completed(&mut self) {
        self.active_task_count = self.active_task_count.saturating_sub(1);
    }

    fn wait_for_readable(
        &mut self,
        fd: RawFd,
        task: TaskId,
        timeout: Option<std::time::Duration>,
        timeout_error: Error,
    ) -> Result<WaiterId> {
        self.arm_waiter(fd, task, true, timeout, timeout_error)
    }

    fn wait_for_writable(
        &mut self,
        fd: RawFd,
        task: TaskId,
        timeout: Option<std::time::Duration>,
        timeout_error: Error,
    ) -> Result<WaiterId> {
        self.arm_waiter(fd, task, false, timeout, timeout_error)
    }

    fn consume_wait_result(&mut self, waiter: WaiterId) -> Option<Result<()>> {
        self.wait_results.remove(&waiter)
    }
}

fn refresh_interest(reactor: &EpollReactor, fd: RawFd, slot: &mut WaiterSlot) -> Result<()> {
    let mut desired = 0u32;
    if !slot.is_empty() {
        desired = COMMON_FLAGS;
        if slot.readable.is_some() {
            desired |= libc::EPOLLIN as u32;
        }
        if slot.writable.is_some() {
            desired |= libc::EPOLLOUT as u32;
        }
    }

    if slot.registered_mask == desired {
        return Ok(());
    }

    if slot.registered_mask == 0 {
        reactor.add(fd, desired)?;
    } else if desired == 0 {
        reactor.remove(fd)?;
    } else {
        reactor.modify(fd, desired)?;
    }
    slot.registered_mask = desired;
    Ok(())
}

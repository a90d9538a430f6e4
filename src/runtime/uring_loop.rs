//! Completion-poll event loop over the ring reactor.
//!
//! Readiness is one poll submission per waiter. Tokens identify
//! registrations: completions route back through an in-flight map keyed by
//! token, and a completion whose token no longer matches the registration
//! is stale (the waiter timed out or was cancelled) and is dropped.
//! Submissions are batched behind a dirty flag and flushed before every
//! reactor wait, plus lazily when the submission queue fills.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::fd::UniqueFd;
use crate::metrics;
use crate::ring::{Completion, UringReactor};
use crate::runtime::task::RootTasks;
use crate::runtime::waker::{drain_woken, task_waker};
use crate::runtime::{
    Scheduler, TaskId, WaitRegistration, WaiterId, clear_task_context, drain_eventfd,
    set_task_context, signal_eventfd,
};

const READ_POLL_MASK: u32 =
    (libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLRDHUP) as u32;
const WRITE_POLL_MASK: u32 = (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) as u32;

const COMPLETION_BATCH: usize = 64;

/// Per-descriptor waiter pair. Interest is implicit: tokens are per
/// direction, so there is no registered mask to maintain.
#[derive(Default)]
struct WaiterSlot {
    readable: Option<WaitRegistration>,
    writable: Option<WaitRegistration>,
}

impl WaiterSlot {
    fn is_empty(&self) -> bool {
        self.readable.is_none() && self.writable.is_none()
    }
}

/// Routes a completion token back to its registration.
#[derive(Debug, Clone, Copy)]
struct PollContext {
    fd: RawFd,
    readable: bool,
}

/// Scheduler state reachable from futures through the thread-local context
/// while a task is being polled.
pub(crate) struct UringCore {
    reactor: UringReactor,
    wake_fd: Arc<UniqueFd>,
    wake_token: u64,
    ready: VecDeque<TaskId>,
    waiters: HashMap<RawFd, WaiterSlot>,
    wait_results: HashMap<WaiterId, Result<()>>,
    inflight_polls: HashMap<u64, PollContext>,
    next_token: u64,
    submission_pending: bool,
    active_task_count: usize,
    pending_waiter_count: usize,
    timed_waiter_count: usize,
    next_deadline: Option<Instant>,
    deadline_index_dirty: bool,
    stop_requested: Arc<AtomicBool>,
    loop_error: Option<Error>,
}

/// Single-threaded event loop driving root tasks over ring completions.
pub(crate) struct UringLoop {
    tasks: RootTasks,
    core: UringCore,
}

impl UringLoop {
    pub(crate) fn new(queue_depth: u32) -> Result<Self> {
        let reactor = UringReactor::new(queue_depth)?;

        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(Error::last_os_error());
        }
        let wake_fd = Arc::new(UniqueFd::new(raw));

        let mut core = UringCore {
            reactor,
            wake_fd,
            wake_token: 0,
            ready: VecDeque::new(),
            waiters: HashMap::with_capacity(queue_depth as usize),
            wait_results: HashMap::with_capacity(queue_depth as usize * 2),
            inflight_polls: HashMap::with_capacity(queue_depth as usize * 2),
            next_token: 1,
            submission_pending: false,
            active_task_count: 0,
            pending_waiter_count: 0,
            timed_waiter_count: 0,
            next_deadline: None,
            deadline_index_dirty: false,
            stop_requested: Arc::new(AtomicBool::new(false)),
            loop_error: None,
        };

        core.wake_token = core.allocate_token();
        let wake_fd_raw = core.wake_fd.get();
        let wake_token = core.wake_token;
        queue_poll_add(
            &mut core.reactor,
            &mut core.submission_pending,
            wake_token,
            wake_fd_raw,
            READ_POLL_MASK,
        )?;
        flush_submissions(&mut core.reactor, &mut core.submission_pending)?;

        Ok(UringLoop {
            tasks: RootTasks::new(),
            core,
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

        let mut completions = [Completion::default(); COMPLETION_BATCH];

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
                    return Err(Error::from_errno(libc::EDEADLK));
                }

                let wait_timeout = self.core.wait_timeout();

                flush_submissions(&mut self.core.reactor, &mut self.core.submission_pending)?;

                let count = self.core.reactor.wait(&mut completions, wait_timeout)?;
                for completion in &completions[..count] {
                    self.core.process_completion(completion);
                    if self.core.loop_error.is_some() {
                        break;
                    }
                }
            }
        }

        // Push any poll-removes queued by late expiries before returning.
        let flush = flush_submissions(&mut self.core.reactor, &mut self.core.submission_pending);
        if let Err(err) = flush
            && self.core.loop_error.is_none()
        {
            self.core.loop_error = Some(err);
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

impl UringCore {
    fn should_exit(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire) || self.loop_error.is_some()
    }

    fn collect_woken(&mut self) {
        drain_woken(&mut self.ready);
    }

    /// Next unused nonzero token. Skips any value still in flight so a
    /// long-lived poll can never be aliased by a new registration.
    fn allocate_token(&mut self) -> u64 {
        loop {
            let token = self.next_token;
            self.next_token = self.next_token.wrapping_add(1);
            if self.next_token == 0 {
                self.next_token = 1;
            }
            if token == 0 {
                continue;
            }
            if token != self.wake_token && !self.inflight_polls.contains_key(&token) {
                return token;
            }
        }
    }

    fn wait_timeout(&self) -> Option<Duration> {
        self.next_deadline.map(|deadline| {
            let now = Instant::now();
            if deadline <= now {
                Duration::ZERO
            } else {
                deadline.duration_since(now)
            }
        })
    }

    fn arm_waiter(
        &mut self,
        fd: RawFd,
        task: TaskId,
        readable: bool,
        timeout: Option<Duration>,
        timeout_error: Error,
    ) -> Result<WaiterId> {
        if fd < 0 {
            return Err(Error::from_errno(libc::EBADF));
        }

        if timeout.is_some_and(|timeout| timeout.is_zero()) {
            let token = self.allocate_token();
            self.wait_results.insert(WaiterId(token), Err(timeout_error));
            self.schedule(task);
            metrics::WAITERS_TIMED_OUT.increment();
            return Ok(WaiterId(token));
        }

        {
            let slot = self.waiters.entry(fd).or_default();
            let target = if readable {
                &slot.readable
            } else {
                &slot.writable
            };
            if target.is_some() {
                return Err(Error::from_errno(libc::EBUSY));
            }
        }

        let token = self.allocate_token();
        let waiter = WaiterId(token);
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        if let Some(slot) = self.waiters.get_mut(&fd) {
            let target = if readable {
                &mut slot.readable
            } else {
                &mut slot.writable
            };
            *target = Some(WaitRegistration {
                waiter,
                task,
                deadline,
                timeout_error,
            });
        }

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
        self.inflight_polls.insert(token, PollContext { fd, readable });

        let poll_mask = if readable {
            READ_POLL_MASK
        } else {
            WRITE_POLL_MASK
        };
        if let Err(err) = queue_poll_add(
            &mut self.reactor,
            &mut self.submission_pending,
            token,
            fd,
            poll_mask,
        ) {
            // Fully undo: in-flight entry, registration, counters, slot.
            self.inflight_polls.remove(&token);
            if deadline.is_some() && self.timed_waiter_count > 0 {
                self.timed_waiter_count -= 1;
            }
            self.deadline_index_dirty = true;
            if self.pending_waiter_count > 0 {
                self.pending_waiter_count -= 1;
            }
            if let Some(slot) = self.waiters.get_mut(&fd) {
                let target = if readable {
                    &mut slot.readable
                } else {
                    &mut slot.writable
                };
                *target = None;
                if slot.is_empty() {
                    self.waiters.remove(&fd);
                }
            }
            return Err(err);
        }

        metrics::WAITERS_ARMED.increment();
        Ok(waiter)
    }

    /// Expire timed waiters and cancel their in-flight polls by token; the
    /// poll-removes are flushed at the next reactor wait.
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

        let UringCore {
            ref mut reactor,
            ref mut waiters,
            ref mut wait_results,
            ref mut inflight_polls,
            ref mut ready,
            ref mut pending_waiter_count,
            ref mut timed_waiter_count,
            ref mut submission_pending,
            ..
        } = *self;

        let mut earliest: Option<Instant> = None;
        let mut failed: Option<Error> = None;

        waiters.retain(|_, slot| {
            if failed.is_some() {
                return true;
            }

            for registration in [&mut slot.readable, &mut slot.writable] {
                let Some(reg) = registration else {
                    continue;
                };
                let Some(deadline) = reg.deadline else {
                    continue;
                };
                if now < deadline {
                    if earliest.is_none_or(|current| deadline < current) {
                        earliest = Some(deadline);
                    }
                    continue;
                }

                wait_results.insert(reg.waiter, Err(reg.timeout_error));
                ready.push_back(reg.task);
                let token = reg.waiter.0;
                *registration = None;
                *timed_waiter_count = timed_waiter_count.saturating_sub(1);
                *pending_waiter_count = pending_waiter_count.saturating_sub(1);
                metrics::WAITERS_TIMED_OUT.increment();

                inflight_polls.remove(&token);
                if let Err(err) = queue_poll_remove(reactor, submission_pending, token) {
                    failed = Some(err);
                    return true;
                }
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

    fn process_completion(&mut self, completion: &Completion) {
        let token = completion.user_data;
        if token == 0 {
            return;
        }

        if token == self.wake_token {
            metrics::CROSS_THREAD_WAKES.increment();
            drain_eventfd(self.wake_fd.get());

            // Poll submissions are one-shot: re-arm unless stopping.
            if !self.stop_requested.load(Ordering::Acquire) {
                let wake_fd = self.wake_fd.get();
                let wake_token = self.wake_token;
                let mut rearm = queue_poll_add(
                    &mut self.reactor,
                    &mut self.submission_pending,
                    wake_token,
                    wake_fd,
                    READ_POLL_MASK,
                );
                if rearm.is_ok() {
                    rearm = flush_submissions(&mut self.reactor, &mut self.submission_pending);
                }
                if let Err(err) = rearm {
                    self.loop_error = Some(err);
                    self.stop_requested.store(true, Ordering::Release);
                }
            }
            return;
        }

        let Some(context) = self.inflight_polls.remove(&token) else {
            return;
        };
        let Some(slot) = self.waiters.get_mut(&context.fd) else {
            return;
        };
        let registration = if context.readable {
            &mut slot.readable
        } else {
            &mut slot.writable
        };

        // Stale completion after timeout or cancellation.
        let matches = registration
            .as_ref()
            .is_some_and(|reg| reg.waiter.0 == token);
        if !matches {
            return;
        }
        let Some(reg) = registration.take() else {
            return;
        };
        let slot_empty = slot.is_empty();

        let outcome = if completion.result >= 0 {
            Ok(())
        } else {
            Err(Error::from_errno(-completion.result))
        };
        self.wait_results.insert(reg.waiter, outcome);
        self.ready.push_back(reg.task);
        if reg.deadline.is_some() {
            self.timed_waiter_count = self.timed_waiter_count.saturating_sub(1);
            self.deadline_index_dirty = true;
        }
        self.pending_waiter_count = self.pending_waiter_count.saturating_sub(1);

        if slot_empty {
            self.waiters.remove(&context.fd);
        }
    }
}

impl Scheduler for UringCore {
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
        timeout: Option<Duration>,
        timeout_error: Error,
    ) -> Result<WaiterId> {
        self.arm_waiter(fd, task, true, timeout, timeout_error)
    }

    fn wait_for_writable(
        &mut self,
        fd: RawFd,
        task: TaskId,
        timeout: Option<Duration>,
        timeout_error: Error,
    ) -> Result<WaiterId> {
        self.arm_waiter(fd, task, false, timeout, timeout_error)
    }

    fn consume_wait_result(&mut self, waiter: WaiterId) -> Option<Result<()>> {
        self.wait_results.remove(&waiter)
    }
}

/// Queue a poll-add, flushing and retrying once when the submission queue
/// is full.
fn queue_poll_add(
    reactor: &mut UringReactor,
    submission_pending: &mut bool,
    token: u64,
    fd: RawFd,
    poll_mask: u32,
) -> Result<()> {
    let mut result = reactor.submit_poll_add(token, fd, poll_mask);
    if let Err(err) = &result
        && err.value() == libc::EBUSY
    {
        flush_submissions(reactor, submission_pending)?;
        result = reactor.submit_poll_add(token, fd, poll_mask);
    }
    result?;
    *submission_pending = true;
    Ok(())
}

/// Queue a poll-remove by token, flushing and retrying once on a full
/// submission queue. A target that is already gone counts as success.
fn queue_poll_remove(
    reactor: &mut UringReactor,
    submission_pending: &mut bool,
    token: u64,
) -> Result<()> {
    if token == 0 {
        return Ok(());
    }
    let mut result = reactor.submit_poll_remove(token);
    if let Err(err) = &result
        && err.value() == libc::EBUSY
    {
        flush_submissions(reactor, submission_pending)?;
        result = reactor.submit_poll_remove(token);
    }
    match result {
        Ok(()) => {
            *submission_pending = true;
            Ok(())
        }
        Err(err) if err.value() == libc::ENOENT => Ok(()),
        Err(err) => Err(err),
    }
}

fn flush_submissions(reactor: &mut UringReactor, submission_pending: &mut bool) -> Result<()> {
    if !*submission_pending {
        return Ok(());
    }
    reactor.submit()?;
    *submission_pending = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn make_loop() -> Option<UringLoop> {
        match UringLoop::new(16) {
            Ok(event_loop) => Some(event_loop),
            Err(err) => {
                eprintln!("skipping uring loop test: {err}");
                None
            }
        }
    }

    #[test]
    fn run_with_no_tasks_returns_immediately() {
        let Some(mut event_loop) = make_loop() else {
            return;
        };
        event_loop.run().unwrap();
    }

    #[test]
    fn spawned_task_runs_to_completion() {
        let Some(mut event_loop) = make_loop() else {
            return;
        };
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        event_loop.spawn(async move {
            flag.set(true);
        });
        event_loop.run().unwrap();
        assert!(ran.get());
    }

    #[test]
    fn deadlocked_task_is_detected() {
        let Some(mut event_loop) = make_loop() else {
            return;
        };
        event_loop.spawn(std::future::pending::<()>());
        let err = event_loop.run().unwrap_err();
        assert_eq!(err.value(), libc::EDEADLK);
    }
}

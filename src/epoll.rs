//! Thin wrapper over an edge-triggered epoll instance.

use std::cell::RefCell;
use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::fd::UniqueFd;

/// One ready descriptor with its kernel event mask.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReadyEvent {
    pub(crate) fd: RawFd,
    pub(crate) events: u32,
}

/// `true` when `mask` intersects `flags`.
pub(crate) const fn has_event(mask: u32, flags: u32) -> bool {
    mask & flags != 0
}

/// Batches up to this size reuse a per-thread scratch buffer.
const MAX_CACHED_EVENT_BATCH: usize = 1024;

thread_local! {
    static EVENT_SCRATCH: RefCell<Vec<libc::epoll_event>> = const { RefCell::new(Vec::new()) };
}

/// Owner of one close-on-exec epoll instance.
#[derive(Debug)]
pub(crate) struct EpollReactor {
    epoll_fd: UniqueFd,
}

impl EpollReactor {
    pub(crate) fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        Ok(EpollReactor {
            epoll_fd: UniqueFd::new(fd),
        })
    }

    pub(crate) fn add(&self, fd: RawFd, events: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub(crate) fn modify(&self, fd: RawFd, events: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    /// Remove interest in `fd`. Idempotent: `ENOENT` counts as success.
    pub(crate) fn remove(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Block until readiness or timeout. `timeout_ms < 0` waits forever;
    /// `EINTR` reports zero ready events.
    pub(crate) fn wait(&self, events: &mut [ReadyEvent], timeout_ms: i32) -> Result<usize> {
        if !self.epoll_fd.valid() {
            return Err(Error::from_errno(libc::EBADF));
        }
        if events.is_empty() {
            return Err(Error::from_errno(libc::EINVAL));
        }

        let fill = |sys_events: &mut [libc::epoll_event]| -> Result<usize> {
            let ready = unsafe {
                libc::epoll_wait(
                    self.epoll_fd.get(),
                    sys_events.as_mut_ptr(),
                    sys_events.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if ready < 0 {
                let err = Error::last_os_error();
                if err.value() == libc::EINTR {
                    return Ok(0);
                }
                return Err(err);
            }
            Ok(ready as usize)
        };

        let count = if events.len() <= MAX_CACHED_EVENT_BATCH {
            EVENT_SCRATCH.with(|scratch| {
                let mut cached = scratch.borrow_mut();
                if cached.len() < events.len() {
                    cached.resize(events.len(), unsafe { std::mem::zeroed() });
                }
                let count = fill(&mut cached[..events.len()])?;
                for (out, sys) in events.iter_mut().zip(cached.iter()).take(count) {
                    *out = ReadyEvent {
                        fd: sys.u64 as RawFd,
                        events: sys.events,
                    };
                }
                Ok::<usize, Error>(count)
            })?
        } else {
            let mut local: Vec<libc::epoll_event> =
                vec![unsafe { std::mem::zeroed() }; events.len()];
            let count = fill(&mut local)?;
            for (out, sys) in events.iter_mut().zip(local.iter()).take(count) {
                *out = ReadyEvent {
                    fd: sys.u64 as RawFd,
                    events: sys.events,
                };
            }
            count
        };

        Ok(count)
    }

    pub(crate) fn native_handle(&self) -> RawFd {
        self.epoll_fd.get()
    }

    fn ctl(&self, operation: libc::c_int, fd: RawFd, events: u32) -> Result<()> {
        if !self.epoll_fd.valid() || fd < 0 {
            return Err(Error::from_errno(libc::EBADF));
        }

        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let event_ptr = if operation == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &raw mut event
        };

        if unsafe { libc::epoll_ctl(self.epoll_fd.get(), operation, fd, event_ptr) } == 0 {
            return Ok(());
        }

        let err = Error::last_os_error();
        if operation == libc::EPOLL_CTL_DEL && err.value() == libc::ENOENT {
            return Ok(());
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::close;

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn readiness_after_write() {
        let reactor = EpollReactor::new().unwrap();
        let (read_fd, write_fd) = make_pipe();

        reactor
            .add(read_fd, (libc::EPOLLIN | libc::EPOLLET) as u32)
            .unwrap();

        let byte = 1u8;
        let written = unsafe { libc::write(write_fd, (&raw const byte).cast(), 1) };
        assert_eq!(written, 1);

        let mut events = [ReadyEvent::default(); 8];
        let count = reactor.wait(&mut events, 1000).unwrap();
        assert_eq!(count, 1);
        assert_eq!(events[0].fd, read_fd);
        assert!(has_event(events[0].events, libc::EPOLLIN as u32));

        close(read_fd).unwrap();
        close(write_fd).unwrap();
    }

    #[test]
    fn zero_timeout_returns_without_events() {
        let reactor = EpollReactor::new().unwrap();
        let (read_fd, write_fd) = make_pipe();
        reactor
            .add(read_fd, (libc::EPOLLIN | libc::EPOLLET) as u32)
            .unwrap();

        let mut events = [ReadyEvent::default(); 4];
        assert_eq!(reactor.wait(&mut events, 0).unwrap(), 0);

        close(read_fd).unwrap();
        close(write_fd).unwrap();
    }

    #[test]
    fn remove_is_idempotent() {
        let reactor = EpollReactor::new().unwrap();
        let (read_fd, write_fd) = make_pipe();

        reactor
            .add(read_fd, (libc::EPOLLIN | libc::EPOLLET) as u32)
            .unwrap();
        reactor.remove(read_fd).unwrap();
        reactor.remove(read_fd).unwrap();

        close(read_fd).unwrap();
        close(write_fd).unwrap();
    }

    #[test]
    fn empty_output_span_is_rejected() {
        let reactor = EpollReactor::new().unwrap();
        let err = reactor.wait(&mut [], 0).unwrap_err();
        assert_eq!(err.value(), libc::EINVAL);
    }
}

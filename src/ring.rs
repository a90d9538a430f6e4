//! Thin wrapper over an io_uring submission/completion ring.
//!
//! Readiness is obtained exclusively through poll submissions: one
//! `PollAdd` per armed waiter, cancelled by token with `PollRemove`.
//! Completions carry the waiter token in `user_data` and a negated errno
//! in `result` on failure.

use std::os::fd::RawFd;
use std::time::Duration;

use io_uring::types::{SubmitArgs, Timespec};
use io_uring::{IoUring, opcode, types};

use crate::error::{Error, Result};

/// One drained completion entry.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Completion {
    pub(crate) user_data: u64,
    pub(crate) result: i32,
}

/// Owner of one initialised ring.
pub(crate) struct UringReactor {
    ring: IoUring,
}

impl std::fmt::Debug for UringReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UringReactor").finish_non_exhaustive()
    }
}

impl UringReactor {
    pub(crate) fn new(entries: u32) -> Result<Self> {
        if entries == 0 {
            return Err(Error::from_errno(libc::EINVAL));
        }
        let ring = IoUring::new(entries).map_err(Error::from)?;
        Ok(UringReactor { ring })
    }

    /// Queue a poll submission for `fd` with the given nonzero token.
    /// A full submission queue reports `EBUSY`; the caller flushes and
    /// retries.
    pub(crate) fn submit_poll_add(
        &mut self,
        user_data: u64,
        fd: RawFd,
        poll_mask: u32,
    ) -> Result<()> {
        if user_data == 0 || fd < 0 || poll_mask == 0 {
            return Err(Error::from_errno(libc::EINVAL));
        }
        let entry = opcode::PollAdd::new(types::Fd(fd), poll_mask)
            .build()
            .user_data(user_data);
        // SAFETY: a poll entry references no caller memory beyond the
        // descriptor, which outlives the submission by the arming contract.
        unsafe { self.ring.submission().push(&entry) }
            .map_err(|_| Error::from_errno(libc::EBUSY))
    }

    /// Queue cancellation of a prior poll submission by token.
    pub(crate) fn submit_poll_remove(&mut self, target_user_data: u64) -> Result<()> {
        if target_user_data == 0 {
            return Err(Error::from_errno(libc::EINVAL));
        }
        let entry = opcode::PollRemove::new(target_user_data)
            .build()
            .user_data(0);
        // SAFETY: as above; the entry carries only the target token.
        unsafe { self.ring.submission().push(&entry) }
            .map_err(|_| Error::from_errno(libc::EBUSY))
    }

    /// Flush queued submissions to the kernel.
    pub(crate) fn submit(&mut self) -> Result<()> {
        self.ring.submit().map_err(Error::from)?;
        Ok(())
    }

    /// Block until at least one completion or the timeout elapses, then
    /// drain up to `completions.len()` entries. `ETIME` and `EINTR` report
    /// zero completions so the caller can cycle into expiry sweeping.
    pub(crate) fn wait(
        &mut self,
        completions: &mut [Completion],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        if completions.is_empty() {
            return Err(Error::from_errno(libc::EINVAL));
        }

        let wait_result = match timeout {
            Some(timeout) => {
                let ts = Timespec::from(timeout);
                let args = SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
            None => self.ring.submitter().submit_and_wait(1),
        };

        if let Err(err) = wait_result {
            match err.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EINTR) => return Ok(0),
                _ => return Err(Error::from(err)),
            }
        }

        let mut count = 0;
        for cqe in self.ring.completion() {
            completions[count] = Completion {
                user_data: cqe.user_data(),
                result: cqe.result(),
            };
            count += 1;
            if count == completions.len() {
                break;
            }
        }
        Ok(count)
    }
}

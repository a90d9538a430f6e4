//! Backend-neutral async I/O operations.
//!
//! All operations are `async fn`s returning [`Result`]. At their suspension
//! points they reach whichever event loop is driving the current task
//! through the thread-local scheduler context, so the same code runs over
//! both readiness backends. Would-block conditions from the nonblocking
//! layer are never surfaced: the operation parks on readiness and retries.

use std::future::Future;
use std::mem;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::ptr;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::fd::UniqueFd;
use crate::net::{Endpoint, TcpListener, TcpStream, is_in_progress, is_would_block};
use crate::runtime::cancel::CancelToken;
use crate::runtime::{WaiterId, current_task, with_scheduler};

/// Cancellation-latency slice. Readiness waits inside cancellable loops are
/// bounded to this, so a cancel request is observed within one slice.
const CANCEL_SLICE: Duration = Duration::from_millis(20);

/// Parks the current task until a descriptor readiness outcome is
/// delivered by the scheduler.
struct Readiness {
    fd: RawFd,
    readable: bool,
    timeout: Option<Duration>,
    timeout_error: Error,
    armed: Option<WaiterId>,
}

impl Readiness {
    fn new(fd: RawFd, readable: bool, timeout: Option<Duration>) -> Self {
        Readiness {
            fd,
            readable,
            timeout,
            timeout_error: Error::from_errno(libc::ETIMEDOUT),
            armed: None,
        }
    }
}

impl Future for Readiness {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = &mut *self;
        match this.armed {
            None => {
                let (fd, readable, timeout, timeout_error) =
                    (this.fd, this.readable, this.timeout, this.timeout_error);
                let task = current_task();
                let armed = with_scheduler(|scheduler| {
                    if readable {
                        scheduler.wait_for_readable(fd, task, timeout, timeout_error)
                    } else {
                        scheduler.wait_for_writable(fd, task, timeout, timeout_error)
                    }
                });
                match armed {
                    // Polled outside a runtime task.
                    None => Poll::Ready(Err(Error::from_errno(libc::EINVAL))),
                    Some(Err(err)) => Poll::Ready(Err(err)),
                    Some(Ok(waiter)) => {
                        this.armed = Some(waiter);
                        Poll::Pending
                    }
                }
            }
            Some(waiter) => match with_scheduler(|scheduler| {
                scheduler.consume_wait_result(waiter)
            }) {
                None => Poll::Ready(Err(Error::from_errno(libc::EINVAL))),
                // Spurious poll: no outcome delivered yet.
                Some(None) => Poll::Pending,
                Some(Some(outcome)) => {
                    this.armed = None;
                    Poll::Ready(outcome)
                }
            },
        }
    }
}

/// Suspend until the descriptor is readable.
pub async fn wait_readable(fd: RawFd) -> Result<()> {
    Readiness::new(fd, true, None).await
}

/// Suspend until the descriptor is writable.
pub async fn wait_writable(fd: RawFd) -> Result<()> {
    Readiness::new(fd, false, None).await
}

/// Suspend until the descriptor is readable or the timeout elapses
/// (`ETIMEDOUT`).
pub async fn wait_readable_for(fd: RawFd, timeout: Duration) -> Result<()> {
    Readiness::new(fd, true, Some(timeout)).await
}

/// Suspend until the descriptor is writable or the timeout elapses
/// (`ETIMEDOUT`).
pub async fn wait_writable_for(fd: RawFd, timeout: Duration) -> Result<()> {
    Readiness::new(fd, false, Some(timeout)).await
}

/// Accept one connection, suspending on would-block.
pub async fn async_accept(listener: &TcpListener) -> Result<TcpStream> {
    loop {
        match listener.accept() {
            Ok(stream) => return Ok(stream),
            Err(err) if is_would_block(&err) => {
                wait_readable(listener.native_handle()).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Connect to a remote endpoint, suspending on the handshake.
///
/// Only `SO_ERROR == 0` after a writability wake signals success; a pending
/// handshake (`EINPROGRESS`/would-block) re-arms the wait.
pub async fn async_connect(remote: &Endpoint) -> Result<TcpStream> {
    let stream = TcpStream::connect(remote)?;
    loop {
        match stream.finish_connect() {
            Ok(()) => return Ok(stream),
            Err(err) if is_in_progress(&err) || is_would_block(&err) => {
                wait_writable(stream.native_handle()).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Read whatever is available, suspending on would-block. `Ok(0)` means
/// the peer closed.
pub async fn async_read_some(stream: &TcpStream, buffer: &mut [u8]) -> Result<usize> {
    loop {
        match stream.read_some(buffer) {
            Ok(count) => return Ok(count),
            Err(err) if is_would_block(&err) => {
                wait_readable(stream.native_handle()).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Write whatever fits, suspending on would-block.
pub async fn async_write_some(stream: &TcpStream, buffer: &[u8]) -> Result<usize> {
    loop {
        match stream.write_some(buffer) {
            Ok(count) => return Ok(count),
            Err(err) if is_would_block(&err) => {
                wait_writable(stream.native_handle()).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Fill the whole buffer. A peer close mid-fill surfaces `ECONNRESET`.
///
/// The read loop is inlined over `read_some` plus readiness waits so small
/// payloads cost no per-chunk future state.
pub async fn async_read_exact(stream: &TcpStream, buffer: &mut [u8]) -> Result<()> {
    let mut total = 0;
    while total < buffer.len() {
        match stream.read_some(&mut buffer[total..]) {
            Ok(0) => return Err(Error::from_errno(libc::ECONNRESET)),
            Ok(count) => total += count,
            Err(err) if is_would_block(&err) => {
                wait_readable(stream.native_handle()).await?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Drain the whole buffer. A peer close mid-drain surfaces `EPIPE`.
pub async fn async_write_all(stream: &TcpStream, buffer: &[u8]) -> Result<()> {
    let mut total = 0;
    while total < buffer.len() {
        match stream.write_some(&buffer[total..]) {
            Ok(0) => return Err(Error::from_errno(libc::EPIPE)),
            Ok(count) => total += count,
            Err(err) if is_would_block(&err) => {
                wait_writable(stream.native_handle()).await?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

thread_local! {
    /// One monotonic timer per driver thread, created on first use and
    /// released at thread exit.
    static SLEEP_TIMER: std::cell::RefCell<Option<UniqueFd>> =
        const { std::cell::RefCell::new(None) };
}

fn sleep_timer_fd() -> Result<RawFd> {
    SLEEP_TIMER.with(|cell| {
        let mut slot = cell.borrow_mut();
        if let Some(fd) = slot.as_ref()
            && fd.valid()
        {
            return Ok(fd.get());
        }
        let raw = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
            )
        };
        if raw < 0 {
            return Err(Error::last_os_error());
        }
        *slot = Some(UniqueFd::new(raw));
        Ok(raw)
    })
}

fn arm_timer(fd: RawFd, slice: Duration) -> Result<()> {
    let mut spec: libc::itimerspec = unsafe { mem::zeroed() };
    spec.it_value.tv_sec = slice.as_secs() as libc::time_t;
    spec.it_value.tv_nsec = libc::c_long::from(slice.subsec_nanos());
    if unsafe { libc::timerfd_settime(fd, 0, &spec, ptr::null_mut()) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

fn drain_timer(fd: RawFd) -> Result<()> {
    let mut expirations: u64 = 0;
    let count =
        unsafe { libc::read(fd, (&raw mut expirations).cast(), mem::size_of::<u64>()) };
    if count < 0 {
        let err = Error::last_os_error();
        if matches!(
            err.value(),
            libc::EINTR | libc::EAGAIN | libc::EWOULDBLOCK
        ) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Sleep for `duration` with cooperative cancellation.
///
/// The sleep arms the per-thread timer in short slices (at most 20 ms,
/// at least 1 ms) and re-checks the deadline and the token after each
/// wake, so a cancel lands within one slice.
pub async fn async_sleep(duration: Duration, token: CancelToken) -> Result<()> {
    if token.stop_requested() {
        return Err(Error::from_errno(libc::ECANCELED));
    }
    if duration.is_zero() {
        return Ok(());
    }

    let timer_fd = sleep_timer_fd()?;
    let deadline = Instant::now() + duration;

    loop {
        if token.stop_requested() {
            return Err(Error::from_errno(libc::ECANCELED));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }

        let remaining = deadline.duration_since(now);
        let slice = remaining
            .min(CANCEL_SLICE)
            .max(Duration::from_millis(1));
        arm_timer(timer_fd, slice)?;

        wait_readable(timer_fd).await?;
        drain_timer(timer_fd)?;
    }
}

/// Read with an overall deadline and cooperative cancellation.
///
/// Readiness waits are sliced to at most 20 ms; a slice expiry that is
/// not the overall deadline just loops. The overall deadline surfaces
/// `ETIMEDOUT`, a cancelled token `ECANCELED`.
pub async fn async_read_some_with_timeout(
    stream: &TcpStream,
    buffer: &mut [u8],
    timeout: Duration,
    token: CancelToken,
) -> Result<usize> {
    let deadline = Instant::now() + timeout;

    loop {
        if token.stop_requested() {
            return Err(Error::from_errno(libc::ECANCELED));
        }

        match stream.read_some(buffer) {
            Ok(count) => return Ok(count),
            Err(err) if is_would_block(&err) => {}
            Err(err) => return Err(err),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::from_errno(libc::ETIMEDOUT));
        }

        let slice = deadline
            .duration_since(now)
            .min(CANCEL_SLICE)
            .max(Duration::from_millis(1));
        match wait_readable_for(stream.native_handle(), slice).await {
            Ok(()) => {}
            Err(err) if err.value() == libc::ETIMEDOUT => {}
            Err(err) => return Err(err),
        }
    }
}

/// Write with an overall deadline and cooperative cancellation. Same slice
/// discipline as [`async_read_some_with_timeout`].
pub async fn async_write_some_with_timeout(
    stream: &TcpStream,
    buffer: &[u8],
    timeout: Duration,
    token: CancelToken,
) -> Result<usize> {
    let deadline = Instant::now() + timeout;

    loop {
        if token.stop_requested() {
            return Err(Error::from_errno(libc::ECANCELED));
        }

        match stream.write_some(buffer) {
            Ok(count) => return Ok(count),
            Err(err) if is_would_block(&err) => {}
            Err(err) => return Err(err),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::from_errno(libc::ETIMEDOUT));
        }

        let slice = deadline
            .duration_since(now)
            .min(CANCEL_SLICE)
            .max(Duration::from_millis(1));
        match wait_writable_for(stream.native_handle(), slice).await {
            Ok(()) => {}
            Err(err) if err.value() == libc::ETIMEDOUT => {}
            Err(err) => return Err(err),
        }
    }
}

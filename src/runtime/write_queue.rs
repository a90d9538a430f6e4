//! Backpressure-aware buffered writer.
//!
//! Buffers are queued whole and drained through a front-offset cursor, so a
//! partial send never re-copies. Backpressure is a two-state machine over
//! the queued byte count: crossing the high watermark latches
//! `high_watermark_active`, and only draining back to the low watermark
//! clears it; while latched, enqueues at or above the low watermark are
//! refused with `EWOULDBLOCK`.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::net::TcpStream;
use crate::runtime::cancel::CancelToken;
use crate::runtime::io::async_write_some_with_timeout;

/// Default low watermark: drain target below which backpressure clears.
pub const DEFAULT_LOW_WATERMARK: usize = 64 * 1024;
/// Default high watermark: queued bytes at which backpressure latches.
pub const DEFAULT_HIGH_WATERMARK: usize = 256 * 1024;

/// Per-syscall slice of the flush loop.
const FLUSH_SLICE: Duration = Duration::from_millis(100);

/// Queue thresholds controlling the backpressure state machine.
#[derive(Debug, Clone, Copy)]
pub struct Watermarks {
    pub low: usize,
    pub high: usize,
}

impl Default for Watermarks {
    fn default() -> Self {
        Watermarks {
            low: DEFAULT_LOW_WATERMARK,
            high: DEFAULT_HIGH_WATERMARK,
        }
    }
}

/// Backpressure state reported by enqueue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureState {
    Normal,
    HighWatermark,
}

/// Buffered writer over one nonblocking stream.
pub struct QueuedWriter {
    stream: TcpStream,
    queue: VecDeque<Vec<u8>>,
    front_offset: usize,
    queued_bytes: usize,
    marks: Watermarks,
    high_watermark_active: bool,
}

impl QueuedWriter {
    /// Wrap a stream. A zero low watermark is clamped to 1 and the high
    /// watermark to at least the low one.
    pub fn new(stream: TcpStream, marks: Watermarks) -> Self {
        let mut marks = marks;
        if marks.low == 0 {
            marks.low = 1;
        }
        if marks.high < marks.low {
            marks.high = marks.low;
        }
        QueuedWriter {
            stream,
            queue: VecDeque::new(),
            front_offset: 0,
            queued_bytes: 0,
            marks,
            high_watermark_active: false,
        }
    }

    /// Copy bytes into the queue.
    pub fn enqueue(&mut self, bytes: &[u8]) -> Result<BackpressureState> {
        self.enqueue_owned(bytes.to_vec())
    }

    /// Move an owned buffer into the queue.
    pub fn enqueue_owned(&mut self, bytes: Vec<u8>) -> Result<BackpressureState> {
        if !self.stream.valid() {
            return Err(Error::from_errno(libc::EBADF));
        }
        if bytes.is_empty() {
            return Ok(self.state());
        }
        if self.high_watermark_active && self.queued_bytes >= self.marks.low {
            return Err(Error::from_errno(libc::EWOULDBLOCK));
        }

        self.queued_bytes += bytes.len();
        self.queue.push_back(bytes);
        if self.queued_bytes >= self.marks.high {
            self.high_watermark_active = true;
        }
        Ok(self.state())
    }

    /// Drain the queue within `timeout`. Expiry surfaces `ETIMEDOUT`, a
    /// cancelled token `ECANCELED`, a peer close `EPIPE`.
    pub async fn flush(&mut self, timeout: Duration, token: CancelToken) -> Result<()> {
        let deadline = Instant::now() + timeout;

        while self.queued_bytes > 0 {
            if token.stop_requested() {
                return Err(Error::from_errno(libc::ECANCELED));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::from_errno(libc::ETIMEDOUT));
            }
            let slice = deadline
                .duration_since(now)
                .min(FLUSH_SLICE)
                .max(Duration::from_millis(1));

            let Some(front) = self.queue.front() else {
                break;
            };
            let written = async_write_some_with_timeout(
                &self.stream,
                &front[self.front_offset..],
                slice,
                token.clone(),
            )
            .await?;
            if written == 0 {
                return Err(Error::from_errno(libc::EPIPE));
            }

            self.front_offset += written;
            self.queued_bytes -= written;
            if let Some(front) = self.queue.front()
                && self.front_offset == front.len()
            {
                self.queue.pop_front();
                self.front_offset = 0;
            }
            self.update_backpressure_after_drain();
        }

        Ok(())
    }

    /// Flush to completion, then shut down the write half.
    pub async fn graceful_shutdown(&mut self, timeout: Duration, token: CancelToken) -> Result<()> {
        self.flush(timeout, token).await?;
        self.stream.shutdown_write()
    }

    /// Bytes currently queued (front slice beyond the cursor plus all
    /// subsequent buffers).
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Whether backpressure is latched.
    pub fn high_watermark_active(&self) -> bool {
        self.high_watermark_active
    }

    /// The underlying stream descriptor.
    pub fn native_handle(&self) -> RawFd {
        self.stream.native_handle()
    }

    fn state(&self) -> BackpressureState {
        if self.high_watermark_active {
            BackpressureState::HighWatermark
        } else {
            BackpressureState::Normal
        }
    }

    fn update_backpressure_after_drain(&mut self) {
        if self.high_watermark_active && self.queued_bytes <= self.marks.low {
            self.high_watermark_active = false;
        }
    }
}

//! pollring: single-threaded async networking runtime for Linux.
//!
//! pollring drives coroutine-style tasks over one of two interchangeable
//! kernel readiness backends: edge-triggered epoll (readiness poll) or
//! io_uring poll submissions (completion poll). Each [`Engine`] runs on
//! exactly one driver thread with no work-stealing; the only cross-thread
//! entry point is [`StopHandle::stop`]. Scheduling is cooperative, so a
//! blocking call inside a task stalls every sibling task on that engine.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pollring::{
//!     Backend, Endpoint, Engine, TcpListener, async_accept, async_read_some,
//!     async_write_all,
//! };
//!
//! fn main() -> pollring::Result<()> {
//!     let mut engine = Engine::new(Backend::ReadinessPoll)?;
//!
//!     let listener = TcpListener::bind(&Endpoint::loopback(7878), 128)?;
//!     engine.spawn(async move {
//!         while let Ok(stream) = async_accept(&listener).await {
//!             let mut buf = [0u8; 4096];
//!             while let Ok(n) = async_read_some(&stream, &mut buf).await {
//!                 if n == 0 || async_write_all(&stream, &buf[..n]).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         }
//!     });
//!
//!     engine.run()
//! }
//! ```
//!
//! # Platform
//!
//! Linux only. The readiness-poll backend needs epoll; the completion-poll
//! backend needs an io_uring-capable kernel (5.1+ for poll submissions).

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod epoll;
pub(crate) mod ring;

// ── Public modules ──────────────────────────────────────────────────────
pub mod engine;
pub mod error;
pub mod fd;
pub mod metrics;
pub mod net;
pub mod runtime;

// ── Re-exports: Core types ──────────────────────────────────────────────

/// Backend selector for [`Engine`] construction.
pub use engine::Backend;
/// Ring size used when none is given.
pub use engine::DEFAULT_QUEUE_DEPTH;
/// Owner of one event loop: run/stop/spawn.
pub use engine::Engine;
/// High-level runtime context with user-friendly defaults.
pub use engine::IoContext;
/// Cloneable cross-thread stop signal.
pub use engine::StopHandle;
/// Errno-backed error value.
pub use error::Error;
/// Crate-wide fallible return type.
pub use error::Result;
/// Close a raw descriptor, surfacing the kernel result.
pub use fd::close;
/// Move-only owner of a kernel file descriptor.
pub use fd::UniqueFd;

// ── Re-exports: Networking ──────────────────────────────────────────────

/// IPv4 host/port pair.
pub use net::Endpoint;
/// Nonblocking TCP listener.
pub use net::TcpListener;
/// Nonblocking TCP stream.
pub use net::TcpStream;
/// Classify a connect handshake still in progress.
pub use net::is_in_progress;
/// Classify a transient would-block error.
pub use net::is_would_block;
/// Switch an arbitrary descriptor to nonblocking mode.
pub use net::set_nonblocking;

// ── Re-exports: Async operations ────────────────────────────────────────

/// Accept one connection asynchronously.
pub use runtime::io::async_accept;
/// Connect to a remote endpoint asynchronously.
pub use runtime::io::async_connect;
/// Fill a whole buffer; peer close surfaces `ECONNRESET`.
pub use runtime::io::async_read_exact;
/// Read available bytes asynchronously.
pub use runtime::io::async_read_some;
/// Read with an overall deadline and cooperative cancellation.
pub use runtime::io::async_read_some_with_timeout;
/// Sleep with cooperative cancellation.
pub use runtime::io::async_sleep;
/// Drain a whole buffer; peer close surfaces `EPIPE`.
pub use runtime::io::async_write_all;
/// Write available bytes asynchronously.
pub use runtime::io::async_write_some;
/// Write with an overall deadline and cooperative cancellation.
pub use runtime::io::async_write_some_with_timeout;
/// Suspend until a descriptor is readable.
pub use runtime::io::wait_readable;
/// Suspend until readable or timeout.
pub use runtime::io::wait_readable_for;
/// Suspend until a descriptor is writable.
pub use runtime::io::wait_writable;
/// Suspend until writable or timeout.
pub use runtime::io::wait_writable_for;

// ── Re-exports: Cancellation ────────────────────────────────────────────

/// Owner side of a shared stop flag.
pub use runtime::cancel::CancelSource;
/// Read-only view of a shared stop flag.
pub use runtime::cancel::CancelToken;

// ── Re-exports: Resolver ────────────────────────────────────────────────

/// Resolve a host/service pair off the loop thread.
pub use runtime::resolver::async_resolve;
/// Render an endpoint as `"host:port"`.
pub use runtime::resolver::format_endpoint;
/// Parse `"host:port"` into an [`Endpoint`].
pub use runtime::resolver::parse_ipv4_endpoint;

// ── Re-exports: Queued writer ───────────────────────────────────────────

/// Backpressure state reported by enqueue operations.
pub use runtime::write_queue::BackpressureState;
/// Default high watermark.
pub use runtime::write_queue::DEFAULT_HIGH_WATERMARK;
/// Default low watermark.
pub use runtime::write_queue::DEFAULT_LOW_WATERMARK;
/// Backpressure-aware buffered writer.
pub use runtime::write_queue::QueuedWriter;
/// Queue thresholds for the backpressure state machine.
pub use runtime::write_queue::Watermarks;

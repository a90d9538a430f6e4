//! Worker-thread DNS resolution with an event-loop-friendly handoff.
//!
//! One process-wide worker thread consumes a bounded job queue and runs
//! `getaddrinfo` off the driver thread. The awaiting task polls the job's
//! shared state on a short sleep cadence, observing its cancel token each
//! turn; a cancelled job that the worker has not started yet publishes
//! `ECANCELED` instead of resolving.

use std::ffi::CString;
use std::mem;
use std::net::Ipv4Addr;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::metrics;
use crate::net::Endpoint;
use crate::runtime::cancel::CancelToken;
use crate::runtime::io::async_sleep;

/// Jobs the worker will accept before `async_resolve` reports `EAGAIN`.
const JOB_QUEUE_DEPTH: usize = 64;

/// Cadence at which the awaiting task polls the shared job state.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct ResolveShared {
    result: Mutex<Option<Result<Vec<Endpoint>>>>,
    cancelled: AtomicBool,
}

struct ResolveJob {
    host: String,
    service: String,
    shared: Arc<ResolveShared>,
}

fn worker() -> Option<&'static SyncSender<ResolveJob>> {
    static WORKER: OnceLock<Option<SyncSender<ResolveJob>>> = OnceLock::new();
    WORKER
        .get_or_init(|| {
            let (tx, rx) = sync_channel::<ResolveJob>(JOB_QUEUE_DEPTH);
            let spawned = thread::Builder::new()
                .name("pollring-resolver".into())
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let outcome = if job.shared.cancelled.load(Ordering::Acquire) {
                            Err(Error::from_errno(libc::ECANCELED))
                        } else {
                            resolve_ipv4_tcp(&job.host, &job.service)
                        };
                        if let Ok(mut slot) = job.shared.result.lock() {
                            *slot = Some(outcome);
                        }
                    }
                });
            match spawned {
                Ok(_) => Some(tx),
                Err(_) => None,
            }
        })
        .as_ref()
}

fn enqueue(job: ResolveJob) -> Result<()> {
    let Some(tx) = worker() else {
        return Err(Error::from_errno(libc::EAGAIN));
    };
    match tx.try_send(job) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
            Err(Error::from_errno(libc::EAGAIN))
        }
    }
}

/// Blocking IPv4/TCP resolution with the resolver error namespace folded
/// into errno codes.
fn resolve_ipv4_tcp(host: &str, service: &str) -> Result<Vec<Endpoint>> {
    let host = CString::new(host).map_err(|_| Error::from_errno(libc::EINVAL))?;
    let service = CString::new(service).map_err(|_| Error::from_errno(libc::EINVAL))?;

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = libc::AF_INET;
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_protocol = libc::IPPROTO_TCP;

    let mut raw: *mut libc::addrinfo = ptr::null_mut();
    let status =
        unsafe { libc::getaddrinfo(host.as_ptr(), service.as_ptr(), &hints, &raw mut raw) };
    if status != 0 {
        let mapped = match status {
            libc::EAI_AGAIN => libc::EAGAIN,
            libc::EAI_NONAME => libc::ENOENT,
            libc::EAI_MEMORY => libc::ENOMEM,
            _ => libc::EHOSTUNREACH,
        };
        return Err(Error::from_errno(mapped));
    }

    let mut endpoints = Vec::new();
    let mut cursor = raw;
    while !cursor.is_null() {
        // SAFETY: getaddrinfo returned a well-formed list; cursor is
        // non-null here.
        let info = unsafe { &*cursor };
        if info.ai_family == libc::AF_INET && !info.ai_addr.is_null() {
            // SAFETY: ai_family is AF_INET, so ai_addr points at a
            // sockaddr_in.
            let addr = unsafe { &*(info.ai_addr as *const libc::sockaddr_in) };
            let host = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            endpoints.push(Endpoint::new(host.to_string(), u16::from_be(addr.sin_port)));
        }
        cursor = info.ai_next;
    }
    unsafe { libc::freeaddrinfo(raw) };

    if endpoints.is_empty() {
        return Err(Error::from_errno(libc::ENOENT));
    }
    Ok(endpoints)
}

/// Resolve `host:service` to IPv4 TCP endpoints without blocking the loop.
///
/// The job runs on the process-wide worker thread; this task polls the
/// handoff state every 10 ms. Cancellation is propagated to the worker
/// through the job's shared flag and surfaces `ECANCELED`.
pub async fn async_resolve(
    host: &str,
    service: &str,
    token: CancelToken,
) -> Result<Vec<Endpoint>> {
    if token.stop_requested() {
        return Err(Error::from_errno(libc::ECANCELED));
    }
    if host.is_empty() {
        return Err(Error::from_errno(libc::EINVAL));
    }
    if let Ok(port) = service.parse::<u64>()
        && port > u64::from(u16::MAX)
    {
        return Err(Error::from_errno(libc::EINVAL));
    }

    let shared = Arc::new(ResolveShared {
        result: Mutex::new(None),
        cancelled: AtomicBool::new(false),
    });
    enqueue(ResolveJob {
        host: host.to_owned(),
        service: service.to_owned(),
        shared: shared.clone(),
    })?;
    metrics::RESOLVER_JOBS.increment();

    loop {
        if token.stop_requested() {
            shared.cancelled.store(true, Ordering::Release);
            return Err(Error::from_errno(libc::ECANCELED));
        }

        if let Ok(mut slot) = shared.result.lock()
            && let Some(outcome) = slot.take()
        {
            return outcome;
        }

        async_sleep(POLL_INTERVAL, token.clone()).await?;
    }
}

/// Parse `"host:port"` into an [`Endpoint`].
///
/// Rejects a missing colon, empty halves, a non-decimal or out-of-range
/// port, and a host that is not an IPv4 literal, all with `EINVAL`.
pub fn parse_ipv4_endpoint(value: &str) -> Result<Endpoint> {
    let Some((host, port_text)) = value.rsplit_once(':') else {
        return Err(Error::from_errno(libc::EINVAL));
    };
    if host.is_empty() || port_text.is_empty() {
        return Err(Error::from_errno(libc::EINVAL));
    }

    let mut port: u32 = 0;
    for ch in port_text.chars() {
        let Some(digit) = ch.to_digit(10) else {
            return Err(Error::from_errno(libc::EINVAL));
        };
        port = port * 10 + digit;
        if port > u32::from(u16::MAX) {
            return Err(Error::from_errno(libc::EINVAL));
        }
    }

    if host.parse::<Ipv4Addr>().is_err() {
        return Err(Error::from_errno(libc::EINVAL));
    }

    Ok(Endpoint::new(host, port as u16))
}

/// Render an endpoint as `"host:port"`.
pub fn format_endpoint(endpoint: &Endpoint) -> String {
    endpoint.to_string()
}

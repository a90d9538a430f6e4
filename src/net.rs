//! Nonblocking IPv4 TCP primitives.
//!
//! Streams and listeners are created nonblocking and close-on-exec at socket
//! creation, preferring atomic socket flags with an `fcntl` fallback.
//! Would-block conditions surface unchanged (`EAGAIN`/`EWOULDBLOCK`) so the
//! async layer can translate them into readiness waits.

use std::fmt;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::fd::UniqueFd;

/// An IPv4 host/port pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Build an endpoint from a host string and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// `127.0.0.1:port`.
    pub fn loopback(port: u16) -> Self {
        Endpoint::new("127.0.0.1", port)
    }

    /// `0.0.0.0:port`.
    pub fn wildcard(port: u16) -> Self {
        Endpoint::new("0.0.0.0", port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// `true` when the error is a transient would-block condition.
pub fn is_would_block(err: &Error) -> bool {
    err.value() == libc::EAGAIN || err.value() == libc::EWOULDBLOCK
}

/// `true` when the error reports a connect handshake still in progress.
pub fn is_in_progress(err: &Error) -> bool {
    err.value() == libc::EINPROGRESS
}

/// Switch an arbitrary descriptor to nonblocking mode via `fcntl`.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Err(Error::from_errno(libc::EBADF));
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

fn to_sockaddr(endpoint: &Endpoint) -> Result<libc::sockaddr_in> {
    let host: Ipv4Addr = endpoint
        .host
        .parse()
        .map_err(|_| Error::from_errno(libc::EINVAL))?;
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = endpoint.port.to_be();
    addr.sin_addr.s_addr = u32::from(host).to_be();
    Ok(addr)
}

fn new_stream_socket() -> Result<UniqueFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
        )
    };
    if fd >= 0 {
        return Ok(UniqueFd::new(fd));
    }

    // Kernels without atomic socket flags: create blocking, then fcntl.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    let owned = UniqueFd::new(fd);
    set_nonblocking(owned.get())?;
    Ok(owned)
}

fn set_reuse_addr(fd: RawFd) -> Result<()> {
    let enabled: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&raw const enabled).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// A connected (or connecting) nonblocking TCP stream.
#[derive(Debug)]
pub struct TcpStream {
    fd: UniqueFd,
}

impl TcpStream {
    pub(crate) fn from_fd(fd: UniqueFd) -> Self {
        TcpStream { fd }
    }

    /// Start a nonblocking connect. `EINPROGRESS` counts as success; the
    /// caller must await writability and then call
    /// [`finish_connect`](Self::finish_connect).
    pub fn connect(remote: &Endpoint) -> Result<TcpStream> {
        let addr = to_sockaddr(remote)?;
        let fd = new_stream_socket()?;

        let rc = unsafe {
            libc::connect(
                fd.get(),
                (&raw const addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            return Ok(TcpStream { fd });
        }

        let err = Error::last_os_error();
        if is_in_progress(&err) {
            return Ok(TcpStream { fd });
        }
        Err(err)
    }

    /// Read `SO_ERROR` after a writability wake; nonzero maps to an error.
    pub fn finish_connect(&self) -> Result<()> {
        if !self.valid() {
            return Err(Error::from_errno(libc::EBADF));
        }
        let mut socket_error: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd.get(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&raw mut socket_error).cast(),
                &raw mut len,
            )
        };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        if socket_error == 0 {
            Ok(())
        } else {
            Err(Error::from_errno(socket_error))
        }
    }

    /// Read whatever is available. `Ok(0)` means the peer closed; would-block
    /// surfaces unchanged.
    pub fn read_some(&self, buffer: &mut [u8]) -> Result<usize> {
        if !self.valid() {
            return Err(Error::from_errno(libc::EBADF));
        }
        if buffer.is_empty() {
            return Ok(0);
        }
        let count = unsafe {
            libc::recv(
                self.fd.get(),
                buffer.as_mut_ptr().cast(),
                buffer.len(),
                0,
            )
        };
        if count < 0 {
            return Err(Error::last_os_error());
        }
        Ok(count as usize)
    }

    /// Write whatever fits. Sends use `MSG_NOSIGNAL`; would-block surfaces
    /// unchanged.
    pub fn write_some(&self, buffer: &[u8]) -> Result<usize> {
        if !self.valid() {
            return Err(Error::from_errno(libc::EBADF));
        }
        if buffer.is_empty() {
            return Ok(0);
        }
        let count = unsafe {
            libc::send(
                self.fd.get(),
                buffer.as_ptr().cast(),
                buffer.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if count < 0 {
            return Err(Error::last_os_error());
        }
        Ok(count as usize)
    }

    /// Shut down the write half.
    pub fn shutdown_write(&self) -> Result<()> {
        if !self.valid() {
            return Err(Error::from_errno(libc::EBADF));
        }
        if unsafe { libc::shutdown(self.fd.get(), libc::SHUT_WR) } == 0 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }

    /// Set `SO_SNDBUF`. Rejects non-positive sizes with `EINVAL`.
    pub fn set_send_buffer_size(&self, bytes: i32) -> Result<()> {
        if !self.valid() {
            return Err(Error::from_errno(libc::EBADF));
        }
        if bytes <= 0 {
            return Err(Error::from_errno(libc::EINVAL));
        }
        let rc = unsafe {
            libc::setsockopt(
                self.fd.get(),
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                (&raw const bytes).cast(),
                mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }

    /// The underlying descriptor.
    pub fn native_handle(&self) -> RawFd {
        self.fd.get()
    }

    /// Whether the stream owns a descriptor.
    pub fn valid(&self) -> bool {
        self.fd.valid()
    }
}

/// A nonblocking TCP listener.
#[derive(Debug)]
pub struct TcpListener {
    fd: UniqueFd,
}

impl TcpListener {
    /// Bind and listen. Enables `SO_REUSEADDR` before binding.
    pub fn bind(local: &Endpoint, backlog: i32) -> Result<TcpListener> {
        let addr = to_sockaddr(local)?;
        let fd = new_stream_socket()?;
        set_reuse_addr(fd.get())?;

        let rc = unsafe {
            libc::bind(
                fd.get(),
                (&raw const addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        if unsafe { libc::listen(fd.get(), backlog) } != 0 {
            return Err(Error::last_os_error());
        }
        Ok(TcpListener { fd })
    }

    /// Accept one connection as a nonblocking close-on-exec stream.
    pub fn accept(&self) -> Result<TcpStream> {
        if !self.valid() {
            return Err(Error::from_errno(libc::EBADF));
        }
        let accepted = unsafe {
            libc::accept4(
                self.fd.get(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            )
        };
        if accepted < 0 {
            return Err(Error::last_os_error());
        }
        Ok(TcpStream::from_fd(UniqueFd::new(accepted)))
    }

    /// The port the listener is bound to.
    pub fn local_port(&self) -> Result<u16> {
        if !self.valid() {
            return Err(Error::from_errno(libc::EBADF));
        }
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd.get(),
                (&raw mut addr).cast::<libc::sockaddr>(),
                &raw mut len,
            )
        };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(u16::from_be(addr.sin_port))
    }

    /// The underlying descriptor.
    pub fn native_handle(&self) -> RawFd {
        self.fd.get()
    }

    /// Whether the listener owns a descriptor.
    pub fn valid(&self) -> bool {
        self.fd.valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn endpoint_constructors_and_display() {
        assert_eq!(Endpoint::loopback(8080).to_string(), "127.0.0.1:8080");
        assert_eq!(Endpoint::wildcard(0).to_string(), "0.0.0.0:0");
    }

    #[test]
    fn errno_classifiers() {
        assert!(is_would_block(&Error::from_errno(libc::EAGAIN)));
        assert!(is_would_block(&Error::from_errno(libc::EWOULDBLOCK)));
        assert!(!is_would_block(&Error::from_errno(libc::EPIPE)));
        assert!(is_in_progress(&Error::from_errno(libc::EINPROGRESS)));
        assert!(!is_in_progress(&Error::from_errno(libc::EAGAIN)));
    }

    #[test]
    fn connect_rejects_non_ipv4_host() {
        let err = TcpStream::connect(&Endpoint::new("not-an-ip", 80)).unwrap_err();
        assert_eq!(err.value(), libc::EINVAL);
    }

    #[test]
    fn bind_ephemeral_reports_port() {
        let listener = TcpListener::bind(&Endpoint::loopback(0), 8).unwrap();
        assert!(listener.local_port().unwrap() > 0);
    }

    #[test]
    fn accept_without_pending_connection_would_block() {
        let listener = TcpListener::bind(&Endpoint::loopback(0), 8).unwrap();
        let err = listener.accept().unwrap_err();
        assert!(is_would_block(&err));
    }

    #[test]
    fn loopback_connect_and_exchange() {
        let listener = TcpListener::bind(&Endpoint::loopback(0), 8).unwrap();
        let port = listener.local_port().unwrap();

        let client = TcpStream::connect(&Endpoint::loopback(port)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let server = loop {
            match listener.accept() {
                Ok(stream) => break stream,
                Err(err) if is_would_block(&err) => {
                    assert!(Instant::now() < deadline, "accept timed out");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => panic!("accept failed: {err}"),
            }
        };

        // Loopback handshakes settle quickly; poll until SO_ERROR clears.
        loop {
            match client.finish_connect() {
                Ok(()) => break,
                Err(err) if is_in_progress(&err) || is_would_block(&err) => {
                    assert!(Instant::now() < deadline, "connect timed out");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => panic!("finish_connect failed: {err}"),
            }
        }

        assert_eq!(client.write_some(b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        let got = loop {
            match server.read_some(&mut buf) {
                Ok(n) => break n,
                Err(err) if is_would_block(&err) => {
                    assert!(Instant::now() < deadline, "read timed out");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => panic!("read failed: {err}"),
            }
        };
        assert_eq!(&buf[..got], b"ping");
    }

    #[test]
    fn empty_buffers_short_circuit() {
        let listener = TcpListener::bind(&Endpoint::loopback(0), 8).unwrap();
        let port = listener.local_port().unwrap();
        let client = TcpStream::connect(&Endpoint::loopback(port)).unwrap();
        assert_eq!(client.read_some(&mut []).unwrap(), 0);
        assert_eq!(client.write_some(&[]).unwrap(), 0);
    }

    #[test]
    fn set_send_buffer_size_rejects_non_positive() {
        let listener = TcpListener::bind(&Endpoint::loopback(0), 8).unwrap();
        let port = listener.local_port().unwrap();
        let client = TcpStream::connect(&Endpoint::loopback(port)).unwrap();
        assert_eq!(
            client.set_send_buffer_size(0).unwrap_err().value(),
            libc::EINVAL
        );
        client.set_send_buffer_size(16 * 1024).unwrap();
    }
}

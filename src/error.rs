//! Errno-backed error values.
//!
//! Every fallible operation in this crate returns [`Result`]. Errors are
//! plain values carrying a code from the errno namespace; there is no
//! panicking error path on I/O routes. Foreign errors (std, io_uring crate)
//! are folded into the same namespace via `From<std::io::Error>`.

use std::io;

use thiserror::Error as ThisError;

fn strerror(code: &i32) -> io::Error {
    io::Error::from_raw_os_error(*code)
}

/// An error carrying a raw errno value.
///
/// A zero code means "no error"; because fallible operations return
/// [`Result`], a zero-coded `Error` only exists when a caller constructs one
/// explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
#[error("{}", strerror(.code))]
pub struct Error {
    code: i32,
}

impl Error {
    /// Wrap a raw errno value.
    pub const fn from_errno(code: i32) -> Self {
        Error { code }
    }

    /// Capture the calling thread's current `errno`.
    pub fn last_os_error() -> Self {
        Error {
            code: io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EINVAL),
        }
    }

    /// The raw errno value.
    pub const fn value(&self) -> i32 {
        self.code
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error {
            code: err.raw_os_error().unwrap_or(libc::EINVAL),
        }
    }
}

/// Crate-wide fallible return type.
pub type Result<T> = std::result::Result<T, Error>;

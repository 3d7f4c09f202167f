// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::ErrorKind;

use thiserror::Error;

/// Any error that may be returned by a pipe file or by the completion registry behind it.
///
/// Callers see either data, one of the distinguished stream conditions ([`EndOfStream`][1],
/// [`Closing`][2], [`TimedOut`][3]) or an operating system error code forwarded verbatim.
/// Registry plumbing (dropped or spurious completion notifications) is never reported here.
///
/// # Thread safety
///
/// This type is thread-safe.
///
/// [1]: Error::EndOfStream
/// [2]: Error::Closing
/// [3]: Error::TimedOut
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer has closed its end of the pipe and no more data will arrive.
    ///
    /// A broken pipe reported by a read is translated into this, as it is the
    /// expected way for a stream to terminate.
    #[error("end of stream")]
    EndOfStream,

    /// The pipe file has been closed (or is being closed) and no longer admits new operations.
    #[error("the pipe file is closing")]
    Closing,

    /// A timed operation did not complete in time and was canceled. No bytes were transferred.
    #[error("operation timed out and was canceled")]
    TimedOut,

    /// The operating system reported an error for the operation.
    #[error(transparent)]
    Os(#[from] OsError),

    /// An internal contract was violated, e.g. a completion channel was closed without a result.
    ///
    /// Note: a contract violation that indicates memory safety has been violated will
    /// panic instead of returning an error result.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// We are forwarding an error received from the standard library's APIs.
    #[error(transparent)]
    StdIo(#[from] std::io::Error),
}

/// A specialized `Result` for use with pipe file operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An operating system error code, as returned by `GetLastError()` or carried in a
/// completion notification.
///
/// The code is kept as a plain number so that it can be reported identically by the real Windows
/// bindings and by the in-process simulation.
#[derive(Clone, Copy, Debug, Eq, Error, Hash, PartialEq)]
#[error("OS error {0}")]
pub struct OsError(pub u32);

impl OsError {
    /// The raw error code.
    #[must_use]
    pub const fn code(self) -> u32 {
        self.0
    }
}

impl From<OsError> for std::io::Error {
    fn from(value: OsError) -> Self {
        #[expect(
            clippy::cast_possible_wrap,
            reason = "Win32 error codes are reinterpreted as raw OS errors by the standard library"
        )]
        Self::from_raw_os_error(value.0 as i32)
    }
}

/// Represents the pipe I/O error as a standard I/O error.
/// This is used by the `std::io::Read` and `std::io::Write` implementations of pipe files.
impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::StdIo(error) => error,
            Error::Os(error) => error.into(),
            Error::EndOfStream => Self::new(ErrorKind::UnexpectedEof, value),
            Error::Closing => Self::new(ErrorKind::NotConnected, value),
            Error::TimedOut => Self::new(ErrorKind::TimedOut, value),
            Error::ContractViolation(_) => Self::other(value),
        }
    }
}

//! TNFS error type.
//!
//! Every failure a handler or a client call can produce is one of:
//! - `Error::No`, a TNFS result code, which travels on the wire;
//! - `Error::Io`, a local I/O failure, mapped to the nearest result code
//!   when it has to be reported to a peer;
//! - `Error::Protocol`, a malformed or desynchronized exchange, which is
//!   fatal to the connection and never reported as a result code;
//! - `Error::Timeout`, no reply arrived in time (client side only).

use std::{error as stderror, fmt, io};

use crate::fcall::ResultCode;

/// Classification of a failure, as seen by users of the client
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AccessDenied,
    Exists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    ReadOnly,
    InvalidArgument,
    OutOfBuffers,
    TooManySymlinks,
    Unsupported,
    EndOfData,
    /// Any other result code and local I/O failures
    Io,
    Timeout,
    Protocol,
}

/// Error type of this crate
#[derive(Debug)]
pub enum Error {
    /// Result code returned by, or destined for, the peer
    No(ResultCode),
    /// Local I/O failure
    Io(io::Error),
    /// Malformed message or desynchronized exchange
    Protocol(String),
    /// No reply within the configured timeout
    Timeout,
}

impl Error {
    /// Result code to send to a peer for this error.
    pub fn result_code(&self) -> ResultCode {
        match *self {
            Error::No(code) => code,
            Error::Io(ref e) => result_code_of(e),
            Error::Protocol(_) => ResultCode::EPROTO,
            Error::Timeout => ResultCode::EAGAIN,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        use crate::ResultCode::*;

        let code = match *self {
            Error::No(code) => code,
            Error::Io(ref e) => result_code_of(e),
            Error::Protocol(_) => return ErrorKind::Protocol,
            Error::Timeout => return ErrorKind::Timeout,
        };

        match code {
            ENOENT | ENXIO => ErrorKind::NotFound,
            EPERM | EACCES => ErrorKind::AccessDenied,
            EEXIST => ErrorKind::Exists,
            ENOTDIR => ErrorKind::NotADirectory,
            EISDIR => ErrorKind::IsADirectory,
            ENOTEMPTY => ErrorKind::DirectoryNotEmpty,
            EROFS => ErrorKind::ReadOnly,
            EINVAL | EBADF | EBADFD | InvalidHandle | ENAMETOOLONG | ESPIPE => {
                ErrorKind::InvalidArgument
            }
            ENOMEM | ENFILE | EMFILE | ENOBUFS => ErrorKind::OutOfBuffers,
            ELOOP => ErrorKind::TooManySymlinks,
            ENOSYS => ErrorKind::Unsupported,
            EOF => ErrorKind::EndOfData,
            _ => ErrorKind::Io,
        }
    }

    /// Whether this error marks the end of a file or a directory listing.
    pub fn is_eof(&self) -> bool {
        self.kind() == ErrorKind::EndOfData
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Nearest result code for a local I/O error
pub fn result_code_of(e: &io::Error) -> ResultCode {
    use std::io::ErrorKind::*;

    match e.kind() {
        NotFound => ResultCode::ENOENT,
        PermissionDenied => ResultCode::EACCES,
        AlreadyExists => ResultCode::EEXIST,
        NotADirectory => ResultCode::ENOTDIR,
        IsADirectory => ResultCode::EISDIR,
        DirectoryNotEmpty => ResultCode::ENOTEMPTY,
        ReadOnlyFilesystem => ResultCode::EROFS,
        InvalidInput => ResultCode::EINVAL,
        Unsupported => ResultCode::ENOSYS,
        StorageFull => ResultCode::ENOSPC,
        FileTooLarge => ResultCode::EFBIG,
        NotSeekable => ResultCode::ESPIPE,
        OutOfMemory => ResultCode::ENOMEM,
        ResourceBusy => ResultCode::EBUSY,
        WouldBlock => ResultCode::EAGAIN,
        StaleNetworkFileHandle => ResultCode::ESTALE,
        UnexpectedEof => ResultCode::EOF,
        _ => ResultCode::EIO,
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::No(ref code) => write!(f, "{}", code.description()),
            Error::Io(ref e) => write!(f, "{}", e),
            Error::Protocol(ref msg) => write!(f, "protocol error: {}", msg),
            Error::Timeout => write!(f, "timed out waiting for reply"),
        }
    }
}

impl stderror::Error for Error {
    fn source(&self) -> Option<&(dyn stderror::Error + 'static)> {
        match *self {
            Error::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ResultCode> for Error {
    fn from(code: ResultCode) -> Self {
        Error::No(code)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

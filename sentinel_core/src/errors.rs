//! Error handling and C-ABI error codes for sentinel

use std::cell::Cell;
use std::fmt;
use std::os::raw::c_char;

/// Failure reported by an action handler. Opaque to the engine: it is
/// propagated unchanged out of dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub code: i32,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler failed with code {}: {}", self.code, self.message)
    }
}

impl std::error::Error for HandlerError {}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("label longer than {max} bytes (got {len})")]
    StringArgTooLong { len: usize, max: usize },
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("system resource allocation failed")]
    SysResourceFailed,
    #[error("item not found")]
    ItemNotFound,
    #[error("item already present")]
    ItemAlreadyPresent,
    #[error("dispatch invoked on an already stopped result")]
    AlreadyStopped,
    #[error("item is referenced and cannot be removed")]
    Busy,
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArg(_) => ErrorCode::InvalidArg,
            Error::StringArgTooLong { .. } => ErrorCode::StringArgTooLong,
            Error::BufferTooSmall { .. } => ErrorCode::BufferTooSmall,
            Error::SysResourceFailed => ErrorCode::SysResourceFailed,
            Error::ItemNotFound => ErrorCode::ItemNotFound,
            Error::ItemAlreadyPresent => ErrorCode::ItemAlreadyPresent,
            Error::AlreadyStopped => ErrorCode::AlreadyStopped,
            Error::Busy => ErrorCode::Busy,
            Error::Handler(_) => ErrorCode::HandlerFailed,
        }
    }
}

/// Signed C-ABI result: zero is success, every error is negative.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    InvalidArg = -1,
    StringArgTooLong = -2,
    BufferTooSmall = -3,
    SysResourceFailed = -4,
    ItemNotFound = -5,
    ItemAlreadyPresent = -6,
    AlreadyStopped = -7,
    Busy = -8,
    HandlerFailed = -9,
    InvalidHandle = -10,
    Utf8Error = -11,
    Unknown = -255,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::InvalidArg => "Invalid argument",
            ErrorCode::StringArgTooLong => "String argument too long",
            ErrorCode::BufferTooSmall => "Buffer too small",
            ErrorCode::SysResourceFailed => "System resource allocation failed",
            ErrorCode::ItemNotFound => "Item not found",
            ErrorCode::ItemAlreadyPresent => "Item already present",
            ErrorCode::AlreadyStopped => "Already stopped",
            ErrorCode::Busy => "Busy",
            ErrorCode::HandlerFailed => "Action handler failed",
            ErrorCode::InvalidHandle => "Invalid handle",
            ErrorCode::Utf8Error => "UTF-8 conversion error",
            ErrorCode::Unknown => "Unknown error",
        }
    }

    /// NUL-terminated twin of [`ErrorCode::as_str`] for C callers.
    fn as_cstr(self) -> &'static [u8] {
        match self {
            ErrorCode::Success => b"Success\0",
            ErrorCode::InvalidArg => b"Invalid argument\0",
            ErrorCode::StringArgTooLong => b"String argument too long\0",
            ErrorCode::BufferTooSmall => b"Buffer too small\0",
            ErrorCode::SysResourceFailed => b"System resource allocation failed\0",
            ErrorCode::ItemNotFound => b"Item not found\0",
            ErrorCode::ItemAlreadyPresent => b"Item already present\0",
            ErrorCode::AlreadyStopped => b"Already stopped\0",
            ErrorCode::Busy => b"Busy\0",
            ErrorCode::HandlerFailed => b"Action handler failed\0",
            ErrorCode::InvalidHandle => b"Invalid handle\0",
            ErrorCode::Utf8Error => b"UTF-8 conversion error\0",
            ErrorCode::Unknown => b"Unknown error\0",
        }
    }

    pub fn is_success(self) -> bool {
        (self as i32) >= 0
    }
}

impl From<&Error> for ErrorCode {
    fn from(e: &Error) -> Self {
        e.code()
    }
}

// Thread-local last error for C-ABI
thread_local! {
    static LAST_ERROR: Cell<ErrorCode> = const { Cell::new(ErrorCode::Success) };
}

pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|cell| cell.set(code));
}

pub fn get_last_error() -> ErrorCode {
    LAST_ERROR.with(|cell| cell.get())
}

#[no_mangle]
pub extern "C" fn sentinel_last_error() -> ErrorCode {
    get_last_error()
}

#[no_mangle]
pub extern "C" fn sentinel_strerror(code: ErrorCode) -> *const c_char {
    code.as_cstr().as_ptr() as *const c_char
}

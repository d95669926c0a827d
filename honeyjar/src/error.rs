use std::io;

use thiserror::Error as ThisError;

/// Not exported by libc: the kernel-internal "operation not supported" code
/// that leaks out of `bpf(2)`.
pub(crate) const ENOTSUPP: i32 = 524;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(ThisError, Debug)]
pub enum Error {
    /// The host kernel lacks a capability. Callers should skip, not fail.
    #[error("{what} not supported: {reason}")]
    NotSupported { what: String, reason: String },

    #[error("{what} size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("map {name} is incompatible with its replacement: {reason}")]
    Incompatible { name: String, reason: String },

    #[error("reader closed")]
    ReaderClosed,

    #[error("read deadline exceeded")]
    DeadlineExceeded,

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("key not found")]
    KeyNotFound,

    #[error("program {name} rejected: {source}\n{log}")]
    Verifier {
        name: String,
        #[source]
        source: io::Error,
        log: String,
    },

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    PerfBuffer(#[from] aya::maps::perf::PerfBufferError),

    #[error("{call} failed")]
    Syscall {
        call: &'static str,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Error::NotSupported { .. })
    }

    pub(crate) fn not_supported(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::NotSupported {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// Maps an errno from a kernel call onto the taxonomy. Capability errors
    /// become [`Error::NotSupported`]; everything else stays a syscall error.
    pub(crate) fn from_errno(call: &'static str, what: impl Into<String>, source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::EPERM) => Error::not_supported(what, "insufficient privilege"),
            Some(libc::ENOSYS) => Error::not_supported(what, "bpf syscall unavailable"),
            Some(libc::EOPNOTSUPP) | Some(ENOTSUPP) => {
                Error::not_supported(what, "not supported by this kernel")
            }
            _ => Error::Syscall { call, source },
        }
    }
}

/// Reports whether `err`, or anything it wraps, is [`Error::NotSupported`].
pub fn is_not_supported(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<Error>(), Some(e) if e.is_not_supported()))
}

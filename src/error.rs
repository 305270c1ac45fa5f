// SPDX-License-Identifier: MIT

use std::fmt;

/// Error taxonomy for the device core.
///
/// `WriteVerificationFailed` and `InternalInvariant` are fatal from the
/// core's perspective: callers that observe them from the request path may
/// propagate them, but the barrier and flusher paths that detect them
/// outside of a caller's direct control escalate by panicking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed or inconsistent configuration; raised only at activation.
    BadConfig(String),
    /// Request extent exceeds device capacity.
    OutOfRange,
    /// Allocation failure during activation or buffer/slot setup.
    OutOfMemory,
    /// A `wrverify` readback mismatched what was just written.
    WriteVerificationFailed { pbn: u64 },
    /// A `checksum` readback mismatched the stored CRC; non-fatal.
    ChecksumMismatch { pbn: u64 },
    /// Ring-position or PBI/BBI linkage inconsistency.
    InternalInvariant(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadConfig(msg) => write!(f, "bad config: {msg}"),
            Error::OutOfRange => write!(f, "request extent out of range"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::WriteVerificationFailed { pbn } => {
                write!(f, "write verification failed at block {pbn}")
            }
            Error::ChecksumMismatch { pbn } => {
                write!(f, "checksum mismatch at block {pbn}")
            }
            Error::InternalInvariant(what) => write!(f, "internal invariant violated: {what}"),
        }
    }
}

impl std::error::Error for Error {}

pub type EResult<T> = Result<T, Error>;

impl Error {
    /// Whether this error kind is fatal and should never be swallowed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::WriteVerificationFailed { .. } | Error::InternalInvariant(_)
        )
    }
}

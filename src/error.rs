//! Job-level failure categories that callers may want to tell apart.
//!
//! Internals return `anyhow::Result`; a `MergeError` travels inside the
//! `anyhow::Error` and can be recovered with `err.downcast_ref::<MergeError>()`.

use crate::governor::Phase;
use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum MergeError {
    /// Pre-flight configuration problems. Always fatal, no I/O was attempted.
    Validation(Vec<String>),
    /// The error governor asked the job to stop (fail-fast or error ceiling reached).
    Aborted { phase: Phase, reason: String },
    /// A bounded wait (read phase, pool drain) ran out.
    Timeout { what: &'static str, after: Duration },
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(errors) => write!(f, "config validation failed: {}", errors.join(", ")),
            Self::Aborted { phase, reason } => write!(f, "aborted during {} phase: {}", phase, reason),
            Self::Timeout { what, after } => write!(f, "{} timed out after {:?}", what, after),
        }
    }
}

impl std::error::Error for MergeError {}

impl MergeError {
    pub fn aborted(phase: Phase, reason: impl Into<String>) -> Self {
        Self::Aborted { phase, reason: reason.into() }
    }

    /// True if `err` (or anything in its context chain) is a governor abort.
    pub fn is_abort(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|e| matches!(e.downcast_ref::<MergeError>(), Some(MergeError::Aborted { .. })))
    }
}

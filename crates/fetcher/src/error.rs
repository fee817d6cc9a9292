use std::fmt;

use time::OffsetDateTime;

use crate::{iso8601, TimeWindow};

/// A single failed request against the backend.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("error sending request: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("backend rejected query ({status} {error_type}): {message}")]
    Backend {
        status: u16,
        error_type: String,
        message: String,
    },
    #[error("unexpected response body: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Whether repeating the identical request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(_) => true,
            FetchError::Status { status, .. } => transient_status(*status),
            FetchError::Backend {
                status, error_type, ..
            } => {
                transient_status(*status)
                    || matches!(error_type.as_str(), "timeout" | "unavailable" | "internal")
            }
            FetchError::Malformed(_) => false,
        }
    }
}

fn transient_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

/// What a failed request was asking the backend for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchTarget {
    Window(TimeWindow),
    Instant(Option<OffsetDateTime>),
    LabelValues(String),
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchTarget::Window(window) => write!(f, "window {}", window),
            FetchTarget::Instant(Some(at)) => write!(f, "instant query at {}", iso8601(*at)),
            FetchTarget::Instant(None) => write!(f, "instant query"),
            FetchTarget::LabelValues(label) => write!(f, "values of label {}", label),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AcquireError {
    #[error("invalid range: end {} is before start {}", iso8601(*end), iso8601(*start))]
    InvalidRange {
        start: OffsetDateTime,
        end: OffsetDateTime,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{target} failed after {attempts} attempt(s): {cause}")]
    WindowFetchFailed {
        target: FetchTarget,
        attempts: u32,
        cause: FetchError,
    },
    #[error("{target} returned a malformed response: {reason}")]
    MalformedResponse { target: FetchTarget, reason: String },
    #[error("backend rejected {target}: {cause}")]
    FatalBackend { target: FetchTarget, cause: FetchError },
    #[error("no data: {failed} of {windows} window(s) failed and none returned samples")]
    NoData { windows: usize, failed: usize },
    #[error("acquisition cancelled")]
    Cancelled,
    #[error("acquisition exceeded its deadline of {0:?}")]
    TimedOut(std::time::Duration),
}

impl AcquireError {
    /// Per-window failures are skipped; everything else ends the acquisition.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            AcquireError::WindowFetchFailed { .. } | AcquireError::MalformedResponse { .. }
        )
    }

    /// Classify the last error seen for `target` once retries are over.
    pub(crate) fn from_fetch(target: FetchTarget, attempts: u32, cause: FetchError) -> Self {
        match cause {
            FetchError::Malformed(reason) => AcquireError::MalformedResponse { target, reason },
            cause if cause.is_transient() => AcquireError::WindowFetchFailed {
                target,
                attempts,
                cause,
            },
            cause => AcquireError::FatalBackend { target, cause },
        }
    }
}

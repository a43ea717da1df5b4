use core::error::Error;
use core::fmt;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;

/// HTTP-style status shared by client-side and server-side throttling.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Sub-status that marks a rejection as local admission control rather than
/// server throttling.
pub const THROUGHPUT_CONTROL_SUB_STATUS: u32 = 10003;

/// Setup-time errors raised while registering and initializing control groups.
#[derive(Debug, Display, Clone, PartialEq)]
pub enum ThroughputControlError {
    /// A group with the same name but different settings is already registered.
    #[display("throughput control group `{group_name}` already exists with a different configuration")]
    GroupConflict { group_name: String },
    /// A second default group was registered.
    #[display("A default group already exists")]
    DefaultGroupConflict { existing: String },
    /// Configuration is invalid or inconsistent.
    #[display("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
    /// A request named a group that was never registered.
    #[display("throughput control group `{group_name}` does not exist")]
    UnknownGroup { group_name: String },
    /// The shared control record was written with an unsupported schema.
    #[display("control record schema version {found} is not supported, expected {expected}")]
    SchemaMismatch { found: u32, expected: u32 },
    /// The group could not be brought up and `suppress_init_error` was not set.
    #[display("failed to initialize throughput control group `{group_name}`")]
    InitializationFailed { group_name: String },
    /// The provisioned throughput of the resource could not be resolved.
    #[display("provisioned throughput of `{resource_id}` is unavailable")]
    ProvisionedThroughputUnavailable { resource_id: String },
    /// The shared control store could not be reached for a reconciliation round.
    #[display("control store unavailable for group `{group_name}`")]
    ControlStoreUnavailable { group_name: String },
    /// The controller was closed.
    #[display("throughput controller is closed")]
    Closed,
}

impl Error for ThroughputControlError {}

impl ThroughputControlError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by a [`ControlRecordStore`](crate::ControlRecordStore).
#[derive(Debug, Display, Clone, PartialEq)]
pub enum StoreError {
    /// The store is transiently unreachable.
    #[display("control store unavailable: {reason}")]
    Unavailable { reason: String },
    /// A stored document could not be decoded.
    #[display("control record is malformed: {reason}")]
    Malformed { reason: String },
    /// A stored document was written with a schema version this crate does not read.
    #[display("control record has unsupported schema version {found}")]
    UnsupportedSchema { found: u32 },
}

impl Error for StoreError {}

impl StoreError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Local admission rejection.
///
/// Shares the status code and retry-after contract of server-side throttling so
/// existing retry logic applies, but carries [`THROUGHPUT_CONTROL_SUB_STATUS`].
#[derive(Debug, Display, Clone, PartialEq)]
#[display(
    "request rate is too large for throughput control group `{group_name}` \
     (status {status_code}, sub-status {sub_status_code}, available {available_throughput:.2}), \
     retry after {retry_after:?}"
)]
pub struct ThrottledError {
    pub group_name: String,
    pub status_code: u16,
    pub sub_status_code: u32,
    pub retry_after: Duration,
    /// Available throughput observed at the rejected admission check.
    pub available_throughput: f64,
    /// Charge the request declared up front, when it declared one.
    pub estimated_charge: Option<f64>,
}

impl Error for ThrottledError {}

impl ThrottledError {
    pub fn new(
        group_name: impl Into<String>,
        retry_after: Duration,
        available_throughput: f64,
        estimated_charge: Option<f64>,
    ) -> Self {
        Self {
            group_name: group_name.into(),
            status_code: TOO_MANY_REQUESTS,
            sub_status_code: THROUGHPUT_CONTROL_SUB_STATUS,
            retry_after,
            available_throughput,
            estimated_charge,
        }
    }

    /// True when the rejection came from local admission control.
    pub fn is_client_side(&self) -> bool {
        self.status_code == TOO_MANY_REQUESTS
            && self.sub_status_code == THROUGHPUT_CONTROL_SUB_STATUS
    }

    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Outcome of a regulated request that did not produce a response.
///
/// `Executor` hands back the operation's own error untouched.
#[derive(Debug)]
pub enum RequestError<E> {
    /// Rejected by local admission control; the operation was never invoked.
    Throttled(ThrottledError),
    /// Cancelled before the operation produced its terminal outcome.
    Cancelled,
    /// The request named a group that cannot be resolved.
    Configuration(Report<ThroughputControlError>),
    /// The operation itself failed.
    Executor(E),
}

impl<E> RequestError<E> {
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn throttled(&self) -> Option<&ThrottledError> {
        match self {
            Self::Throttled(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_executor(self) -> Option<E> {
        match self {
            Self::Executor(err) => Some(err),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RequestError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Throttled(err) => err.fmt(f),
            Self::Cancelled => f.write_str("request cancelled"),
            Self::Configuration(report) => write!(f, "{}", report.current_context()),
            Self::Executor(err) => err.fmt(f),
        }
    }
}

impl<E: Error + 'static> Error for RequestError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Throttled(err) => Some(err),
            Self::Executor(err) => Some(err),
            Self::Cancelled | Self::Configuration(_) => None,
        }
    }
}

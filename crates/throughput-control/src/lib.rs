//! Client-side throughput control for a shared, fixed-capacity backend resource.
//!
//! Several logical workloads share one provisioned cost budget. Each workload is a
//! named control group with its own local admission control:
//!
//! - [`ControlGroupRegistry`]: named group configurations with a single default group
//! - [`RequestThrottler`]: O(1) admission with deferred ("charge after the fact") accounting
//! - [`GroupSelector`]: routes a request to its group's throttler, or leaves it unregulated
//! - [`GlobalThroughputCoordinator`]: shares a group's budget fairly across client processes
//!   through a [`ControlRecordStore`]
//! - [`LinkedCancellationTokenSource`]: hierarchical cancellation used for teardown
//!
//! [`ThroughputController`] ties these together for one target resource and owns the
//! background renewal loops.

use error_stack::Report;

mod atomic;
mod cancellation;
mod charge;
mod config;
mod controller;
mod coordinator;
mod error;
mod provisioned;
mod registry;
mod selector;
mod store;
mod throttler;

/// Result type using error-stack for context-rich error reporting
pub type Result<T, C> = core::result::Result<T, Report<C>>;

pub use cancellation::{LinkedCancellationToken, LinkedCancellationTokenSource};
pub use charge::{ChargedResponse, RequestCharge, RequestDescriptor, RequestOptions};
pub use atomic::AtomicF64;
pub use config::{
    deserialize_f64_from_string, deserialize_optional_f64_from_string, ControlGroupConfig,
    ControllerSettings, GlobalControlConfig, ThroughputTarget, MIN_RENEW_INTERVAL,
};
pub use controller::ThroughputController;
pub use coordinator::GlobalThroughputCoordinator;
pub use error::{
    RequestError, StoreError, ThrottledError, ThroughputControlError,
    THROUGHPUT_CONTROL_SUB_STATUS, TOO_MANY_REQUESTS,
};
pub use provisioned::{FixedProvisionedThroughput, ProvisionedThroughputSource};
pub use registry::ControlGroupRegistry;
pub use selector::{GroupSelector, ResolvedGroup};
pub use store::{
    CasOutcome, ClientLease, ControlRecord, ControlRecordStore, InMemoryControlStore,
    CONTROL_RECORD_SCHEMA_VERSION,
};
pub use throttler::{CycleStats, RequestThrottler};

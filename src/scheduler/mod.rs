//! Scan scheduling and dispatch.
//!
//! The [`Scheduler`] expands a submitted scan into stage tasks, dispatches
//! tasks whose dependencies have succeeded, and applies worker completion
//! reports (retry with backoff, failure cascade, cancellation, finalization).
//!
//! It is a synchronous state machine over a [`crate::store::TaskStore`]; the
//! async control loop that drives it lives in [`crate::runtime`].

mod backoff;
mod dispatcher;
mod event;
mod snapshot;

pub use backoff::BackoffPolicy;
pub use dispatcher::{
    ScanRequest, Scheduler, SchedulerConfig, TaskOutcome, WorkItem, validate_target,
};
pub use event::ScanEvent;
pub use snapshot::{ScanSnapshot, StageSnapshot, snapshot};

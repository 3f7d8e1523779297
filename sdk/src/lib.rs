//! Courier SDK
//!
//! Wire protocol shared by the coordinator and every capability worker.
//! Processes share no memory; everything they exchange over the bus is
//! defined in this crate.

/// Capabilities and channel naming
pub mod capability;

/// Task, result and progress envelopes
pub mod envelope;

/// Error types and handling
pub mod errors;

// Re-export commonly used types
pub use capability::{progress_channel, Capability, RESULTS_CHANNEL};
pub use envelope::{
    CorrelationId, Envelope, FailureKind, PayloadRef, ProgressEvent, ResultEnvelope,
    ResultPayload, ResultStatus, Stage, TaskEnvelope,
};
pub use errors::{CourierErrorExt, DispatchError};

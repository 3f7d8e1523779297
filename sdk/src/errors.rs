//! Error types and handling
//!
//! This module provides the error type used throughout Courier. All errors
//! implement the `CourierErrorExt` trait which provides user-friendly hints
//! and indicates whether errors are transient.
//!
//! Failures inside a worker never cross a process boundary as errors: the
//! worker converts them to an `error` result envelope using
//! [`DispatchError::failure_kind`].

use thiserror::Error;

use crate::capability::Capability;
use crate::envelope::FailureKind;

/// Trait for Courier error extensions
pub trait CourierErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display in a conversation and does not contain
    /// secrets, file paths or internal details.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is transient
    ///
    /// Recoverable errors can be retried (reconnect, resubscribe, ask the user
    /// to send again). Non-recoverable errors need a configuration change.
    fn is_recoverable(&self) -> bool;
}

/// Main Courier error type
///
/// # Error Categories
///
/// - **Transport**: bus unavailable, no live worker, malformed envelopes
/// - **Classification**: unsupported input, unknown capability
/// - **Worker**: artifact download, size/duration bounds, extraction, analysis
/// - **Coordination**: dispatch timeout, duplicate correlation ids, delivery
/// - **Setup**: configuration, secrets, IO
///
/// # Examples
///
/// ```
/// use courier_sdk::errors::{CourierErrorExt, DispatchError};
///
/// let error = DispatchError::BusUnavailable("connection refused".to_string());
/// assert!(error.is_recoverable());
///
/// let fatal = DispatchError::Config("missing endpoint".to_string());
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum DispatchError {
    // Transport errors
    #[error("Message bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("No live worker subscribed for {0}")]
    NoLiveWorker(Capability),

    #[error("Malformed envelope: {0}")]
    Envelope(String),

    // Classification errors
    #[error("Unsupported input: {0}")]
    Classification(String),

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    // Worker errors
    #[error("Artifact download failed: {0}")]
    ArtifactDownload(String),

    #[error("Artifact too large: {size} bytes > {limit} bytes")]
    ArtifactTooLarge { size: u64, limit: u64 },

    #[error("Audio too long: {duration}s > {limit}s")]
    AudioTooLong { duration: u32, limit: u32 },

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Analysis failed: {0}")]
    Analysis(String),

    // Coordination errors
    #[error("No response received for task {0}")]
    DispatchTimeout(String),

    #[error("Duplicate correlation id: {0}")]
    DuplicateCorrelation(String),

    #[error("Conversation delivery failed: {0}")]
    Delivery(String),

    // Setup errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Secret error: {0}")]
    Secret(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Envelope(err.to_string())
    }
}

impl DispatchError {
    /// Wire failure kind for an error raised while processing a task
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::ArtifactDownload(_) => FailureKind::ArtifactDownload,
            Self::ArtifactTooLarge { .. } => FailureKind::ArtifactTooLarge,
            Self::AudioTooLong { .. } | Self::Classification(_) => FailureKind::Rejected,
            Self::Extraction(_) => FailureKind::Extraction,
            Self::Analysis(_) => FailureKind::Analysis,
            _ => FailureKind::Internal,
        }
    }
}

impl CourierErrorExt for DispatchError {
    fn user_hint(&self) -> &str {
        match self {
            // Transport errors
            Self::BusUnavailable(_) => "Processing is temporarily unavailable. Please try again",
            Self::NoLiveWorker(_) => "No processor is available for this file right now",
            Self::Envelope(_) => "Received a malformed message",

            // Classification errors
            Self::Classification(_) => "This file type is not supported",
            Self::UnknownCapability(_) => "Unknown processing capability",

            // Worker errors
            Self::ArtifactDownload(_) => "The file could not be downloaded. Please send it again",
            Self::ArtifactTooLarge { .. } => "The file is too large",
            Self::AudioTooLong { .. } => "The recording is too long",
            Self::Extraction(_) => "The file content could not be read",
            Self::Analysis(_) => "The analysis service failed",

            // Coordination errors
            Self::DispatchTimeout(_) => "No response received. Please try again",
            Self::DuplicateCorrelation(_) => "This task is already being processed",
            Self::Delivery(_) => "The reply could not be delivered",

            // Setup errors
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Secret(_) => "A required credential is missing",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_) | Self::Secret(_) | Self::UnknownCapability(_) => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(
            DispatchError::ArtifactDownload("404".to_string()).failure_kind(),
            FailureKind::ArtifactDownload
        );
        assert_eq!(
            DispatchError::ArtifactTooLarge { size: 10, limit: 5 }.failure_kind(),
            FailureKind::ArtifactTooLarge
        );
        assert_eq!(
            DispatchError::AudioTooLong {
                duration: 7200,
                limit: 1800
            }
            .failure_kind(),
            FailureKind::Rejected
        );
        assert_eq!(
            DispatchError::Extraction("bad pdf".to_string()).failure_kind(),
            FailureKind::Extraction
        );
        assert_eq!(
            DispatchError::Io(std::io::Error::other("disk full")).failure_kind(),
            FailureKind::Internal
        );
    }

    #[test]
    fn test_recoverability() {
        assert!(DispatchError::BusUnavailable("down".to_string()).is_recoverable());
        assert!(DispatchError::NoLiveWorker(Capability::Audio).is_recoverable());
        assert!(!DispatchError::Config("bad".to_string()).is_recoverable());
        assert!(!DispatchError::Secret("missing".to_string()).is_recoverable());
    }

    #[test]
    fn test_hints_do_not_leak_details() {
        let error = DispatchError::ArtifactDownload("/tmp/courier-x/secret.pdf".to_string());
        assert!(!error.user_hint().contains("/tmp"));
    }

    #[test]
    fn test_messages_include_bounds() {
        let error = DispatchError::ArtifactTooLarge {
            size: 60_000_000,
            limit: 52_428_800,
        };
        assert_eq!(
            error.to_string(),
            "Artifact too large: 60000000 bytes > 52428800 bytes"
        );
    }
}

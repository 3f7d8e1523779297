//! Task, result and progress envelopes
//!
//! Envelopes are the only thing that crosses a process boundary. They are
//! encoded as JSON and must round-trip losslessly through the bus.
//!
//! - [`TaskEnvelope`]: coordinator -> worker, one per classified event
//! - [`ResultEnvelope`]: worker -> coordinator, exactly one per task
//! - [`ProgressEvent`]: worker -> coordinator, zero or more per task, advisory

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::capability::Capability;
use crate::errors::DispatchError;

/// Unique identifier linking a task to its result and progress events
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Allocate a fresh correlation id
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Reference to externally stored input, never the raw bytes
///
/// The `uri` carries a scheme naming where the artifact lives:
/// `telegram:<file_id>` or `file:<path>`. The remaining fields are metadata
/// captured by the front end and used for bounds checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    pub uri: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
}

impl PayloadRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            file_name: None,
            mime_type: None,
            size_bytes: None,
            duration_secs: None,
        }
    }

    /// Reference to a file held by the Telegram Bot API
    pub fn telegram(file_id: &str) -> Self {
        Self::new(format!("telegram:{}", file_id))
    }

    /// Reference to a file on a filesystem shared with the workers
    pub fn local(path: impl AsRef<Path>) -> Self {
        Self::new(format!("file:{}", path.as_ref().display()))
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    pub fn with_duration(mut self, duration_secs: u32) -> Self {
        self.duration_secs = Some(duration_secs);
        self
    }

    /// Scheme part of the uri (`telegram`, `file`), if any
    pub fn scheme(&self) -> Option<&str> {
        self.uri.split_once(':').map(|(scheme, _)| scheme)
    }

    /// Scheme-specific part of the uri
    pub fn locator(&self) -> &str {
        self.uri
            .split_once(':')
            .map(|(_, rest)| rest)
            .unwrap_or(&self.uri)
    }

    /// Lowercased file extension of `file_name`, without the dot
    pub fn extension(&self) -> Option<String> {
        let name = self.file_name.as_deref()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

/// Task handed to a capability worker
///
/// Immutable after publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub correlation_id: CorrelationId,
    pub capability: Capability,
    pub conversation_id: String,
    pub originator_id: String,
    pub payload_ref: PayloadRef,
    pub issued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Build a task with a freshly allocated correlation id
    pub fn new(
        capability: Capability,
        conversation_id: impl Into<String>,
        originator_id: impl Into<String>,
        payload_ref: PayloadRef,
    ) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            capability,
            conversation_id: conversation_id.into(),
            originator_id: originator_id.into(),
            payload_ref,
            issued_at: Utc::now(),
        }
    }
}

/// Outcome of a task as seen on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Ok,
    Error,
}

/// Why a task failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The artifact reference could not be resolved or downloaded
    ArtifactDownload,
    /// The artifact exceeded the configured size limit
    ArtifactTooLarge,
    /// The input violated a bound (e.g. audio too long)
    Rejected,
    /// Corrupt or unsupported content
    Extraction,
    /// The analysis collaborator failed and no raw content was available
    Analysis,
    /// Unexpected failure inside the worker
    Internal,
}

impl FailureKind {
    /// Short description suitable for a conversation reply
    pub fn describe(&self) -> &'static str {
        match self {
            FailureKind::ArtifactDownload => "the file could not be downloaded",
            FailureKind::ArtifactTooLarge => "the file is too large",
            FailureKind::Rejected => "the input exceeds the allowed limits",
            FailureKind::Extraction => "the content could not be read",
            FailureKind::Analysis => "the analysis service failed",
            FailureKind::Internal => "an unexpected error occurred",
        }
    }
}

/// Payload of a result envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultPayload {
    /// Analysis output (or raw extracted content when `degraded`)
    Analysis {
        summary: String,

        /// Leading part of the extracted text (transcript, document text)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        excerpt: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact_name: Option<String>,

        /// Extracted content was cut to the character budget
        #[serde(default)]
        truncated: bool,

        /// Analysis failed and `summary` holds raw extracted content
        #[serde(default)]
        degraded: bool,
    },

    /// Capability-specific failure
    Failure { failure: FailureKind, reason: String },
}

impl ResultPayload {
    pub fn status(&self) -> ResultStatus {
        match self {
            ResultPayload::Analysis { .. } => ResultStatus::Ok,
            ResultPayload::Failure { .. } => ResultStatus::Error,
        }
    }
}

/// Result of one task, published on the shared result channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub correlation_id: CorrelationId,
    pub capability: Capability,
    pub conversation_id: String,
    pub status: ResultStatus,
    pub payload: ResultPayload,
    pub completed_at: DateTime<Utc>,
}

impl ResultEnvelope {
    /// Result for `task`; the status follows the payload
    pub fn for_task(task: &TaskEnvelope, payload: ResultPayload) -> Self {
        Self {
            correlation_id: task.correlation_id.clone(),
            capability: task.capability,
            conversation_id: task.conversation_id.clone(),
            status: payload.status(),
            payload,
            completed_at: Utc::now(),
        }
    }

    /// Error result for `task`
    pub fn failure(task: &TaskEnvelope, failure: FailureKind, reason: impl Into<String>) -> Self {
        Self::for_task(
            task,
            ResultPayload::Failure {
                failure,
                reason: reason.into(),
            },
        )
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResultStatus::Ok
    }
}

/// Stage boundary reached by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Downloaded,
    Extracted,
    Analyzed,
}

impl Stage {
    pub fn describe(&self) -> &'static str {
        match self {
            Stage::Downloaded => "file downloaded",
            Stage::Extracted => "content extracted",
            Stage::Analyzed => "analysis complete",
        }
    }
}

/// Advisory progress update; never required for correctness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub correlation_id: CorrelationId,
    pub conversation_id: String,
    pub stage: Stage,
    pub emitted_at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(task: &TaskEnvelope, stage: Stage) -> Self {
        Self {
            correlation_id: task.correlation_id.clone(),
            conversation_id: task.conversation_id.clone(),
            stage,
            emitted_at: Utc::now(),
        }
    }
}

/// JSON codec shared by every envelope type
pub trait Envelope: Serialize + DeserializeOwned + Sized {
    fn correlation_id(&self) -> &CorrelationId;

    fn encode(&self) -> Result<String, DispatchError> {
        Ok(serde_json::to_string(self)?)
    }

    fn decode(raw: &str) -> Result<Self, DispatchError> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl Envelope for TaskEnvelope {
    fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl Envelope for ResultEnvelope {
    fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl Envelope for ProgressEvent {
    fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

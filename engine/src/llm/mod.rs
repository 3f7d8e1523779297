//! Analysis Provider Abstraction Layer
//!
//! Workers hand bounded content to an analysis collaborator and get back a
//! summary. The [`AnalysisProvider`] trait is the seam: production uses
//! [`gemini::GeminiProvider`], tests substitute scripted providers.

use async_trait::async_trait;
use courier_sdk::Capability;
use serde::{Deserialize, Serialize};

pub mod gemini;
pub mod prompts;

pub use gemini::GeminiProvider;

/// Result type for analysis operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur during analysis
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Empty response")]
    EmptyResponse,
}

/// Binary content passed to the provider alongside the prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineMedia {
    pub mime_type: String,

    /// Base64 encoded bytes
    pub data: String,
}

/// One analysis call
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub capability: Capability,

    /// Lowercased file extension, used to pick a document prompt
    pub document_kind: Option<String>,

    /// Bounded extracted text
    pub text: Option<String>,

    pub media: Option<InlineMedia>,
}

impl AnalysisRequest {
    pub fn text(capability: Capability, text: impl Into<String>) -> Self {
        Self {
            capability,
            document_kind: None,
            text: Some(text.into()),
            media: None,
        }
    }

    pub fn media(capability: Capability, media: InlineMedia) -> Self {
        Self {
            capability,
            document_kind: None,
            text: None,
            media: Some(media),
        }
    }

    pub fn with_document_kind(mut self, kind: Option<String>) -> Self {
        self.document_kind = kind;
        self
    }
}

/// Analysis provider trait that all providers must implement
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Returns the name of the provider (e.g., "gemini")
    fn name(&self) -> &str;

    /// Analyze the content and return a summary
    ///
    /// # Returns
    /// * `Ok(String)` - Non-empty analysis text
    /// * `Err(LLMError)` - If the request fails or the response is empty
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String>;

    /// Check if the provider is currently reachable with its credentials
    /// Default implementation returns true.
    async fn check_health(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builders() {
        let request = AnalysisRequest::text(Capability::Document, "hello")
            .with_document_kind(Some("pdf".to_string()));
        assert_eq!(request.text.as_deref(), Some("hello"));
        assert_eq!(request.document_kind.as_deref(), Some("pdf"));
        assert!(request.media.is_none());

        let media = InlineMedia {
            mime_type: "image/png".to_string(),
            data: "aGk=".to_string(),
        };
        let request = AnalysisRequest::media(Capability::Image, media.clone());
        assert_eq!(request.media, Some(media));
        assert!(request.text.is_none());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(LLMError::Timeout.to_string(), "Timeout");
        assert_eq!(
            LLMError::NetworkError("reset".to_string()).to_string(),
            "Network error: reset"
        );
    }
}

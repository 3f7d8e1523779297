use super::{prompts, AnalysisProvider, AnalysisRequest, LLMError};
use crate::config::AnalysisConfig;
use crate::secrets::SecretString;
use async_trait::async_trait;
use serde_json::json;

/// Gemini `generateContent` client
pub struct GeminiProvider {
    config: AnalysisConfig,
    api_key: SecretString,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(config: AnalysisConfig, api_key: SecretString) -> Self {
        Self {
            config,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn build_payload(request: &AnalysisRequest) -> serde_json::Value {
        let mut parts = vec![json!({ "text": prompts::prompt_for(request) })];

        if let Some(text) = &request.text {
            parts.push(json!({ "text": text }));
        }
        if let Some(media) = &request.media {
            parts.push(json!({
                "inline_data": {
                    "mime_type": media.mime_type,
                    "data": media.data,
                }
            }));
        }

        json!({
            "contents": [{ "role": "user", "parts": parts }]
        })
    }
}

#[async_trait]
impl AnalysisProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    /// Whether the configured model answers a metadata lookup with this key
    async fn check_health(&self) -> bool {
        let url = format!(
            "{}/models/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );

        match self
            .client
            .get(&url)
            .query(&[("key", self.api_key.expose())])
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Gemini health check failed: {}", e.without_url());
                false
            }
        }
    }

    async fn analyze(&self, request: &AnalysisRequest) -> super::Result<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.expose())])
            .header("Content-Type", "application/json")
            .json(&Self::build_payload(request))
            .send()
            .await
            .map_err(|e| LLMError::NetworkError(e.without_url().to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            return Err(match status.as_u16() {
                400 | 404 => LLMError::InvalidRequest(text),
                429 => LLMError::RateLimitExceeded,
                401 | 403 => LLMError::AuthenticationFailed(text),
                _ => LLMError::ProviderUnavailable(format!(
                    "Gemini API error ({}): {}",
                    status, text
                )),
            });
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.without_url().to_string()))?;

        let parts = data
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(|p| p.as_array())
            .ok_or_else(|| LLMError::ParseError("No candidate content in response".to_string()))?;

        let mut full_text = String::new();
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                full_text.push_str(text);
            }
        }

        let full_text = full_text.trim();
        if full_text.is_empty() {
            return Err(LLMError::EmptyResponse);
        }

        Ok(full_text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::InlineMedia;
    use courier_sdk::Capability;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    fn provider(server: &MockServer) -> GeminiProvider {
        let config = AnalysisConfig {
            base_url: server.uri(),
            model: "gemini-test".to_string(),
            api_key_key: "UNUSED".to_string(),
        };
        GeminiProvider::new(config, SecretString::from("test-key"))
    }

    #[tokio::test]
    async fn test_analyze_text_joins_parts() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/models/gemini-test:generateContent"))
            .and(query_param("key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": { "parts": [{"text": "A short "}, {"text": "summary. "}] }
                }]
            })))
            .mount(&server)
            .await;

        let request = AnalysisRequest::text(Capability::Document, "Quarterly numbers");
        let summary = provider(&server).analyze(&request).await.unwrap();
        assert_eq!(summary, "A short summary.");
    }

    #[tokio::test]
    async fn test_analyze_sends_inline_media() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{"text": "A cat"}] } }]
            })))
            .mount(&server)
            .await;

        let request = AnalysisRequest::media(
            Capability::Image,
            InlineMedia {
                mime_type: "image/png".to_string(),
                data: "iVBORw0K".to_string(),
            },
        );
        let payload = GeminiProvider::build_payload(&request);
        assert_eq!(
            payload["contents"][0]["parts"][1]["inline_data"]["mime_type"],
            "image/png"
        );
        assert_eq!(provider(&server).analyze(&request).await.unwrap(), "A cat");
    }

    #[tokio::test]
    async fn test_status_codes_map_to_errors() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let request = AnalysisRequest::text(Capability::Audio, "hello");
        let err = provider(&server).analyze(&request).await.unwrap_err();
        assert!(matches!(err, LLMError::RateLimitExceeded));
    }

    #[tokio::test]
    async fn test_empty_candidate_is_an_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{"text": "   "}] } }]
            })))
            .mount(&server)
            .await;

        let request = AnalysisRequest::text(Capability::Document, "x");
        let err = provider(&server).analyze(&request).await.unwrap_err();
        assert!(matches!(err, LLMError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_health_check_looks_up_model() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/models/gemini-test"))
            .and(query_param("key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "models/gemini-test"
            })))
            .mount(&server)
            .await;

        assert!(provider(&server).check_health().await);
    }

    #[tokio::test]
    async fn test_health_check_fails_on_rejected_key() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        assert!(!provider(&server).check_health().await);
    }
}

use std::time::Duration;

use serde::Serialize;

use crate::credential::Credential;
use crate::{RelayError, Result};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 8192;

/// Body of a `streamGenerateContent` call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    pub generation_config: GenerationConfig,
}

impl GenerateContentRequest {
    pub fn single_turn(parts: Vec<Part>) -> Self {
        Self {
            contents: vec![Content { parts }],
            generation_config: GenerationConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn inline_data(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::InlineData {
            inline_data: Blob {
                mime_type: mime_type.into(),
                data: data.into(),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// Base64 payload, forwarded untouched.
    pub data: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f64,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

/// HTTP client for the generative-language API. Holds no credential; the key
/// is supplied per call.
#[derive(Clone, Debug)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    attempt_timeout: Duration,
}

impl GeminiClient {
    pub fn new(attempt_timeout: Duration, connect_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| RelayError::Config(format!("upstream http client error: {err}")))?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            attempt_timeout,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    fn model_path(model: &str) -> String {
        let model = model.trim();
        if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        }
    }

    pub fn stream_url(&self, model: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = Self::model_path(model);
        format!("{base}/{path}:streamGenerateContent?alt=sse")
    }

    /// Sends one streaming request. Only the wait for response headers is
    /// bounded by the attempt timeout; the body is left unread for the relay.
    pub(crate) async fn send_stream(
        &self,
        model: &str,
        body: &GenerateContentRequest,
        key: &Credential,
    ) -> std::result::Result<reqwest::Response, SendError> {
        let request = self
            .http
            .post(self.stream_url(model))
            .header("x-goog-api-key", key.expose())
            .header("Accept", "text/event-stream")
            .json(body);

        match tokio::time::timeout(self.attempt_timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(SendError::Transport(err)),
            Err(_) => Err(SendError::TimedOut(self.attempt_timeout)),
        }
    }
}

#[derive(Debug)]
pub(crate) enum SendError {
    Transport(reqwest::Error),
    TimedOut(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_to_generate_content_shape() -> Result<()> {
        let envelope = GenerateContentRequest::single_turn(vec![
            Part::text("describe this"),
            Part::inline_data("image/png", "iVBORw0KGgo="),
        ]);
        let value = serde_json::to_value(&envelope)?;
        assert_eq!(
            value,
            serde_json::json!({
                "contents": [{
                    "parts": [
                        { "text": "describe this" },
                        { "inlineData": { "mimeType": "image/png", "data": "iVBORw0KGgo=" } }
                    ]
                }],
                "generationConfig": { "temperature": 0.7, "maxOutputTokens": 8192 }
            })
        );
        Ok(())
    }

    #[test]
    fn stream_url_adds_models_prefix_and_sse() -> Result<()> {
        let client = GeminiClient::new(Duration::from_secs(1), Duration::from_secs(1))?
            .with_base_url("http://localhost:9999/v1beta/");
        assert_eq!(
            client.stream_url("gemini-1.5-flash"),
            "http://localhost:9999/v1beta/models/gemini-1.5-flash:streamGenerateContent?alt=sse"
        );
        assert_eq!(
            client.stream_url("models/gemini-1.5-pro"),
            "http://localhost:9999/v1beta/models/gemini-1.5-pro:streamGenerateContent?alt=sse"
        );
        Ok(())
    }
}

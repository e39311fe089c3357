pub mod chat;
pub mod diagnosis;
pub mod wire;

use reqwest::header::{ HeaderMap, HeaderValue, CONTENT_TYPE };
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Everything that can go wrong between us and the model service.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("API key is not configured.")]
    MissingCredential,
    #[error("Connection to the model failed: {0}")]
    Transport(String),
    #[error("Could not decode the model reply: {0}")]
    Decode(String),
    #[error("Diagnosis reply was not in the expected format: {0}")]
    Shape(String),
    #[error("Timed out after {0:?} waiting for the model")]
    Timeout(Duration),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

impl GatewayError {
    /// Builds a transport error out of a non-success HTTP reply, preferring the
    /// service's own error message when the body carries one.
    pub fn from_http_status(status: u16, body: &str) -> Self {
        let detail = serde_json
            ::from_str::<wire::ApiErrorEnvelope>(body)
            .map(|env| env.error.message)
            .unwrap_or_else(|_| body.trim().to_string());
        if detail.is_empty() {
            GatewayError::Transport(format!("HTTP {}", status))
        } else {
            GatewayError::Transport(format!("HTTP {}: {}", status, detail))
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub chunk_timeout: Option<Duration>,
    pub diagnosis_timeout: Option<Duration>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            chunk_timeout: None,
            diagnosis_timeout: None,
        }
    }
}

impl LlmConfig {
    /// `{base}/models/{model}:{method}`
    pub fn model_url(&self, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url.trim_end_matches('/'), self.model, method)
    }

    pub fn credential(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }
}

/// Shared HTTP client for every Gemini call. The API key travels as a default
/// header so it never shows up in logged URLs.
pub fn build_http_client(api_key: Option<&str>) -> Result<reqwest::Client, GatewayError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(key) = api_key {
        let mut value = HeaderValue::from_str(key).map_err(|e|
            GatewayError::Transport(format!("Invalid API key format: {}", e))
        )?;
        value.set_sensitive(true);
        headers.insert(API_KEY_HEADER, value);
    }

    reqwest::Client
        ::builder()
        .default_headers(headers)
        .build()
        .map_err(|e| GatewayError::Transport(format!("Failed to build HTTP client: {}", e)))
}

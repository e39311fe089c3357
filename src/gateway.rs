//! Boundary to the hosted model. Every call checks the credential first and
//! never touches the network without one.

use log::{ info, warn };
use std::sync::Arc;
use std::time::Duration;

use crate::config::prompt::PromptConfig;
use crate::llm::chat::{ with_chunk_timeout, ChatSession, ChunkStream, GeminiChatSession };
use crate::llm::diagnosis::{ DiagnosisClient, GeminiDiagnosisClient };
use crate::llm::{ GatewayError, LlmConfig };
use crate::models::diagnosis::{ DiagnosisResult, ImageUpload };

pub const CREDENTIAL_WARNING: &str =
    "API_KEY environment variable not set. Please configure it to use the AI assistant.";

/// Pure check, no I/O. Returns the warning to show when no usable credential
/// is configured.
pub fn check_credential(api_key: Option<&str>) -> Option<String> {
    match api_key.map(str::trim) {
        Some(key) if !key.is_empty() => None,
        _ => Some(CREDENTIAL_WARNING.to_string()),
    }
}

pub struct Gateway {
    credential: Option<String>,
    chat: Arc<dyn ChatSession>,
    diagnosis: Arc<dyn DiagnosisClient>,
    chunk_timeout: Option<Duration>,
    diagnosis_timeout: Option<Duration>,
}

impl Gateway {
    pub fn new(
        credential: Option<String>,
        chat: Arc<dyn ChatSession>,
        diagnosis: Arc<dyn DiagnosisClient>
    ) -> Self {
        Self {
            credential: credential.filter(|k| !k.trim().is_empty()),
            chat,
            diagnosis,
            chunk_timeout: None,
            diagnosis_timeout: None,
        }
    }

    pub fn with_timeouts(
        mut self,
        chunk_timeout: Option<Duration>,
        diagnosis_timeout: Option<Duration>
    ) -> Self {
        self.chunk_timeout = chunk_timeout;
        self.diagnosis_timeout = diagnosis_timeout;
        self
    }

    /// Gemini-backed gateway with a fresh conversational session.
    pub fn from_config(config: &LlmConfig, http: reqwest::Client, prompts: &PromptConfig) -> Self {
        let chat = GeminiChatSession::new(http.clone(), config, &prompts.chat_system_instruction);
        let diagnosis = GeminiDiagnosisClient::new(http, config, &prompts.diagnosis_instruction);
        Self::new(
            config.credential().map(str::to_string),
            Arc::new(chat),
            Arc::new(diagnosis)
        ).with_timeouts(config.chunk_timeout, config.diagnosis_timeout)
    }

    pub fn check_credential(&self) -> Option<String> {
        check_credential(self.credential.as_deref())
    }

    fn require_credential(&self) -> Result<(), GatewayError> {
        if self.credential.is_none() {
            warn!("Refusing model call: no API key configured");
            return Err(GatewayError::MissingCredential);
        }
        Ok(())
    }

    /// Sends `message` on the session and returns the reply as it streams in.
    pub async fn stream_reply(&self, message: &str) -> Result<ChunkStream, GatewayError> {
        self.require_credential()?;
        let stream = self.chat.stream_reply(message).await?;
        Ok(match self.chunk_timeout {
            Some(limit) => with_chunk_timeout(stream, limit),
            None => stream,
        })
    }

    pub async fn diagnose(&self, image: &ImageUpload) -> Result<DiagnosisResult, GatewayError> {
        self.require_credential()?;
        match self.diagnosis_timeout {
            Some(limit) =>
                tokio::time
                    ::timeout(limit, self.diagnosis.diagnose(image)).await
                    .map_err(|_| GatewayError::Timeout(limit))?,
            None => self.diagnosis.diagnose(image).await,
        }
    }

    pub fn reset_session(&self) {
        info!("Resetting conversational session for model {}", self.chat.model());
        self.chat.reset();
    }

    pub fn model(&self) -> String {
        self.chat.model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ gateway_with, ScriptedSession, StaticDiagnosis };
    use futures::StreamExt;

    #[test]
    fn credential_check_is_stable_without_key() {
        let session = Arc::new(ScriptedSession::new(vec![]));
        let gateway = gateway_with(None, session.clone(), StaticDiagnosis::reply("{}"));
        let first = gateway.check_credential();
        let second = gateway.check_credential();
        assert_eq!(first.as_deref(), Some(CREDENTIAL_WARNING));
        assert_eq!(first, second);
        assert_eq!(session.calls(), 0);
    }

    #[test]
    fn blank_key_counts_as_missing() {
        assert_eq!(check_credential(Some("  ")).as_deref(), Some(CREDENTIAL_WARNING));
        assert_eq!(check_credential(None).as_deref(), Some(CREDENTIAL_WARNING));
        assert_eq!(check_credential(Some("key")), None);
    }

    #[tokio::test]
    async fn calls_fail_fast_without_credential() {
        let session = Arc::new(ScriptedSession::new(vec![vec![Ok("never".to_string())]]));
        let diagnosis = StaticDiagnosis::reply("{}");
        let gateway = gateway_with(None, session.clone(), diagnosis.clone());

        assert!(matches!(gateway.stream_reply("hi").await, Err(GatewayError::MissingCredential)));
        let image = ImageUpload::new(vec![1], "image/png").unwrap();
        assert!(matches!(gateway.diagnose(&image).await, Err(GatewayError::MissingCredential)));
        assert_eq!(session.calls(), 0);
        assert_eq!(diagnosis.calls(), 0);
    }

    #[tokio::test]
    async fn diagnose_parses_reply_fields_exactly() {
        let reply = "{\"disease\":\"Leaf Blight\",\"description\":\"Brown lesions\",\"remedy\":\"- Remove affected leaves\\n- Apply copper fungicide\"}";
        let gateway = gateway_with(
            Some("key"),
            Arc::new(ScriptedSession::new(vec![])),
            StaticDiagnosis::reply(reply)
        );
        let image = ImageUpload::new(vec![1, 2, 3], "image/jpeg").unwrap();
        let result = gateway.diagnose(&image).await.unwrap();
        assert_eq!(result.disease, "Leaf Blight");
        assert_eq!(result.description, "Brown lesions");
        assert_eq!(result.remedy, "- Remove affected leaves\n- Apply copper fungicide");
    }

    #[tokio::test]
    async fn diagnose_surfaces_shape_error_for_non_json() {
        let gateway = gateway_with(
            Some("key"),
            Arc::new(ScriptedSession::new(vec![])),
            StaticDiagnosis::reply("Sorry, I cannot see a leaf here.")
        );
        let image = ImageUpload::new(vec![1], "image/png").unwrap();
        assert!(matches!(gateway.diagnose(&image).await, Err(GatewayError::Shape(_))));
    }

    #[tokio::test]
    async fn diagnose_times_out() {
        let gateway = gateway_with(
            Some("key"),
            Arc::new(ScriptedSession::new(vec![])),
            StaticDiagnosis::stalled()
        ).with_timeouts(None, Some(Duration::from_millis(20)));
        let image = ImageUpload::new(vec![1], "image/png").unwrap();
        assert!(matches!(gateway.diagnose(&image).await, Err(GatewayError::Timeout(_))));
    }

    #[tokio::test]
    async fn stream_reply_forwards_session_chunks() {
        let session = Arc::new(
            ScriptedSession::new(vec![vec![Ok("Tomato".to_string()), Ok(" prices".to_string())]])
        );
        let gateway = gateway_with(Some("key"), session.clone(), StaticDiagnosis::reply("{}"))
            .with_timeouts(Some(Duration::from_secs(5)), None);
        let chunks: Vec<String> = gateway
            .stream_reply("prices?").await
            .unwrap()
            .map(|c| c.unwrap())
            .collect().await;
        assert_eq!(chunks, vec!["Tomato", " prices"]);
        assert_eq!(session.messages(), vec!["prices?".to_string()]);
    }

    #[test]
    fn reset_reaches_the_session() {
        let session = Arc::new(ScriptedSession::new(vec![]));
        let gateway = gateway_with(Some("key"), session.clone(), StaticDiagnosis::reply("{}"));
        gateway.reset_session();
        gateway.reset_session();
        assert_eq!(session.resets(), 2);
    }
}

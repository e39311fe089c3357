use async_trait::async_trait;
use log::{ debug, info, warn };
use std::sync::{ Arc, Mutex, PoisonError };

use super::{ http_stream_generate, ChatSession, ChunkStream };
use crate::llm::wire::{ Content, GenerateContentRequest, GenerateContentResponse };
use crate::llm::{ GatewayError, LlmConfig };

/// Turns one SSE line of `streamGenerateContent?alt=sse` into a chunk.
/// Non-data lines and payloads without text produce nothing.
pub fn parse_gemini_sse_line(line: &str) -> Result<Option<String>, GatewayError> {
    let line = line.trim();
    let payload = match line.strip_prefix("data:") {
        Some(payload) => payload.trim(),
        None => {
            return Ok(None);
        }
    };
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(None);
    }

    let chunk: GenerateContentResponse = serde_json
        ::from_str(payload)
        .map_err(|e| GatewayError::Decode(format!("{} in stream payload", e)))?;

    if let Some(err) = chunk.error {
        return Err(GatewayError::Transport(err.message));
    }
    if let Some(reason) = chunk.block_reason() {
        return Err(GatewayError::Transport(format!("Request was blocked by the model ({})", reason)));
    }
    Ok(chunk.text())
}

/// A Gemini chat that remembers its turns. The REST API is stateless, so the
/// session replays the whole conversation with every message. An exchange is
/// only recorded once its reply streamed through completely.
pub struct GeminiChatSession {
    http: reqwest::Client,
    config: LlmConfig,
    system_instruction: Content,
    history: Arc<Mutex<Vec<Content>>>,
}

impl GeminiChatSession {
    pub fn new(http: reqwest::Client, config: &LlmConfig, system_instruction: &str) -> Self {
        Self {
            http,
            config: config.clone(),
            system_instruction: Content::instruction(system_instruction),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn turn_count(&self) -> usize {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl ChatSession for GeminiChatSession {
    async fn stream_reply(&self, message: &str) -> Result<ChunkStream, GatewayError> {
        let user = Content::user(message);
        let mut contents = self.history.lock().unwrap_or_else(PoisonError::into_inner).clone();
        contents.push(user.clone());

        info!(
            "GeminiChatSession::stream_reply() → model={} context_turns={}",
            self.config.model,
            contents.len() - 1
        );

        let payload = GenerateContentRequest {
            contents,
            system_instruction: Some(self.system_instruction.clone()),
            generation_config: None,
        };
        let url = format!("{}?alt=sse", self.config.model_url("streamGenerateContent"));
        let history = Arc::clone(&self.history);

        Ok(
            http_stream_generate(self.http.clone(), url, payload, parse_gemini_sse_line, move |reply| {
                if reply.is_empty() {
                    warn!("Model reply was empty; not recording the exchange");
                    return;
                }
                let mut history = history.lock().unwrap_or_else(PoisonError::into_inner);
                history.push(user);
                history.push(Content::model(reply));
                debug!("Chat session now holds {} turns", history.len());
            })
        )
    }

    fn reset(&self) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        info!("Resetting chat session ({} turns dropped)", history.len());
        history.clear();
    }

    fn model(&self) -> String {
        self.config.model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_chunk() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":" prices"}],"role":"model"}}]}"#;
        assert_eq!(parse_gemini_sse_line(line).unwrap().as_deref(), Some(" prices"));
    }

    #[test]
    fn skips_non_data_lines() {
        assert_eq!(parse_gemini_sse_line("").unwrap(), None);
        assert_eq!(parse_gemini_sse_line(": keep-alive").unwrap(), None);
        assert_eq!(parse_gemini_sse_line("event: message").unwrap(), None);
        assert_eq!(parse_gemini_sse_line("data: [DONE]").unwrap(), None);
    }

    #[test]
    fn chunk_without_text_yields_nothing() {
        let line = r#"data: {"candidates":[{"finishReason":"STOP"}],"usageMetadata":{}}"#;
        assert_eq!(parse_gemini_sse_line(line).unwrap(), None);
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let err = parse_gemini_sse_line("data: {not json").unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
    }

    #[test]
    fn error_payload_is_transport_error() {
        let line = r#"data: {"error":{"code":500,"message":"Internal error","status":"INTERNAL"}}"#;
        match parse_gemini_sse_line(line).unwrap_err() {
            GatewayError::Transport(msg) => assert_eq!(msg, "Internal error"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn blocked_prompt_is_transport_error() {
        let line = r#"data: {"promptFeedback":{"blockReason":"SAFETY"}}"#;
        assert!(matches!(parse_gemini_sse_line(line), Err(GatewayError::Transport(_))));
    }
}

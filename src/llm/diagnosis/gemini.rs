use async_trait::async_trait;
use log::info;

use super::{ diagnosis_schema, parse_diagnosis, DiagnosisClient };
use crate::llm::wire::{ Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part };
use crate::llm::{ GatewayError, LlmConfig };
use crate::models::diagnosis::{ DiagnosisResult, ImageUpload };

pub struct GeminiDiagnosisClient {
    http: reqwest::Client,
    config: LlmConfig,
    instruction: String,
}

impl GeminiDiagnosisClient {
    pub fn new(http: reqwest::Client, config: &LlmConfig, instruction: &str) -> Self {
        Self {
            http,
            config: config.clone(),
            instruction: instruction.to_string(),
        }
    }

    fn request(&self, image: &ImageUpload) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![
                    Part::inline(image.mime_type(), image.to_base64()),
                    Part::text(self.instruction.clone())
                ],
            }],
            system_instruction: None,
            generation_config: Some(GenerationConfig {
                response_mime_type: "application/json".to_string(),
                response_schema: diagnosis_schema(),
            }),
        }
    }
}

#[async_trait]
impl DiagnosisClient for GeminiDiagnosisClient {
    async fn diagnose(&self, image: &ImageUpload) -> Result<DiagnosisResult, GatewayError> {
        info!(
            "GeminiDiagnosisClient::diagnose() → model={} mime={} size={}",
            self.config.model,
            image.mime_type(),
            image.len()
        );

        let resp = self.http
            .post(self.config.model_url("generateContent"))
            .json(&self.request(image))
            .send().await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(GatewayError::from_http_status(status.as_u16(), &body));
        }

        let envelope: GenerateContentResponse = serde_json
            ::from_str(&body)
            .map_err(|e| GatewayError::Decode(format!("{} in diagnosis response", e)))?;
        if let Some(reason) = envelope.block_reason() {
            return Err(GatewayError::Transport(format!("Request was blocked by the model ({})", reason)));
        }
        let text = envelope
            .text()
            .ok_or_else(|| GatewayError::Shape("reply contained no text".to_string()))?;

        parse_diagnosis(&text)
    }
}

pub mod gemini;

use async_trait::async_trait;
use serde_json::{ json, Value as JsonValue };

use super::GatewayError;
use crate::models::diagnosis::{ DiagnosisResult, ImageUpload };

pub use self::gemini::GeminiDiagnosisClient;

#[async_trait]
pub trait DiagnosisClient: Send + Sync {
    async fn diagnose(&self, image: &ImageUpload) -> Result<DiagnosisResult, GatewayError>;
}

/// Parses the reply text of a diagnosis call. Anything that is not a JSON
/// object with the three string fields is a shape error.
pub fn parse_diagnosis(raw: &str) -> Result<DiagnosisResult, GatewayError> {
    serde_json::from_str(raw.trim()).map_err(|e| GatewayError::Shape(e.to_string()))
}

/// Response schema declared to the model so the server enforces the shape.
pub fn diagnosis_schema() -> JsonValue {
    json!({
        "type": "OBJECT",
        "properties": {
            "disease": {
                "type": "STRING",
                "description": "Name of the plant disease."
            },
            "description": {
                "type": "STRING",
                "description": "A simple, one-sentence description of the disease symptoms visible in the image."
            },
            "remedy": {
                "type": "STRING",
                "description": "A step-by-step guide for 2-3 remedies, formatted with markdown for clarity (e.g., using bullet points)."
            }
        },
        "required": ["disease", "description", "remedy"]
    })
}

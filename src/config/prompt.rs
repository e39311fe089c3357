use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::sync::Arc;
use log::info;

pub const DEFAULT_CHAT_SYSTEM_INSTRUCTION: &str = "You are Kisan AI, an expert agricultural assistant for Indian farmers.
- Your name is Kisan Dost (Farmer's Friend).
- Provide advice on crop diseases, real-time market prices from Indian mandis, and details on government schemes.
- Communicate in simple language, as if you are talking to a farmer.
- When asked for market prices, ask for the specific crop and market (mandi) if not provided.
- For government schemes, explain eligibility and application processes clearly.
- Format responses in markdown for readability.";

pub const DEFAULT_DIAGNOSIS_INSTRUCTION: &str = "Analyze the provided image of a plant leaf.
Identify the disease, describe its symptoms in simple terms, and suggest 2-3 affordable, organic or low-cost chemical remedies available in India.
Provide the output in JSON format.";

#[derive(Debug)]
pub enum PromptError {
    EmptyInstruction(&'static str),
    IoError(std::io::Error),
    JsonError(serde_json::Error),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::EmptyInstruction(key) => write!(f, "Prompt '{}' must not be empty", key),
            PromptError::IoError(e) => write!(f, "Prompt file IO error: {}", e),
            PromptError::JsonError(e) => write!(f, "Prompt JSON parsing error: {}", e),
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::IoError(e) => Some(e),
            PromptError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PromptError {
    fn from(err: std::io::Error) -> Self {
        PromptError::IoError(err)
    }
}

impl From<serde_json::Error> for PromptError {
    fn from(err: serde_json::Error) -> Self {
        PromptError::JsonError(err)
    }
}

/// Fixed instructions sent to the model. A prompts file may override either
/// one; missing keys keep the built-in text.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PromptConfig {
    pub chat_system_instruction: String,
    pub diagnosis_instruction: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            chat_system_instruction: DEFAULT_CHAT_SYSTEM_INSTRUCTION.to_string(),
            diagnosis_instruction: DEFAULT_DIAGNOSIS_INSTRUCTION.to_string(),
        }
    }
}

impl PromptConfig {
    fn validate(&self) -> Result<(), PromptError> {
        if self.chat_system_instruction.trim().is_empty() {
            return Err(PromptError::EmptyInstruction("chat_system_instruction"));
        }
        if self.diagnosis_instruction.trim().is_empty() {
            return Err(PromptError::EmptyInstruction("diagnosis_instruction"));
        }
        Ok(())
    }
}

pub fn load_prompts_from_str(json: &str) -> Result<PromptConfig, PromptError> {
    let config: PromptConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}

pub fn load_prompts(path: Option<&str>) -> Result<Arc<PromptConfig>, Box<dyn Error + Send + Sync>> {
    let path = match path {
        Some(p) if !p.trim().is_empty() => p,
        _ => {
            info!("Using built-in prompts");
            return Ok(Arc::new(PromptConfig::default()));
        }
    };
    let file_content = fs
        ::read_to_string(path)
        .map_err(|e| format!("Failed to read prompts file '{}': {}", path, e))?;
    let config = load_prompts_from_str(&file_content).map_err(|e|
        format!("Failed to parse prompts file '{}': {}", path, e)
    )?;
    info!("Loaded prompts from {}", path);
    Ok(Arc::new(config))
}

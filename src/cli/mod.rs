use clap::Parser;
use std::time::Duration;

use crate::app::{ AppOptions, DEFAULT_MAX_IMAGE_BYTES };
use crate::llm::{ LlmConfig, DEFAULT_BASE_URL, DEFAULT_MODEL };
use crate::transcript::DEFAULT_SPEECH_LANG;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Model Service Args ---
    /// API key for the Gemini service. Without it the assistant starts but every model call fails.
    #[arg(long, env = "API_KEY")]
    pub api_key: Option<String>,

    /// Model used for both chat and crop diagnosis.
    #[arg(long, env = "GEMINI_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Base URL of the Gemini REST API.
    #[arg(long, env = "GEMINI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Give up on a chat reply when no chunk arrives for this many seconds. Unset waits forever.
    #[arg(long, env = "CHUNK_TIMEOUT_SECS")]
    pub chunk_timeout_secs: Option<u64>,

    /// Give up on a crop diagnosis after this many seconds. Unset waits forever.
    #[arg(long, env = "DIAGNOSIS_TIMEOUT_SECS")]
    pub diagnosis_timeout_secs: Option<u64>,

    /// Optional JSON file overriding the built-in chat and diagnosis instructions.
    #[arg(long, env = "PROMPTS_PATH")]
    pub prompts_path: Option<String>,

    // --- Server Args ---
    /// Host address and port for the WebSocket server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Port for the optional HTTP API. The API is off when unset.
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    // --- App Args ---
    /// Largest accepted crop photo, in bytes.
    #[arg(long, env = "MAX_IMAGE_BYTES", default_value_t = DEFAULT_MAX_IMAGE_BYTES)]
    pub max_image_bytes: usize,

    /// Language tag passed to the client's speech recognizer.
    #[arg(long, env = "SPEECH_LANG", default_value = DEFAULT_SPEECH_LANG)]
    pub speech_lang: String,

    /// Also clear the model's conversation context whenever a new chat starts.
    #[arg(long, env = "RESET_SESSION_ON_NEW_CHAT", default_value = "false")]
    pub reset_session_on_new_chat: bool,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Args {
    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            chunk_timeout: self.chunk_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs),
            diagnosis_timeout: self.diagnosis_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs),
        }
    }

    pub fn app_options(&self) -> AppOptions {
        AppOptions {
            reset_session_on_new_chat: self.reset_session_on_new_chat,
            speech_lang: self.speech_lang.clone(),
            max_image_bytes: self.max_image_bytes,
        }
    }
}

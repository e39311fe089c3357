use log::{ info, warn };
use serde::{ Deserialize, Serialize };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use tokio::sync::broadcast;

use crate::chat::{ StreamAggregator, SubmitOutcome };
use crate::gateway::Gateway;
use crate::models::diagnosis::{ DiagnosisResult, ImageError, ImageUpload };
use crate::transcript::{
    RecognitionResult,
    TranscriptError,
    TranscriptInput,
    TranscriptSource,
    DEFAULT_SPEECH_LANG,
};

const EVENT_CAPACITY: usize = 64;
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    Dashboard,
    Chat,
    Diagnose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DashboardCard {
    pub title: &'static str,
    pub description: &'static str,
    pub target: View,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<&'static str>,
}

pub const DASHBOARD_CARDS: [DashboardCard; 3] = [
    DashboardCard {
        title: "Crop Diagnosis",
        description: "Upload a photo to identify crop diseases and get remedies.",
        target: View::Diagnose,
        prompt: None,
    },
    DashboardCard {
        title: "Market Prices",
        description: "Get the latest mandi prices for your crops.",
        target: View::Chat,
        prompt: Some("What are the current tomato prices?"),
    },
    DashboardCard {
        title: "Government Schemes",
        description: "Find and understand government subsidies and schemes.",
        target: View::Chat,
        prompt: Some("Tell me about subsidies for drip irrigation."),
    },
];

#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Also forget the model-side context when a new chat starts. Off by
    /// default: the conversation context survives topic switches.
    pub reset_session_on_new_chat: bool,
    pub speech_lang: String,
    pub max_image_bytes: usize,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            reset_session_on_new_chat: false,
            speech_lang: DEFAULT_SPEECH_LANG.to_string(),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    ViewChanged {
        view: View,
        prompt: Option<String>,
    },
    ImageSelected {
        mime_type: String,
        size: usize,
    },
    ImageRejected {
        message: String,
    },
    DiagnosisStarted,
    DiagnosisReady(DiagnosisResult),
    DiagnosisFailed {
        message: String,
    },
    DraftChanged(String),
    ListeningChanged(bool),
    SpeechError {
        message: String,
    },
}

/// Everything a freshly connected client needs to paint the current screen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreenSnapshot {
    pub view: View,
    pub prompt: Option<String>,
    pub draft: String,
    pub listening: bool,
    pub speech_available: bool,
    pub has_image: bool,
    pub diagnosing: bool,
    pub diagnosis: Option<DiagnosisResult>,
    pub diagnosis_error: Option<String>,
}

struct ScreenState {
    view: View,
    chat_prompt: Option<String>,
    image: Option<ImageUpload>,
    diagnosis: Option<DiagnosisResult>,
    diagnosis_error: Option<String>,
    diagnosing: bool,
}

impl Default for ScreenState {
    fn default() -> Self {
        Self {
            view: View::Dashboard,
            chat_prompt: None,
            image: None,
            diagnosis: None,
            diagnosis_error: None,
            diagnosing: false,
        }
    }
}

/// One user's screens: the dashboard, the chat backed by a
/// [`StreamAggregator`], and the image diagnosis form.
pub struct App {
    gateway: Arc<Gateway>,
    chat: Arc<StreamAggregator>,
    options: AppOptions,
    state: Mutex<ScreenState>,
    input: Mutex<TranscriptInput>,
    events: broadcast::Sender<AppEvent>,
}

impl App {
    pub fn new(gateway: Arc<Gateway>, options: AppOptions, speech: TranscriptSource) -> Self {
        let chat = Arc::new(StreamAggregator::new(Arc::clone(&gateway)));
        if let Some(warning) = gateway.check_credential() {
            warn!("{}", warning);
            chat.set_notice(warning);
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let input = TranscriptInput::new(speech, options.speech_lang.clone());
        Self {
            gateway,
            chat,
            options,
            state: Mutex::new(ScreenState::default()),
            input: Mutex::new(input),
            events,
        }
    }

    pub fn chat(&self) -> &Arc<StreamAggregator> {
        &self.chat
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    pub fn view(&self) -> View {
        self.lock_state().view
    }

    pub fn snapshot(&self) -> ScreenSnapshot {
        let state = self.lock_state();
        let input = self.lock_input();
        ScreenSnapshot {
            view: state.view,
            prompt: state.chat_prompt.clone(),
            draft: input.draft().to_string(),
            listening: input.is_listening(),
            speech_available: input.is_available(),
            has_image: state.image.is_some(),
            diagnosing: state.diagnosing,
            diagnosis: state.diagnosis.clone(),
            diagnosis_error: state.diagnosis_error.clone(),
        }
    }

    pub fn on_navigate(&self, target: View, prompt: Option<String>) {
        let prompt = prompt.filter(|p| !p.trim().is_empty());
        {
            let mut state = self.lock_state();
            let leaving_chat = state.view == View::Chat && target != View::Chat;
            state.view = target;
            if prompt.is_some() {
                state.chat_prompt = prompt.clone();
            }
            if target == View::Diagnose {
                state.image = None;
                state.diagnosis = None;
                state.diagnosis_error = None;
            }
            if leaving_chat {
                self.stop_listening();
            }
        }
        info!("Navigated to {:?}", target);

        if target == View::Chat {
            self.chat.start_new_session();
            if self.options.reset_session_on_new_chat {
                self.gateway.reset_session();
            }
            let draft = prompt.clone().unwrap_or_default();
            self.lock_input().set_draft(draft.clone());
            self.publish(AppEvent::DraftChanged(draft));
        }
        self.chat.clear_error();
        self.publish(AppEvent::ViewChanged { view: target, prompt });
    }

    /// Header back button: return to the dashboard, keeping everything else.
    pub fn on_back(&self) {
        {
            let mut state = self.lock_state();
            if state.view == View::Chat {
                self.stop_listening();
            }
            state.view = View::Dashboard;
        }
        self.publish(AppEvent::ViewChanged { view: View::Dashboard, prompt: None });
    }

    pub async fn on_submit(&self, text: &str) -> SubmitOutcome {
        let text = text.trim();
        if text.is_empty() || self.chat.is_in_flight() {
            return SubmitOutcome::Ignored;
        }
        self.lock_state().chat_prompt = None;
        self.lock_input().set_draft(String::new());
        self.publish(AppEvent::DraftChanged(String::new()));
        self.chat.submit(text).await
    }

    pub fn on_cancel(&self) -> bool {
        self.chat.cancel()
    }

    pub fn on_edit_draft(&self, text: impl Into<String>) {
        self.lock_input().set_draft(text);
    }

    pub fn on_pick_image(&self, image: ImageUpload) -> Result<(), ImageError> {
        if let Err(e) = image.ensure_within(self.options.max_image_bytes) {
            warn!("Rejected image: {}", e);
            self.publish(AppEvent::ImageRejected { message: e.to_string() });
            return Err(e);
        }
        let (mime_type, size) = (image.mime_type().to_string(), image.len());
        {
            let mut state = self.lock_state();
            state.image = Some(image);
            state.diagnosis = None;
            state.diagnosis_error = None;
        }
        info!("Image selected ({}, {} bytes)", mime_type, size);
        self.publish(AppEvent::ImageSelected { mime_type, size });
        Ok(())
    }

    /// Runs a diagnosis of the selected image. `None` when there is no image
    /// or a diagnosis is already running.
    pub async fn on_diagnose_request(&self) -> Option<Result<DiagnosisResult, String>> {
        let image = {
            let mut state = self.lock_state();
            if state.diagnosing {
                return None;
            }
            let image = state.image.clone()?;
            state.diagnosing = true;
            state.diagnosis = None;
            state.diagnosis_error = None;
            image
        };
        self.publish(AppEvent::DiagnosisStarted);

        let result = self.gateway.diagnose(&image).await.map_err(|e| e.to_string());

        {
            let mut state = self.lock_state();
            state.diagnosing = false;
            match &result {
                Ok(diagnosis) => {
                    state.diagnosis = Some(diagnosis.clone());
                }
                Err(message) => {
                    state.diagnosis_error = Some(message.clone());
                }
            }
        }
        match &result {
            Ok(diagnosis) => {
                info!("Diagnosis ready: {}", diagnosis.disease);
                self.publish(AppEvent::DiagnosisReady(diagnosis.clone()));
            }
            Err(message) => {
                warn!("Diagnosis failed: {}", message);
                self.publish(AppEvent::DiagnosisFailed { message: message.clone() });
            }
        }
        Some(result)
    }

    pub fn set_speech_source(&self, source: TranscriptSource) {
        let mut input = self.lock_input();
        input.set_source(source);
        info!("Speech capture {}", if input.is_available() { "available" } else { "unavailable" });
    }

    pub fn on_toggle_listening(&self) -> Result<bool, TranscriptError> {
        let result = self.lock_input().toggle_listening();
        match &result {
            Ok(listening) => self.publish(AppEvent::ListeningChanged(*listening)),
            Err(e) => self.publish(AppEvent::SpeechError { message: e.to_string() }),
        }
        result
    }

    pub fn on_transcript(&self, results: &[RecognitionResult], result_index: usize) {
        let draft = self.lock_input().on_results(results, result_index).map(str::to_string);
        if let Some(draft) = draft {
            self.publish(AppEvent::DraftChanged(draft));
        }
    }

    pub fn on_transcript_error(&self, error: &str) {
        let err = self.lock_input().on_error(error);
        self.publish(AppEvent::ListeningChanged(false));
        self.publish(AppEvent::SpeechError { message: err.to_string() });
    }

    pub fn on_transcript_end(&self) {
        self.lock_input().on_end();
        self.publish(AppEvent::ListeningChanged(false));
    }

    fn stop_listening(&self) {
        let mut input = self.lock_input();
        if input.is_listening() {
            input.stop_listening();
            self.publish(AppEvent::ListeningChanged(false));
        }
    }

    fn publish(&self, event: AppEvent) {
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, ScreenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_input(&self) -> MutexGuard<'_, TranscriptInput> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

use serde::{ Serialize, Deserialize };

use crate::app::{ AppEvent, DashboardCard, ScreenSnapshot, View };
use crate::chat::ChatEvent;
use crate::models::chat::{ ConversationTurn, TurnId };
use crate::models::diagnosis::DiagnosisResult;
use crate::render::{ render, RenderedSegment };
use crate::transcript::{ RecognitionResult, RecognizerCommand };

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "hello")] Hello {
        #[serde(default)]
        speech_supported: bool,
    },
    #[serde(rename = "navigate")] Navigate {
        view: View,
        #[serde(default)]
        prompt: Option<String>,
    },
    #[serde(rename = "back")]
    Back,
    #[serde(rename = "chat")] Chat {
        content: String,
    },
    #[serde(rename = "draft")] Draft {
        text: String,
    },
    #[serde(rename = "cancel")]
    Cancel,
    #[serde(rename = "pick_image")] PickImage {
        data_url: String,
    },
    #[serde(rename = "diagnose")]
    Diagnose,
    #[serde(rename = "toggle_listening")]
    ToggleListening,
    #[serde(rename = "transcript")] Transcript {
        result_index: usize,
        results: Vec<RecognitionResult>,
    },
    #[serde(rename = "transcript_error")] TranscriptError {
        error: String,
    },
    #[serde(rename = "transcript_end")]
    TranscriptEnd,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "screen")] Screen {
        screen: ScreenSnapshot,
        cards: Vec<DashboardCard>,
    },
    #[serde(rename = "view")] View {
        view: View,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    #[serde(rename = "history")] History {
        turns: Vec<ConversationTurn>,
        error: Option<String>,
    },
    #[serde(rename = "turn")] Turn {
        turn: ConversationTurn,
    },
    #[serde(rename = "chunk")] Chunk {
        turn_id: TurnId,
        text: String,
    },
    #[serde(rename = "finalized")] Finalized {
        turn_id: TurnId,
        segments: Vec<RenderedSegment>,
    },
    #[serde(rename = "discarded")] Discarded {
        turn_id: TurnId,
    },
    #[serde(rename = "error")] Error {
        message: String,
    },
    #[serde(rename = "error_cleared")]
    ErrorCleared,
    #[serde(rename = "processing")] Processing {
        in_flight: bool,
    },
    #[serde(rename = "image_selected")] ImageSelected {
        mime_type: String,
        size: usize,
    },
    #[serde(rename = "image_rejected")] ImageRejected {
        message: String,
    },
    #[serde(rename = "diagnosing")]
    Diagnosing,
    #[serde(rename = "diagnosis")] Diagnosis {
        result: DiagnosisResult,
        remedy_segments: Vec<RenderedSegment>,
    },
    #[serde(rename = "diagnosis_error")] DiagnosisError {
        message: String,
    },
    #[serde(rename = "draft")] Draft {
        text: String,
    },
    #[serde(rename = "listening")] Listening {
        active: bool,
    },
    #[serde(rename = "speech_error")] SpeechError {
        message: String,
    },
    #[serde(rename = "start_listening")] StartListening {
        lang: String,
    },
    #[serde(rename = "stop_listening")]
    StopListening,
}

impl From<ChatEvent> for ServerMessage {
    fn from(event: ChatEvent) -> Self {
        match event {
            ChatEvent::TurnAppended(turn) => ServerMessage::Turn { turn },
            ChatEvent::ChunkApplied { turn_id, text } => ServerMessage::Chunk { turn_id, text },
            ChatEvent::TurnFinalized { turn_id, content } =>
                ServerMessage::Finalized { turn_id, segments: render(&content) },
            ChatEvent::TurnDiscarded { turn_id } => ServerMessage::Discarded { turn_id },
            ChatEvent::Error { message } => ServerMessage::Error { message },
            ChatEvent::ErrorCleared => ServerMessage::ErrorCleared,
            ChatEvent::HistoryCleared => ServerMessage::History { turns: Vec::new(), error: None },
            ChatEvent::InFlight { active } => ServerMessage::Processing { in_flight: active },
        }
    }
}

impl From<AppEvent> for ServerMessage {
    fn from(event: AppEvent) -> Self {
        match event {
            AppEvent::ViewChanged { view, prompt } => ServerMessage::View { view, prompt },
            AppEvent::ImageSelected { mime_type, size } => ServerMessage::ImageSelected { mime_type, size },
            AppEvent::ImageRejected { message } => ServerMessage::ImageRejected { message },
            AppEvent::DiagnosisStarted => ServerMessage::Diagnosing,
            AppEvent::DiagnosisReady(result) => {
                let remedy_segments = render(&result.remedy);
                ServerMessage::Diagnosis { result, remedy_segments }
            }
            AppEvent::DiagnosisFailed { message } => ServerMessage::DiagnosisError { message },
            AppEvent::DraftChanged(text) => ServerMessage::Draft { text },
            AppEvent::ListeningChanged(active) => ServerMessage::Listening { active },
            AppEvent::SpeechError { message } => ServerMessage::SpeechError { message },
        }
    }
}

impl From<RecognizerCommand> for ServerMessage {
    fn from(command: RecognizerCommand) -> Self {
        match command {
            RecognizerCommand::Start { lang } => ServerMessage::StartListening { lang },
            RecognizerCommand::Stop => ServerMessage::StopListening,
        }
    }
}

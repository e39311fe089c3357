//! Dictation into the chat input. Capture itself happens on the client; this
//! side decides when to listen and folds finished segments into the draft.

use log::{ info, warn };
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use tokio::sync::mpsc;

pub const DEFAULT_SPEECH_LANG: &str = "en-US";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TranscriptError {
    #[error("Speech recognition not supported in this browser.")]
    Unavailable,
    #[error("Speech recognition error: {0}")]
    Recognition(String),
}

pub trait SpeechRecognizer: Send {
    fn start(&mut self, lang: &str) -> Result<(), TranscriptError>;
    fn stop(&mut self) -> Result<(), TranscriptError>;
}

pub enum TranscriptSource {
    Available(Box<dyn SpeechRecognizer>),
    Unavailable,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RecognitionResult {
    pub transcript: String,
    pub is_final: bool,
}

/// Concatenates the final results from `result_index` on. Interim results are
/// skipped, and a blank outcome yields nothing.
pub fn final_segment(results: &[RecognitionResult], result_index: usize) -> Option<String> {
    let joined: String = results
        .iter()
        .skip(result_index)
        .filter(|r| r.is_final)
        .map(|r| r.transcript.as_str())
        .collect();
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn append_segment(draft: &str, segment: &str) -> String {
    if draft.trim().is_empty() {
        segment.to_string()
    } else {
        format!("{} {}", draft, segment)
    }
}

/// The chat input box: typed or prefilled text plus dictated segments.
pub struct TranscriptInput {
    source: TranscriptSource,
    lang: String,
    listening: bool,
    draft: String,
}

impl TranscriptInput {
    pub fn new(source: TranscriptSource, lang: impl Into<String>) -> Self {
        Self {
            source,
            lang: lang.into(),
            listening: false,
            draft: String::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.source, TranscriptSource::Available(_))
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn take_draft(&mut self) -> String {
        std::mem::take(&mut self.draft)
    }

    /// Replaces the capture capability, stopping any capture in progress.
    pub fn set_source(&mut self, source: TranscriptSource) {
        if self.listening {
            self.stop_listening();
        }
        self.source = source;
    }

    /// Starts or stops listening; returns whether it is listening afterwards.
    pub fn toggle_listening(&mut self) -> Result<bool, TranscriptError> {
        let recognizer = match &mut self.source {
            TranscriptSource::Available(recognizer) => recognizer,
            TranscriptSource::Unavailable => {
                warn!("Speech recognition not supported on this client");
                return Err(TranscriptError::Unavailable);
            }
        };
        if self.listening {
            recognizer.stop()?;
            self.listening = false;
        } else {
            recognizer.start(&self.lang)?;
            self.listening = true;
        }
        Ok(self.listening)
    }

    pub fn stop_listening(&mut self) {
        if let TranscriptSource::Available(recognizer) = &mut self.source {
            if self.listening {
                if let Err(e) = recognizer.stop() {
                    warn!("Failed to stop speech recognizer: {}", e);
                }
            }
        }
        self.listening = false;
    }

    /// Folds a recognition batch into the draft. Returns the new draft when
    /// it changed.
    pub fn on_results(&mut self, results: &[RecognitionResult], result_index: usize) -> Option<&str> {
        let segment = final_segment(results, result_index)?;
        self.draft = append_segment(&self.draft, &segment);
        Some(self.draft.as_str())
    }

    pub fn on_error(&mut self, error: &str) -> TranscriptError {
        warn!("Speech recognition error: {}", error);
        self.listening = false;
        TranscriptError::Recognition(error.to_string())
    }

    pub fn on_end(&mut self) {
        self.listening = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerCommand {
    Start {
        lang: String,
    },
    Stop,
}

/// Recognizer that asks the connected client to capture speech.
pub struct ClientRecognizer {
    commands: mpsc::UnboundedSender<RecognizerCommand>,
}

impl ClientRecognizer {
    pub fn new(commands: mpsc::UnboundedSender<RecognizerCommand>) -> Self {
        Self { commands }
    }

    fn send(&self, command: RecognizerCommand) -> Result<(), TranscriptError> {
        self.commands
            .send(command)
            .map_err(|_| TranscriptError::Recognition("client disconnected".to_string()))
    }
}

impl SpeechRecognizer for ClientRecognizer {
    fn start(&mut self, lang: &str) -> Result<(), TranscriptError> {
        info!("Asking client to start speech capture ({})", lang);
        self.send(RecognizerCommand::Start { lang: lang.to_string() })
    }

    fn stop(&mut self) -> Result<(), TranscriptError> {
        self.send(RecognizerCommand::Stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(text: &str, is_final: bool) -> RecognitionResult {
        RecognitionResult { transcript: text.to_string(), is_final }
    }

    fn available() -> (TranscriptInput, mpsc::UnboundedReceiver<RecognizerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let input = TranscriptInput::new(
            TranscriptSource::Available(Box::new(ClientRecognizer::new(tx))),
            "kn-IN"
        );
        (input, rx)
    }

    #[test]
    fn final_segment_skips_interim_and_earlier_results() {
        let results = vec![
            result("old words", true),
            result(" tomato", true),
            result(" pri", false),
            result(" prices ", true)
        ];
        assert_eq!(final_segment(&results, 1).as_deref(), Some("tomato prices"));
        assert_eq!(final_segment(&results[2..3], 0), None);
        assert_eq!(final_segment(&[result("   ", true)], 0), None);
    }

    #[test]
    fn segments_join_with_single_space() {
        assert_eq!(append_segment("", "tomato"), "tomato");
        assert_eq!(append_segment("  ", "tomato"), "tomato");
        assert_eq!(append_segment("What are", "tomato prices"), "What are tomato prices");
    }

    #[test]
    fn results_accumulate_into_draft() {
        let (mut input, _rx) = available();
        input.set_draft("Tell me about");
        assert_eq!(input.on_results(&[result("drip irrigation", true)], 0), Some("Tell me about drip irrigation"));
        assert_eq!(input.on_results(&[result("subsidy", false)], 0), None);
        assert_eq!(input.take_draft(), "Tell me about drip irrigation");
        assert_eq!(input.draft(), "");
    }

    #[test]
    fn toggling_drives_the_client() {
        let (mut input, mut rx) = available();
        assert!(input.is_available());
        assert_eq!(input.toggle_listening(), Ok(true));
        assert_eq!(rx.try_recv().unwrap(), RecognizerCommand::Start { lang: "kn-IN".to_string() });
        assert_eq!(input.toggle_listening(), Ok(false));
        assert_eq!(rx.try_recv().unwrap(), RecognizerCommand::Stop);
    }

    #[test]
    fn unavailable_source_never_listens() {
        let mut input = TranscriptInput::new(TranscriptSource::Unavailable, DEFAULT_SPEECH_LANG);
        assert_eq!(input.toggle_listening(), Err(TranscriptError::Unavailable));
        assert_eq!(input.toggle_listening(), Err(TranscriptError::Unavailable));
        assert!(!input.is_listening());
    }

    #[test]
    fn recognition_error_stops_listening() {
        let (mut input, _rx) = available();
        input.toggle_listening().unwrap();
        let err = input.on_error("no-speech");
        assert_eq!(err, TranscriptError::Recognition("no-speech".to_string()));
        assert!(!input.is_listening());
    }

    #[test]
    fn disconnected_client_fails_to_start() {
        let (mut input, rx) = available();
        drop(rx);
        assert!(matches!(input.toggle_listening(), Err(TranscriptError::Recognition(_))));
        assert!(!input.is_listening());
    }
}

use futures::StreamExt;
use log::{ debug, error, info, warn };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use tokio::sync::{ broadcast, watch };

use crate::gateway::Gateway;
use crate::llm::chat::ChunkStream;
use crate::llm::GatewayError;
use crate::models::chat::{ ConversationTurn, TurnId };

const EVENT_CAPACITY: usize = 256;

/// Changes to the chat state, published in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    TurnAppended(ConversationTurn),
    ChunkApplied {
        turn_id: TurnId,
        text: String,
    },
    TurnFinalized {
        turn_id: TurnId,
        content: String,
    },
    TurnDiscarded {
        turn_id: TurnId,
    },
    Error {
        message: String,
    },
    ErrorCleared,
    HistoryCleared,
    InFlight {
        active: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Another reply was still streaming; nothing changed.
    Ignored,
    Finalized {
        turn_id: TurnId,
        content: String,
    },
    Failed {
        message: String,
    },
    /// Stopped on request. `kept` is false when nothing of the reply survived.
    Cancelled {
        turn_id: TurnId,
        kept: bool,
    },
}

enum StreamEnd {
    Exhausted,
    Cancelled,
}

#[derive(Default)]
struct ChatState {
    turns: Vec<ConversationTurn>,
    error: Option<String>,
    cancel: Option<watch::Sender<bool>>,
}

/// Folds one streamed model reply at a time into the conversation history.
///
/// A submission appends the user turn and an empty model turn, then appends
/// every chunk to that model turn in arrival order. A failed stream removes
/// the model turn again and leaves an error notice instead. Only one reply can
/// be in flight; submissions made meanwhile are ignored.
pub struct StreamAggregator {
    gateway: Arc<Gateway>,
    state: Mutex<ChatState>,
    in_flight: AtomicBool,
    events: broadcast::Sender<ChatEvent>,
}

impl StreamAggregator {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            gateway,
            state: Mutex::new(ChatState::default()),
            in_flight: AtomicBool::new(false),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        self.lock_state().turns.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.lock_state().error.clone()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub async fn submit(&self, user_text: &str) -> SubmitOutcome {
        let mut guard = match InFlightGuard::acquire(self) {
            Some(guard) => guard,
            None => {
                debug!("Ignoring submission while a reply is still streaming");
                return SubmitOutcome::Ignored;
            }
        };

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let model_turn = {
            let mut state = self.lock_state();
            if state.error.take().is_some() {
                self.publish(ChatEvent::ErrorCleared);
            }
            let user_turn = ConversationTurn::user(user_text);
            let model_turn = ConversationTurn::model();
            state.turns.push(user_turn.clone());
            state.turns.push(model_turn.clone());
            state.cancel = Some(cancel_tx);
            self.publish(ChatEvent::TurnAppended(user_turn));
            self.publish(ChatEvent::TurnAppended(model_turn.clone()));
            model_turn.id
        };
        guard.turn = Some(model_turn);
        self.publish(ChatEvent::InFlight { active: true });
        info!("Streaming reply into turn {}", model_turn);

        let outcome = match self.drive(model_turn, user_text, &mut cancel_rx).await {
            Ok(StreamEnd::Exhausted) => self.finalize(model_turn),
            Ok(StreamEnd::Cancelled) => self.finish_cancelled(model_turn),
            Err(e) => self.fail(model_turn, e),
        };
        guard.turn = None;
        outcome
    }

    /// Asks the in-flight reply to stop. Returns false when nothing is streaming.
    pub fn cancel(&self) -> bool {
        let state = self.lock_state();
        match &state.cancel {
            Some(tx) => {
                info!("Cancelling in-flight reply");
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Drops the whole conversation, stopping any reply still streaming.
    pub fn start_new_session(&self) {
        let mut state = self.lock_state();
        if let Some(tx) = &state.cancel {
            tx.send_replace(true);
        }
        state.turns.clear();
        state.error = None;
        self.publish(ChatEvent::HistoryCleared);
        info!("Started a new chat session");
    }

    /// Shows a notice through the same channel as stream failures.
    pub fn set_notice(&self, message: impl Into<String>) {
        let message = message.into();
        self.lock_state().error = Some(message.clone());
        self.publish(ChatEvent::Error { message });
    }

    pub fn clear_error(&self) {
        if self.lock_state().error.take().is_some() {
            self.publish(ChatEvent::ErrorCleared);
        }
    }

    async fn drive(
        &self,
        turn_id: TurnId,
        user_text: &str,
        cancel_rx: &mut watch::Receiver<bool>
    ) -> Result<StreamEnd, GatewayError> {
        let mut stream: ChunkStream = self.gateway.stream_reply(user_text).await?;
        loop {
            tokio::select! {
                biased;
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        return Ok(StreamEnd::Cancelled);
                    }
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(chunk)) => {
                            if !self.apply_chunk(turn_id, chunk) {
                                debug!("Turn {} left the history; abandoning its stream", turn_id);
                                return Ok(StreamEnd::Cancelled);
                            }
                        }
                        Some(Err(e)) => {
                            return Err(e);
                        }
                        None => {
                            return Ok(StreamEnd::Exhausted);
                        }
                    }
                }
            }
        }
    }

    fn apply_chunk(&self, turn_id: TurnId, chunk: String) -> bool {
        let mut state = self.lock_state();
        match state.turns.iter_mut().find(|t| t.id == turn_id) {
            Some(turn) => {
                turn.content.push_str(&chunk);
                self.publish(ChatEvent::ChunkApplied { turn_id, text: chunk });
                true
            }
            None => false,
        }
    }

    fn finalize(&self, turn_id: TurnId) -> SubmitOutcome {
        let state = self.lock_state();
        match state.turns.iter().find(|t| t.id == turn_id) {
            Some(turn) => {
                let content = turn.content.clone();
                info!("Turn {} finalized ({} bytes)", turn_id, content.len());
                self.publish(ChatEvent::TurnFinalized { turn_id, content: content.clone() });
                SubmitOutcome::Finalized { turn_id, content }
            }
            None => SubmitOutcome::Cancelled { turn_id, kept: false },
        }
    }

    fn finish_cancelled(&self, turn_id: TurnId) -> SubmitOutcome {
        let mut state = self.lock_state();
        let content = match state.turns.iter().find(|t| t.id == turn_id) {
            Some(turn) => turn.content.clone(),
            None => {
                return SubmitOutcome::Cancelled { turn_id, kept: false };
            }
        };
        if content.is_empty() {
            state.turns.retain(|t| t.id != turn_id);
            self.publish(ChatEvent::TurnDiscarded { turn_id });
            return SubmitOutcome::Cancelled { turn_id, kept: false };
        }
        info!("Turn {} stopped early with {} bytes", turn_id, content.len());
        self.publish(ChatEvent::TurnFinalized { turn_id, content });
        SubmitOutcome::Cancelled { turn_id, kept: true }
    }

    fn fail(&self, turn_id: TurnId, err: GatewayError) -> SubmitOutcome {
        let message = err.to_string();
        error!("Reply for turn {} failed: {}", turn_id, message);
        let mut state = self.lock_state();
        let before = state.turns.len();
        state.turns.retain(|t| t.id != turn_id);
        if state.turns.len() != before {
            self.publish(ChatEvent::TurnDiscarded { turn_id });
        }
        state.error = Some(message.clone());
        self.publish(ChatEvent::Error { message: message.clone() });
        SubmitOutcome::Failed { message }
    }

    fn publish(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds the in-flight slot. Dropping it frees the slot, and if the model turn
/// was never settled (the submit future was dropped) removes that turn.
struct InFlightGuard<'a> {
    owner: &'a StreamAggregator,
    turn: Option<TurnId>,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(owner: &'a StreamAggregator) -> Option<Self> {
        owner.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { owner, turn: None })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.owner.lock_state();
            if let Some(turn_id) = self.turn.take() {
                warn!("Reply for turn {} abandoned before it settled", turn_id);
                let before = state.turns.len();
                state.turns.retain(|t| t.id != turn_id);
                if state.turns.len() != before {
                    self.owner.publish(ChatEvent::TurnDiscarded { turn_id });
                }
            }
            state.cancel = None;
        }
        self.owner.in_flight.store(false, Ordering::SeqCst);
        self.owner.publish(ChatEvent::InFlight { active: false });
    }
}

//! In-memory stand-ins for the model service, shared by unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::sync::{ Arc, Mutex };
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::gateway::Gateway;
use crate::llm::chat::{ ChatSession, ChunkStream };
use crate::llm::diagnosis::{ parse_diagnosis, DiagnosisClient };
use crate::llm::GatewayError;
use crate::models::diagnosis::{ DiagnosisResult, ImageUpload };

pub type Script = Vec<Result<String, GatewayError>>;

enum Reply {
    Scripted(Script),
    Fed(mpsc::Receiver<Result<String, GatewayError>>),
    Refuse(GatewayError),
}

/// Chat session whose replies are queued up front, one per call.
#[derive(Default)]
pub struct ScriptedSession {
    replies: Mutex<VecDeque<Reply>>,
    messages: Mutex<Vec<String>>,
    resets: AtomicUsize,
}

impl ScriptedSession {
    pub fn new(scripts: Vec<Script>) -> Self {
        let session = Self::default();
        for script in scripts {
            session.replies.lock().unwrap().push_back(Reply::Scripted(script));
        }
        session
    }

    /// Queues a reply whose chunks the test pushes through the returned sender.
    pub fn feed(&self) -> mpsc::Sender<Result<String, GatewayError>> {
        let (tx, rx) = mpsc::channel(64);
        self.replies.lock().unwrap().push_back(Reply::Fed(rx));
        tx
    }

    /// Queues a call that fails before any stream is returned.
    pub fn refuse(&self, err: GatewayError) {
        self.replies.lock().unwrap().push_back(Reply::Refuse(err));
    }

    pub fn calls(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatSession for ScriptedSession {
    async fn stream_reply(&self, message: &str) -> Result<ChunkStream, GatewayError> {
        self.messages.lock().unwrap().push(message.to_string());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Scripted(script)) => Ok(Box::pin(futures::stream::iter(script))),
            Some(Reply::Fed(rx)) => Ok(Box::pin(ReceiverStream::new(rx))),
            Some(Reply::Refuse(err)) => Err(err),
            None => Ok(Box::pin(futures::stream::empty())),
        }
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn model(&self) -> String {
        "scripted".to_string()
    }
}

/// Diagnosis client that answers every image with the same raw reply text.
pub struct StaticDiagnosis {
    reply: Option<String>,
    calls: AtomicUsize,
}

impl StaticDiagnosis {
    pub fn reply(raw: &str) -> Arc<Self> {
        Arc::new(Self { reply: Some(raw.to_string()), calls: AtomicUsize::new(0) })
    }

    /// Never answers.
    pub fn stalled() -> Arc<Self> {
        Arc::new(Self { reply: None, calls: AtomicUsize::new(0) })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiagnosisClient for StaticDiagnosis {
    async fn diagnose(&self, _image: &ImageUpload) -> Result<DiagnosisResult, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Some(raw) => parse_diagnosis(raw),
            None => futures::future::pending().await,
        }
    }
}

pub fn gateway_with<S, D>(api_key: Option<&str>, session: Arc<S>, diagnosis: Arc<D>) -> Gateway
where
    S: ChatSession + 'static,
    D: DiagnosisClient + 'static,
{
    Gateway::new(api_key.map(str::to_string), session, diagnosis)
}

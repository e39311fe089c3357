pub mod gemini;

use async_trait::async_trait;
use futures::{ Future, Stream, StreamExt };
use log::debug;
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::GatewayError;

pub use self::gemini::GeminiChatSession;

/// Forward-only sequence of reply fragments. Consumed once.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>;

type ChunkSender = mpsc::Sender<Result<String, GatewayError>>;

const CHANNEL_CAPACITY: usize = 32;

/// A conversation that keeps its context across calls.
#[async_trait]
pub trait ChatSession: Send + Sync {
    async fn stream_reply(&self, message: &str) -> Result<ChunkStream, GatewayError>;

    /// Forget all context gathered so far.
    fn reset(&self);

    fn model(&self) -> String;
}

pub fn create_streaming_response<F, Fut>(response_fn: F) -> ChunkStream
where
    F: FnOnce(ChunkSender) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Re-emits `inner`, failing with `GatewayError::Timeout` when a single chunk
/// takes longer than `limit` to show up.
pub fn with_chunk_timeout(mut inner: ChunkStream, limit: Duration) -> ChunkStream {
    create_streaming_response(move |tx| async move {
        loop {
            match tokio::time::timeout(limit, inner.next()).await {
                Ok(Some(item)) => {
                    let failed = item.is_err();
                    if tx.send(item).await.is_err() || failed {
                        return;
                    }
                }
                Ok(None) => {
                    return;
                }
                Err(_) => {
                    let _ = tx.send(Err(GatewayError::Timeout(limit))).await;
                    return;
                }
            }
        }
    })
}

/// Splits a byte stream into lines. Frames may end anywhere, including inside
/// a multi-byte character, so bytes are held until their line is complete.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(Self::decode(&line));
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = Self::decode(&self.pending);
        self.pending.clear();
        Some(line)
    }

    fn decode(line: &[u8]) -> String {
        String::from_utf8_lossy(line).trim_end_matches(['\r', '\n']).to_string()
    }
}

/// POSTs `payload` and streams the reply line by line through `line_parser`.
/// `on_complete` receives the whole reply text, and only runs when the
/// transport finished cleanly and every chunk was handed to the consumer.
pub fn http_stream_generate<P, C>(
    http: reqwest::Client,
    url: String,
    payload: P,
    line_parser: fn(&str) -> Result<Option<String>, GatewayError>,
    on_complete: C
) -> ChunkStream
where
    P: Serialize + Send + 'static,
    C: FnOnce(String) + Send + 'static,
{
    create_streaming_response(move |tx| async move {
        let resp = match http.post(&url).json(&payload).send().await {
            Ok(resp) => resp,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let _ = tx.send(Err(GatewayError::from_http_status(status.as_u16(), &body))).await;
            return;
        }

        let mut decoder = LineDecoder::default();
        let mut reply = String::new();
        let mut bytes = resp.bytes_stream();
        while let Some(frame) = bytes.next().await {
            match frame {
                Ok(buf) => {
                    for line in decoder.feed(&buf) {
                        if !forward_line(&tx, &mut reply, line_parser, &line).await {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            }
        }
        if let Some(line) = decoder.finish() {
            if !forward_line(&tx, &mut reply, line_parser, &line).await {
                return;
            }
        }

        debug!("Stream from {} complete ({} bytes of text)", url, reply.len());
        on_complete(reply);
    })
}

async fn forward_line(
    tx: &ChunkSender,
    reply: &mut String,
    line_parser: fn(&str) -> Result<Option<String>, GatewayError>,
    line: &str
) -> bool {
    match line_parser(line) {
        Ok(Some(text)) => {
            reply.push_str(&text);
            tx.send(Ok(text)).await.is_ok()
        }
        Ok(None) => true,
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            false
        }
    }
}

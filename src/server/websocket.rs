use crate::app::{ App, AppEvent, DASHBOARD_CARDS };
use crate::chat::ChatEvent;
use crate::models::diagnosis::ImageUpload;
use crate::models::websocket::{ ClientMessage, ServerMessage };
use crate::server::ServiceContext;
use crate::transcript::{ ClientRecognizer, RecognizerCommand, TranscriptSource };

use std::error::Error;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{ broadcast, mpsc };
use tokio::task::JoinHandle;

use tokio_tungstenite::{ accept_async, WebSocketStream };
use tokio_tungstenite::tungstenite::protocol::Message;

use lazy_static::lazy_static;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };

use log::{ debug, info, warn, error };
use futures_util::{ SinkExt, StreamExt };
use uuid::Uuid;

/// Room for the JSON framing around an image data URL.
const MESSAGE_OVERHEAD: usize = 64 * 1024;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(
            Quota::per_second(NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN))
        );
}

/// Largest accepted client message: a base64 data URL of the biggest allowed
/// image plus framing.
pub fn max_message_size(max_image_bytes: usize) -> usize {
    max_image_bytes.div_ceil(3) * 4 + MESSAGE_OVERHEAD
}

pub async fn start_ws_server(
    addr: &str,
    context: Arc<ServiceContext>
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!("WS server listening on: {}", addr);
    serve(listener, context).await
}

pub async fn serve(
    listener: TcpListener,
    context: Arc<ServiceContext>
) -> Result<(), Box<dyn Error + Send + Sync>> {
    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let context = Arc::clone(&context);

        tokio::spawn(async move {
            if let Err(e) = process_connection(peer, stream, context).await {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    context: Arc<ServiceContext>
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    match accept_async(stream).await {
        Ok(ws) => {
            handle_connection(peer, ws, context).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

/// Serialized frames headed to one client. Every writer goes through here so
/// frames leave in the order they were queued.
#[derive(Clone)]
struct Outbound {
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Message>,
}

impl Outbound {
    fn send(&self, msg: &ServerMessage) -> bool {
        match serde_json::to_string(msg) {
            Ok(json) => self.tx.send(Message::Text(json)).is_ok(),
            Err(e) => {
                error!("Failed to serialize message for {}: {}", self.peer, e);
                false
            }
        }
    }
}

pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    context: Arc<ServiceContext>
)
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let connection_id = Uuid::new_v4();
    info!("New WebSocket connection: {} (Conn ID: {})", peer, connection_id);

    let (mut sink, mut source) = websocket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                debug!("Writer for {} stopped: {}", peer, e);
                break;
            }
        }
        let _ = sink.close().await;
    });
    let out = Outbound { peer, tx: out_tx };

    let gateway = Arc::new(context.new_gateway());
    let app = Arc::new(App::new(gateway, context.options.clone(), TranscriptSource::Unavailable));
    let max_size = max_message_size(context.options.max_image_bytes);

    let chat_rx = app.chat().subscribe();
    let app_rx = app.subscribe();
    out.send(&ServerMessage::Screen { screen: app.snapshot(), cards: DASHBOARD_CARDS.to_vec() });
    out.send(&history_message(&app));
    let forwarder = tokio::spawn(forward_events(Arc::clone(&app), chat_rx, app_rx, out.clone()));

    let (command_tx, command_rx) = mpsc::unbounded_channel::<RecognizerCommand>();
    let relay = tokio::spawn(relay_recognizer(command_rx, out.clone()));

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    while let Some(msg) = source.next().await {
        match msg {
            Ok(message) => {
                if message.len() > max_size {
                    warn!("Message from {} exceeds size limit ({} > {})", peer, message.len(), max_size);
                    out.send(&ServerMessage::Error { message: "Message too large".to_string() });
                    break;
                }

                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => {
                                tasks.retain(|t| !t.is_finished());
                                if let Some(task) = dispatch(&app, client_msg, &command_tx, &out) {
                                    tasks.push(task);
                                }
                            }
                            Err(e) => {
                                error!("Failed to parse message from {}: {}", peer, e);
                                let error_msg = ServerMessage::Error {
                                    message: format!("Failed to parse message: {}", e),
                                };
                                if !out.send(&error_msg) {
                                    break;
                                }
                            }
                        }
                    }
                    Message::Close(_) => {
                        info!("Received close frame from {}", peer);
                        break;
                    }
                    Message::Ping(ping_data) => {
                        if out.tx.send(Message::Pong(ping_data)).is_err() {
                            error!("Failed to send pong to {}", peer);
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Binary(_) => {
                        warn!("Ignoring binary message from {}", peer);
                    }
                    Message::Frame(_) => {}
                }
            }
            Err(e) => {
                match e {
                    | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    | tokio_tungstenite::tungstenite::Error::Protocol(_)
                    | tokio_tungstenite::tungstenite::Error::Utf8 => {
                        info!("WebSocket connection closed or protocol error for {}: {}", peer, e);
                    }
                    tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                        io_err.kind() == std::io::ErrorKind::ConnectionReset
                    => {
                        info!("WebSocket connection reset by peer {}", peer);
                    }
                    tokio_tungstenite::tungstenite::Error::Capacity(ref cap_err) => {
                        error!("WebSocket capacity error for {}: {}", peer, cap_err);
                        out.send(&ServerMessage::Error { message: "Message too large".to_string() });
                    }
                    _ => {
                        error!("Error receiving message from {}: {}", peer, e);
                    }
                }
                break;
            }
        }
    }

    // Aborted submissions discard their unfinished model turn.
    for task in tasks {
        task.abort();
    }
    forwarder.abort();
    relay.abort();
    drop(command_tx);
    drop(out);
    drop(app);
    let _ = writer.await;
    info!("WebSocket connection closed for {} (Conn ID: {})", peer, connection_id);
}

/// Applies one client message. Long-running work comes back as a task so the
/// connection keeps reading `cancel` and `navigate` meanwhile.
fn dispatch(
    app: &Arc<App>,
    msg: ClientMessage,
    commands: &mpsc::UnboundedSender<RecognizerCommand>,
    out: &Outbound
) -> Option<JoinHandle<()>> {
    match msg {
        ClientMessage::Hello { speech_supported } => {
            let source = if speech_supported {
                TranscriptSource::Available(Box::new(ClientRecognizer::new(commands.clone())))
            } else {
                TranscriptSource::Unavailable
            };
            app.set_speech_source(source);
            out.send(&ServerMessage::Screen { screen: app.snapshot(), cards: DASHBOARD_CARDS.to_vec() });
        }
        ClientMessage::Navigate { view, prompt } => app.on_navigate(view, prompt),
        ClientMessage::Back => app.on_back(),
        ClientMessage::Chat { content } => {
            let app = Arc::clone(app);
            return Some(
                tokio::spawn(async move {
                    let outcome = app.on_submit(&content).await;
                    debug!("Submission settled: {:?}", outcome);
                })
            );
        }
        ClientMessage::Draft { text } => app.on_edit_draft(text),
        ClientMessage::Cancel => {
            if !app.on_cancel() {
                debug!("Cancel requested with nothing in flight");
            }
        }
        ClientMessage::PickImage { data_url } => {
            match ImageUpload::from_data_url(&data_url) {
                Ok(image) => {
                    // Rejections are published as events.
                    let _ = app.on_pick_image(image);
                }
                Err(e) => {
                    warn!("Unreadable image from {}: {}", out.peer, e);
                    out.send(&ServerMessage::ImageRejected { message: e.to_string() });
                }
            }
        }
        ClientMessage::Diagnose => {
            let app = Arc::clone(app);
            return Some(
                tokio::spawn(async move {
                    if app.on_diagnose_request().await.is_none() {
                        debug!("Diagnose requested without an image or while busy");
                    }
                })
            );
        }
        ClientMessage::ToggleListening => {
            let _ = app.on_toggle_listening();
        }
        ClientMessage::Transcript { result_index, results } => app.on_transcript(&results, result_index),
        ClientMessage::TranscriptError { error } => app.on_transcript_error(&error),
        ClientMessage::TranscriptEnd => app.on_transcript_end(),
    }
    None
}

fn history_message(app: &App) -> ServerMessage {
    ServerMessage::History { turns: app.chat().history(), error: app.chat().error() }
}

async fn forward_events(
    app: Arc<App>,
    mut chat_rx: broadcast::Receiver<ChatEvent>,
    mut app_rx: broadcast::Receiver<AppEvent>,
    out: Outbound
) {
    loop {
        let delivered = tokio::select! {
            event = chat_rx.recv() => match event {
                Ok(event) => out.send(&ServerMessage::from(event)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Client {} lagged {} chat events; resending history", out.peer, skipped);
                    out.send(&history_message(&app))
                }
                Err(RecvError::Closed) => break,
            },
            event = app_rx.recv() => match event {
                Ok(event) => out.send(&ServerMessage::from(event)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Client {} lagged {} screen events; resending screen", out.peer, skipped);
                    out.send(&ServerMessage::Screen { screen: app.snapshot(), cards: DASHBOARD_CARDS.to_vec() })
                }
                Err(RecvError::Closed) => break,
            },
        };
        if !delivered {
            break;
        }
    }
}

async fn relay_recognizer(mut commands: mpsc::UnboundedReceiver<RecognizerCommand>, out: Outbound) {
    while let Some(command) = commands.recv().await {
        if !out.send(&ServerMessage::from(command)) {
            break;
        }
    }
}

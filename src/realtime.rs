//! Streaming dialogue backend speaking the OpenAI Realtime protocol.
//!
//! Caller audio is appended to the server input buffer as G.711 μ-law and the
//! server's own VAD decides when the caller spoke. Response audio comes back
//! in the same format, so it is forwarded to the telephony transport as is.

use crate::backend::{
    BackendCommand, BackendError, BackendEvent, BackendHandle, BackendSession, DialogueBackend,
    InputMode,
};
use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

type WsSink = Arc<
    Mutex<
        futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            WsMessage,
        >,
    >,
>;

type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    pub model: String,
    pub voice: String,
    pub instructions: Option<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "alloy".to_string(),
            instructions: None,
        }
    }
}

/// Streaming strategy: caller audio in, response audio out
pub struct RealtimeBackend {
    api_key: String,
    config: RealtimeConfig,
}

impl RealtimeBackend {
    pub fn new(api_key: impl Into<String>, config: RealtimeConfig) -> Self {
        Self {
            api_key: api_key.into(),
            config,
        }
    }

    fn request(&self) -> Result<Request, RealtimeError> {
        let url = format!("{}?model={}", self.config.url, self.config.model);
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.api_key)
                .parse()
                .map_err(|e| RealtimeError::InvalidHeader(format!("{e}")))?,
        );
        request.headers_mut().insert(
            "OpenAI-Beta",
            "realtime=v1"
                .parse()
                .map_err(|e| RealtimeError::InvalidHeader(format!("{e}")))?,
        );
        Ok(request)
    }

    async fn open(&self, call_id: &str) -> Result<(WsSink, WsStream), RealtimeError> {
        info!(call_id = %call_id, model = %self.config.model, "Connecting to realtime backend");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.request()?).await?;
        let (sink, stream) = ws_stream.split();
        let sink = Arc::new(Mutex::new(sink));

        let update = serde_json::to_string(&session_update(&self.config))?;
        sink.lock().await.send(WsMessage::Text(update.into())).await?;
        debug!(call_id = %call_id, "Sent session.update");

        Ok((sink, stream))
    }
}

#[async_trait]
impl DialogueBackend for RealtimeBackend {
    fn name(&self) -> &'static str {
        "realtime"
    }

    fn input_mode(&self) -> InputMode {
        InputMode::Audio
    }

    async fn connect(&self, call_id: &str) -> Result<BackendSession, BackendError> {
        let (sink, stream) = self
            .open(call_id)
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let call_id = call_id.to_string();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = outbound_loop(cmd_rx, sink, &call_id) => {}
                _ = inbound_loop(stream, event_tx, &call_id) => {}
            }
            debug!(call_id = %call_id, "Realtime backend task terminated");
        });

        Ok(BackendSession {
            handle: BackendHandle::new(cmd_tx),
            events: event_rx,
            task: Some(task),
        })
    }
}

/// The `session.update` sent right after connecting.
pub fn session_update(config: &RealtimeConfig) -> Value {
    let mut session = json!({
        "modalities": ["text", "audio"],
        "voice": config.voice,
        "input_audio_format": "g711_ulaw",
        "output_audio_format": "g711_ulaw",
        "turn_detection": { "type": "server_vad" },
    });
    if let Some(instructions) = &config.instructions {
        session["instructions"] = json!(instructions);
    }
    json!({ "type": "session.update", "session": session })
}

/// Client events for one command. `Close` has no wire form.
pub fn command_messages(cmd: &BackendCommand) -> Vec<Value> {
    match cmd {
        BackendCommand::Audio(ulaw) => vec![json!({
            "type": "input_audio_buffer.append",
            "audio": general_purpose::STANDARD.encode(ulaw),
        })],
        BackendCommand::Text(text) => vec![
            json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "message",
                    "role": "user",
                    "content": [{ "type": "input_text", "text": text }],
                },
            }),
            json!({ "type": "response.create" }),
        ],
        BackendCommand::Truncate {
            response_id,
            audio_end_ms,
        } => vec![json!({
            "type": "conversation.item.truncate",
            "item_id": response_id,
            "content_index": 0,
            "audio_end_ms": audio_end_ms,
        })],
        BackendCommand::Close => Vec::new(),
    }
}

fn str_field<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

/// Map one server event to a backend event.
pub fn parse_server_event(text: &str) -> BackendEvent {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return BackendEvent::Error(format!("unparseable realtime event: {e}")),
    };

    let kind = str_field(&value, "/type").unwrap_or_default();
    match kind {
        "session.created" | "session.updated" => BackendEvent::SessionReady,
        "response.created" => BackendEvent::ResponseStarted {
            response_id: str_field(&value, "/response/id").unwrap_or_default().to_string(),
        },
        "response.audio.delta" => {
            let Some(item_id) = str_field(&value, "/item_id") else {
                return BackendEvent::Error("audio delta without item_id".to_string());
            };
            match general_purpose::STANDARD.decode(str_field(&value, "/delta").unwrap_or_default()) {
                Ok(audio) => BackendEvent::AudioDelta {
                    response_id: item_id.to_string(),
                    audio,
                },
                Err(e) => BackendEvent::Error(format!("bad audio delta payload: {e}")),
            }
        }
        "response.audio_transcript.done" => BackendEvent::AgentTranscript(
            str_field(&value, "/transcript").unwrap_or_default().to_string(),
        ),
        "input_audio_buffer.speech_started" => BackendEvent::SpeechStarted,
        "conversation.item.truncated" => BackendEvent::Truncated {
            response_id: str_field(&value, "/item_id").unwrap_or_default().to_string(),
        },
        "response.done" => BackendEvent::ResponseDone,
        "error" => BackendEvent::Error(
            str_field(&value, "/error/message")
                .unwrap_or("unknown realtime error")
                .to_string(),
        ),
        other => BackendEvent::Unrecognized(other.to_string()),
    }
}

async fn outbound_loop(mut commands: mpsc::Receiver<BackendCommand>, sink: WsSink, call_id: &str) {
    let mut audio_chunks: u64 = 0;

    while let Some(cmd) = commands.recv().await {
        if cmd == BackendCommand::Close {
            let _ = sink.lock().await.send(WsMessage::Close(None)).await;
            break;
        }
        if let BackendCommand::Audio(_) = cmd {
            audio_chunks += 1;
            if audio_chunks == 1 || audio_chunks % 500 == 0 {
                debug!(call_id = %call_id, chunks = audio_chunks, "Streaming caller audio");
            }
        }

        let mut sink = sink.lock().await;
        for message in command_messages(&cmd) {
            if sink.send(WsMessage::Text(message.to_string().into())).await.is_err() {
                warn!(call_id = %call_id, "Realtime send failed, closing outbound loop");
                return;
            }
        }
    }
}

async fn inbound_loop(mut stream: WsStream, events: mpsc::Sender<BackendEvent>, call_id: &str) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                let event = parse_server_event(&text);
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Ok(WsMessage::Close(frame)) => {
                info!(call_id = %call_id, close_frame = ?frame, "Realtime connection closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "Realtime WebSocket error");
                break;
            }
        }
    }
}

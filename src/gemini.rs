//! Gemini Live API protocol and the turn-based dialogue backend
//!
//! The turn-based strategy keeps one Gemini Live session per call in TEXT
//! modality. Each finalized caller utterance is sent as a complete user turn;
//! partial model text is collected until the turn completes and only then
//! handed to the relay as a single reply. Conversation history lives in the
//! server-side session.

use crate::backend::{
    BackendCommand, BackendError, BackendEvent, BackendHandle, BackendSession, DialogueBackend,
    InputMode,
};
use crate::gemini_client::GeminiClient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, error, info, warn};

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

/// A user turn sent as client content
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    ClientContent(ClientContent),
}

impl ClientMessage {
    /// One complete user turn carrying `text`
    pub fn user_turn(text: &str) -> Self {
        Self::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: text.to_string(),
                }],
            }],
            turn_complete: true,
        })
    }
}

/// Server -> client messages
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    SetupComplete {
        #[serde(rename = "setupComplete")]
        setup_complete: serde_json::Value,
    },
    ServerContent {
        #[serde(rename = "serverContent")]
        server_content: serde_json::Value,
    },
    ToolCall {
        #[serde(rename = "toolCall")]
        tool_call: serde_json::Value,
    },
    GoAway {
        #[serde(rename = "goAway")]
        go_away: serde_json::Value,
    },
}

/// Error type for Gemini API operations
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, GeminiError>;

/// Response from the Gemini API
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    /// Setup has been completed
    SetupComplete,

    /// Partial text of the model turn
    TextResponse(String),

    /// Model finished its turn
    TurnComplete,

    /// Model output was interrupted server-side
    Interrupted,

    /// Model is requesting a tool call
    ToolCall(serde_json::Value),

    /// Server will disconnect soon
    GoAway,
}

/// Configuration for the Gemini client
#[derive(Debug, Clone)]
pub struct GeminiClientConfig {
    pub url: String,
    pub model: String,
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
    pub setup_timeout: Duration,
}

impl Default for GeminiClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            system_instruction: None,
            temperature: Some(0.7),
            setup_timeout: Duration::from_secs(10),
        }
    }
}

/// Collects partial model text until the turn completes
#[derive(Debug, Default)]
pub struct ReplyBuffer {
    text: String,
}

impl ReplyBuffer {
    pub fn push(&mut self, part: &str) {
        self.text.push_str(part);
    }

    /// Take the full reply; `None` when the turn produced no text
    pub fn finish(&mut self) -> Option<String> {
        let text = std::mem::take(&mut self.text);
        let text = text.trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    }

    pub fn discard(&mut self) {
        self.text.clear();
    }
}

/// Turn-based strategy: one utterance in, one full text reply out
pub struct GeminiTurnBackend {
    api_key: String,
    config: GeminiClientConfig,
}

impl GeminiTurnBackend {
    pub fn new(api_key: impl Into<String>, config: GeminiClientConfig) -> Self {
        Self {
            api_key: api_key.into(),
            config,
        }
    }
}

#[async_trait]
impl DialogueBackend for GeminiTurnBackend {
    fn name(&self) -> &'static str {
        "gemini-turn"
    }

    fn input_mode(&self) -> InputMode {
        InputMode::Transcript
    }

    async fn connect(&self, call_id: &str) -> std::result::Result<BackendSession, BackendError> {
        let mut client = GeminiClient::from_api_key(&self.api_key, Some(self.config.clone()));
        client
            .connect_and_setup()
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        let call_id = call_id.to_string();

        let task = tokio::spawn(async move {
            run_turns(client, cmd_rx, event_tx, &call_id).await;
            debug!(call_id = %call_id, "Gemini turn task terminated");
        });

        Ok(BackendSession {
            handle: BackendHandle::new(cmd_tx),
            events: event_rx,
            task: Some(task),
        })
    }
}

async fn run_turns(
    mut client: GeminiClient,
    mut commands: mpsc::Receiver<BackendCommand>,
    events: mpsc::Sender<BackendEvent>,
    call_id: &str,
) {
    let mut responses = client.subscribe();
    let mut reply = ReplyBuffer::default();

    if events.send(BackendEvent::SessionReady).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(BackendCommand::Text(text)) => {
                    info!(call_id = %call_id, "Sending utterance to Gemini: {}", text);
                    if let Err(e) = client.send_message(&ClientMessage::user_turn(&text)).await {
                        error!(call_id = %call_id, "Failed to send utterance: {}", e);
                        break;
                    }
                }
                Some(BackendCommand::Audio(_)) => {
                    // Transcript mode; audio is decoded locally
                }
                Some(BackendCommand::Truncate { response_id, .. }) => {
                    debug!(call_id = %call_id, response_id = %response_id, "Truncate ignored by turn backend");
                }
                Some(BackendCommand::Close) | None => {
                    client.close().await;
                    break;
                }
            },
            resp = responses.recv() => {
                let event = match resp {
                    Some(Ok(ApiResponse::TextResponse(part))) => {
                        reply.push(&part);
                        continue;
                    }
                    Some(Ok(ApiResponse::TurnComplete)) => match reply.finish() {
                        Some(text) => BackendEvent::Reply(text),
                        None => BackendEvent::ResponseDone,
                    },
                    Some(Ok(ApiResponse::Interrupted)) => {
                        reply.discard();
                        continue;
                    }
                    Some(Ok(ApiResponse::GoAway)) => {
                        warn!(call_id = %call_id, "Gemini requested disconnection");
                        continue;
                    }
                    Some(Ok(ApiResponse::ToolCall(_))) => BackendEvent::Unrecognized("toolCall".to_string()),
                    Some(Ok(ApiResponse::SetupComplete)) => continue,
                    Some(Err(GeminiError::Serialization(e))) => {
                        BackendEvent::Error(format!("unparseable Gemini message: {}", e))
                    }
                    Some(Err(e)) => {
                        warn!(call_id = %call_id, "Gemini connection lost: {}", e);
                        break;
                    }
                    None => break,
                };

                let done = matches!(event, BackendEvent::Reply(_));
                if events.send(event).await.is_err() {
                    break;
                }
                if done && events.send(BackendEvent::ResponseDone).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_config_serialization() {
        let config = GenerationConfig {
            response_modalities: vec!["TEXT".to_string()],
            temperature: Some(0.5),
        };

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["responseModalities"][0], "TEXT");
        assert_eq!(json["temperature"], 0.5);
    }

    #[test]
    fn test_client_message_serialization() {
        let setup = ClientMessage::Setup(BidiGenerateContentSetup {
            model: "models/gemini-2.0-flash-live-001".to_string(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["TEXT".to_string()],
                temperature: None,
            }),
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part {
                    text: "be brief".to_string(),
                }],
            }),
        });
        let json = serde_json::to_value(&setup).unwrap();
        assert_eq!(json["setup"]["model"], "models/gemini-2.0-flash-live-001");
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "TEXT");
        assert_eq!(json["setup"]["systemInstruction"]["parts"][0]["text"], "be brief");
        assert!(json["setup"]["generationConfig"].get("temperature").is_none());

        let turn = serde_json::to_value(ClientMessage::user_turn("book a test")).unwrap();
        assert_eq!(turn["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(turn["clientContent"]["turns"][0]["parts"][0]["text"], "book a test");
        assert_eq!(turn["clientContent"]["turnComplete"], true);
    }

    #[test]
    fn test_server_message_deserialization() {
        let parsed: ServerMessage = serde_json::from_str(r#"{"setupComplete":{}}"#).unwrap();
        assert!(matches!(parsed, ServerMessage::SetupComplete { .. }));

        let parsed: ServerMessage = serde_json::from_str(
            r#"{"serverContent":{"modelTurn":{"parts":[{"text":"Hi"}]},"turnComplete":true}}"#,
        )
        .unwrap();
        match parsed {
            ServerMessage::ServerContent { server_content } => {
                assert_eq!(server_content["modelTurn"]["parts"][0]["text"], "Hi");
            }
            other => panic!("Expected ServerContent, got {:?}", other),
        }
    }

    #[test]
    fn test_reply_buffer_joins_parts() {
        let mut reply = ReplyBuffer::default();
        reply.push("Of course! ");
        reply.push("Is the test for you?");
        assert_eq!(reply.finish().as_deref(), Some("Of course! Is the test for you?"));
        assert_eq!(reply.finish(), None);

        reply.push("  ");
        assert_eq!(reply.finish(), None);

        reply.push("stale");
        reply.discard();
        assert_eq!(reply.finish(), None);
    }
}

//! Gemini Live API WebSocket client
//!
//! Uses a split sink/stream: the write half is shared behind a mutex, the read
//! half is drained by a background task into a response channel.

use crate::gemini::{
    ApiResponse, BidiGenerateContentSetup, ClientMessage, Content, GeminiClientConfig,
    GeminiError, GenerationConfig, Part, Result, ServerMessage,
};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use std::sync::Arc;

const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

type WsSink = Arc<
    Mutex<
        futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            Message,
        >,
    >,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connected,
    SetupComplete,
}

/// Gemini Live API client
pub struct GeminiClient {
    config: GeminiClientConfig,
    state: ConnectionState,
    ws_writer: Option<WsSink>,
    response_rx: mpsc::Receiver<Result<ApiResponse>>,
    rx_task: Option<JoinHandle<()>>,
}

impl GeminiClient {
    pub fn new(config: GeminiClientConfig) -> Self {
        // Dummy channel until connect() is called
        let (_, response_rx) = mpsc::channel(1);

        Self {
            config,
            state: ConnectionState::Disconnected,
            ws_writer: None,
            response_rx,
            rx_task: None,
        }
    }

    /// Create a client for the public Live API endpoint.
    pub fn from_api_key(api_key: &str, config: Option<GeminiClientConfig>) -> Self {
        let mut config = config.unwrap_or_default();
        if config.url.is_empty() {
            config.url = format!("{}?key={}", LIVE_API_URL, api_key);
        }
        Self::new(config)
    }

    pub async fn connect_and_setup(&mut self) -> Result<()> {
        self.connect().await?;
        self.setup().await
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Ok(());
        }

        info!("Connecting to Gemini Live API");
        let (ws_stream, resp) = connect_async(self.config.url.as_str()).await?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (sink, mut stream) = ws_stream.split();
        self.ws_writer = Some(Arc::new(Mutex::new(sink)));

        let (response_tx, response_rx) = mpsc::channel::<Result<ApiResponse>>(100);

        let rx_task = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text.to_string(),
                    // The Live API sends JSON in binary frames too
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("Ignoring non-UTF-8 binary message ({} bytes)", bytes.len());
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        info!("Gemini WebSocket closed: {:?}", frame);
                        let _ = response_tx.send(Err(GeminiError::ConnectionClosed)).await;
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        error!("Gemini WebSocket error: {:?}", e);
                        let _ = response_tx.send(Err(GeminiError::WebSocket(e))).await;
                        break;
                    }
                };

                let responses = match parse_server_message(&text) {
                    Ok(responses) => responses.into_iter().map(Ok).collect(),
                    Err(e) => {
                        warn!("Failed to parse server message: {}", text);
                        vec![Err(e)]
                    }
                };
                for response in responses {
                    if response_tx.send(response).await.is_err() {
                        return;
                    }
                }
            }

            debug!("Gemini inbound task terminated");
        });

        self.response_rx = response_rx;
        self.rx_task = Some(rx_task);
        self.state = ConnectionState::Connected;
        info!("Connected to Gemini Live API");
        Ok(())
    }

    /// Send the setup message and wait for the server to acknowledge it.
    pub async fn setup(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Disconnected => return Err(GeminiError::ConnectionClosed),
            ConnectionState::SetupComplete => return Ok(()),
            ConnectionState::Connected => {}
        }

        let msg = ClientMessage::Setup(self.setup_message());
        info!("Setting up Gemini session with model {}", self.config.model);
        self.send_message(&msg).await?;

        let completed = tokio::time::timeout(self.config.setup_timeout, self.wait_for_setup_complete())
            .await
            .map_err(|_| GeminiError::Timeout)??;

        if completed {
            self.state = ConnectionState::SetupComplete;
            info!("Gemini session setup complete");
            Ok(())
        } else {
            Err(GeminiError::SetupNotComplete)
        }
    }

    fn setup_message(&self) -> BidiGenerateContentSetup {
        BidiGenerateContentSetup {
            model: self.config.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["TEXT".to_string()],
                temperature: self.config.temperature,
            }),
            system_instruction: self.config.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part { text: text.clone() }],
            }),
        }
    }

    async fn wait_for_setup_complete(&mut self) -> Result<bool> {
        for _ in 0..10 {
            match self.response_rx.recv().await {
                Some(Ok(ApiResponse::SetupComplete)) => return Ok(true),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e),
                None => return Err(GeminiError::ChannelClosed),
            }
        }
        Ok(false)
    }

    pub async fn send_message(&self, msg: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        let writer = self.ws_writer.as_ref().ok_or(GeminiError::ConnectionClosed)?;
        writer.lock().await.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Take the response channel.
    ///
    /// Must be called after setup; later responses are only visible here.
    pub fn subscribe(&mut self) -> mpsc::Receiver<Result<ApiResponse>> {
        let (_, empty) = mpsc::channel(1);
        std::mem::replace(&mut self.response_rx, empty)
    }

    pub async fn close(&mut self) {
        if let Some(writer) = self.ws_writer.take() {
            if let Err(e) = writer.lock().await.close().await {
                debug!("Error closing Gemini WebSocket: {}", e);
            }
        }
        if let Some(task) = self.rx_task.take() {
            task.abort();
        }
        self.state = ConnectionState::Disconnected;
    }
}

/// Map one server message to the responses it carries, in order.
pub fn parse_server_message(text: &str) -> Result<Vec<ApiResponse>> {
    let message: ServerMessage = serde_json::from_str(text)?;
    let responses = match message {
        ServerMessage::SetupComplete { .. } => vec![ApiResponse::SetupComplete],
        ServerMessage::ServerContent { server_content } => server_content_responses(&server_content),
        ServerMessage::ToolCall { tool_call } => vec![ApiResponse::ToolCall(tool_call)],
        ServerMessage::GoAway { .. } => vec![ApiResponse::GoAway],
    };
    Ok(responses)
}

fn server_content_responses(content: &serde_json::Value) -> Vec<ApiResponse> {
    let mut responses = Vec::new();

    if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
        responses.push(ApiResponse::Interrupted);
    }

    if let Some(parts) = content
        .get("modelTurn")
        .and_then(|turn| turn.get("parts"))
        .and_then(|parts| parts.as_array())
    {
        for part in parts {
            match part.get("text").and_then(|t| t.as_str()) {
                Some(text) if !text.is_empty() => {
                    responses.push(ApiResponse::TextResponse(text.to_string()))
                }
                Some(_) => {}
                None => debug!("Skipping non-text model part"),
            }
        }
    }

    if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
        responses.push(ApiResponse::TurnComplete);
    }

    responses
}

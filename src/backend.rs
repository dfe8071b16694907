//! Dialogue backend capability
//!
//! The relay talks to whichever conversational backend is configured through
//! this surface only: commands go in over a [`BackendHandle`], events come
//! back on the session's event receiver. A closed event channel means the
//! backend connection is gone.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long teardown waits on a backend before giving up on it
pub const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// What the backend wants from the caller side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Raw μ-law caller audio, forwarded frame by frame
    Audio,
    /// Finalized utterances from the local speech decoder
    Transcript,
}

/// Commands accepted by a backend session
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCommand {
    /// μ-law caller audio
    Audio(Vec<u8>),
    /// A finalized caller utterance
    Text(String),
    /// Cut `response_id` at `audio_end_ms` of played audio
    Truncate {
        response_id: String,
        audio_end_ms: u64,
    },
    Close,
}

/// Events emitted by a backend session
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    SessionReady,
    ResponseStarted { response_id: String },
    /// μ-law audio belonging to `response_id`
    AudioDelta { response_id: String, audio: Vec<u8> },
    /// Backend detected the caller talking
    SpeechStarted,
    Truncated { response_id: String },
    ResponseDone,
    /// Complete text reply to one caller utterance
    Reply(String),
    /// Transcript of audio the backend spoke
    AgentTranscript(String),
    /// Backend-reported error; the session continues
    Error(String),
    /// Event kind the relay does not handle
    Unrecognized(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend connection failed: {0}")]
    Connect(String),

    #[error("backend session closed")]
    Closed,
}

/// Cloneable command side of a backend session
#[derive(Debug, Clone)]
pub struct BackendHandle {
    tx: mpsc::Sender<BackendCommand>,
}

impl BackendHandle {
    pub fn new(tx: mpsc::Sender<BackendCommand>) -> Self {
        Self { tx }
    }

    pub async fn send_audio(&self, ulaw: Vec<u8>) -> Result<(), BackendError> {
        if ulaw.is_empty() {
            return Ok(());
        }
        self.send(BackendCommand::Audio(ulaw)).await
    }

    pub async fn send_text(&self, utterance: String) -> Result<(), BackendError> {
        self.send(BackendCommand::Text(utterance)).await
    }

    pub async fn truncate(&self, response_id: String, audio_end_ms: u64) -> Result<(), BackendError> {
        self.send(BackendCommand::Truncate {
            response_id,
            audio_end_ms,
        })
        .await
    }

    /// Ask the backend to close. Gives up after [`CLOSE_GRACE`] if the
    /// command queue stays full.
    pub async fn close(&self) {
        match tokio::time::timeout(CLOSE_GRACE, self.tx.send(BackendCommand::Close)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("Backend already closed"),
            Err(_) => warn!("Backend not accepting commands, dropping close request"),
        }
    }

    async fn send(&self, cmd: BackendCommand) -> Result<(), BackendError> {
        self.tx.send(cmd).await.map_err(|_| BackendError::Closed)
    }
}

/// One conversation with the backend, bounded by a call
pub struct BackendSession {
    pub handle: BackendHandle,
    pub events: mpsc::Receiver<BackendEvent>,
    /// Task driving the backend connection, if any
    pub task: Option<JoinHandle<()>>,
}

impl BackendSession {
    /// Close the conversation and stop its driver task.
    ///
    /// The driver gets [`CLOSE_GRACE`] to wind down on its own and is
    /// aborted after that.
    pub async fn shutdown(handle: &BackendHandle, task: Option<JoinHandle<()>>) {
        handle.close().await;
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                warn!("Backend task did not stop, aborting");
                task.abort();
            }
        }
    }
}

/// A conversational backend that can open one session per call
#[async_trait]
pub trait DialogueBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn input_mode(&self) -> InputMode;

    async fn connect(&self, call_id: &str) -> Result<BackendSession, BackendError>;
}

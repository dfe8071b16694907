//! Per-call duplex relay between the telephony transport and a dialogue backend
//!
//! Three futures run per call: the inbound pump (transport frames and decoded
//! utterances), the outbound pump (backend events) and an idle watchdog. They
//! share one [`CallSession`] behind a mutex; whichever finishes first decides
//! how the call ended and the others are dropped.

use crate::backend::{BackendEvent, BackendHandle, BackendSession, DialogueBackend, InputMode};
use crate::codec;
use crate::recorder::CallRecorder;
use crate::session::{AudioDecision, CallSession};
use crate::speech::{DecoderFactory, DecoderWorker, SpeechError};
use crate::transport::{InboundFrame, OutboundFrame, RESPONSE_PART_MARK};
use futures_util::{Stream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// How a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Transport sent `stop`
    Stopped,
    /// Transport stream ended or its writer went away
    CallerHungUp,
    /// Backend connection dropped
    BackendLost,
    /// Nothing moved in either direction for too long
    IdleTimeout,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Backend(#[from] crate::backend::BackendError),

    #[error("speech decoder unavailable: {0}")]
    Decoder(#[from] SpeechError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Caller,
    Agent,
}

/// One line of the call transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub call_id: String,
    pub speaker: Speaker,
    pub text: String,
}

pub type TranscriptSink = mpsc::UnboundedSender<TranscriptEntry>;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub idle_timeout: Duration,
    /// Directory for per-call WAV recordings, if recording is enabled
    pub record_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            record_dir: None,
        }
    }
}

/// Runs one relay per telephone connection
pub struct StreamRelay {
    config: RelayConfig,
    backend: Arc<dyn DialogueBackend>,
    decoders: DecoderFactory,
    transcripts: Option<TranscriptSink>,
}

/// Per-call wiring shared by the pumps
struct CallContext<'a> {
    call_id: &'a str,
    mode: InputMode,
    backend: BackendHandle,
    decoder: DecoderWorker,
    outbound: mpsc::Sender<OutboundFrame>,
    transcripts: Option<&'a TranscriptSink>,
    record_dir: Option<&'a PathBuf>,
    session: Mutex<CallSession>,
}

impl StreamRelay {
    pub fn new(config: RelayConfig, backend: Arc<dyn DialogueBackend>, decoders: DecoderFactory) -> Self {
        Self {
            config,
            backend,
            decoders,
            transcripts: None,
        }
    }

    pub fn with_transcript_sink(mut self, sink: TranscriptSink) -> Self {
        self.transcripts = Some(sink);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Relay one call until it ends.
    ///
    /// `inbound` yields raw transport text frames; `outbound` receives frames
    /// for the transport and is dropped when the call ends.
    pub async fn run<S>(
        &self,
        call_id: &str,
        inbound: S,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Result<SessionEnd, RelayError>
    where
        S: Stream<Item = String> + Unpin + Send,
    {
        let BackendSession {
            handle,
            events,
            task,
        } = self.backend.connect(call_id).await?;

        let (decoder, utterances) = match DecoderWorker::spawn(call_id, self.decoders.clone()) {
            Ok(worker) => worker,
            Err(e) => {
                BackendSession::shutdown(&handle, task).await;
                return Err(e.into());
            }
        };

        info!(call_id = %call_id, backend = self.backend.name(), "Relay started");

        let ctx = CallContext {
            call_id,
            mode: self.backend.input_mode(),
            backend: handle.clone(),
            decoder,
            outbound,
            transcripts: self.transcripts.as_ref(),
            record_dir: self.config.record_dir.as_ref(),
            session: Mutex::new(CallSession::new(call_id)),
        };

        let end = tokio::select! {
            end = ctx.inbound_pump(inbound, utterances) => end,
            end = ctx.outbound_pump(events) => end,
            end = ctx.watchdog(self.config.idle_timeout) => end,
        };

        match end {
            SessionEnd::BackendLost => warn!(call_id = %call_id, "Backend connection lost"),
            SessionEnd::IdleTimeout => warn!(call_id = %call_id, "Call idle, ending session"),
            SessionEnd::Stopped | SessionEnd::CallerHungUp => {
                info!(call_id = %call_id, outcome = ?end, "Call ended")
            }
        }

        drop(ctx);
        BackendSession::shutdown(&handle, task).await;
        Ok(end)
    }
}

impl CallContext<'_> {
    fn publish(&self, speaker: Speaker, text: String) {
        let Some(sink) = self.transcripts else {
            return;
        };
        let entry = TranscriptEntry {
            call_id: self.call_id.to_string(),
            speaker,
            text,
        };
        if sink.send(entry).is_err() {
            debug!(call_id = %self.call_id, "Transcript sink closed");
        }
    }

    async fn send(&self, frame: OutboundFrame) -> Result<(), SessionEnd> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| SessionEnd::CallerHungUp)
    }

    async fn inbound_pump<S>(
        &self,
        mut inbound: S,
        mut utterances: mpsc::UnboundedReceiver<String>,
    ) -> SessionEnd
    where
        S: Stream<Item = String> + Unpin,
    {
        let mut recorder: Option<CallRecorder> = None;
        let mut decoder_alive = true;

        loop {
            tokio::select! {
                frame = inbound.next() => {
                    let Some(text) = frame else {
                        return SessionEnd::CallerHungUp;
                    };
                    self.session.lock().await.touch();
                    if let Some(end) = self.on_frame(&text, &mut recorder).await {
                        return end;
                    }
                }
                utterance = utterances.recv(), if decoder_alive => match utterance {
                    Some(text) => {
                        info!(call_id = %self.call_id, "Caller said: {}", text);
                        self.publish(Speaker::Caller, text.clone());
                        if self.mode == InputMode::Transcript && self.backend.send_text(text).await.is_err() {
                            return SessionEnd::BackendLost;
                        }
                    }
                    None => {
                        warn!(call_id = %self.call_id, "Speech decoder stopped; continuing without transcripts");
                        decoder_alive = false;
                    }
                },
            }
        }
    }

    async fn on_frame(&self, text: &str, recorder: &mut Option<CallRecorder>) -> Option<SessionEnd> {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(call_id = %self.call_id, "Skipping malformed transport frame: {}", e);
                return None;
            }
        };

        match frame {
            InboundFrame::Start { start } => {
                self.session.lock().await.on_start(start.stream_sid.clone());
                self.reset_decoder();
                if let Some(dir) = self.record_dir {
                    // Replacing an earlier recorder finalizes it
                    *recorder = match CallRecorder::create(dir, &start.stream_sid) {
                        Ok(r) => Some(r),
                        Err(e) => {
                            error!(call_id = %self.call_id, "Failed to open call recording: {}", e);
                            None
                        }
                    };
                }
            }
            InboundFrame::Media { media } => {
                self.session.lock().await.on_media(media.timestamp);
                let ulaw = match media.ulaw() {
                    Ok(ulaw) => ulaw,
                    Err(e) => {
                        warn!(call_id = %self.call_id, "Skipping media frame with bad payload: {}", e);
                        return None;
                    }
                };

                let pcm = codec::decode(&ulaw);
                if self.mode == InputMode::Audio && self.backend.send_audio(ulaw).await.is_err() {
                    return Some(SessionEnd::BackendLost);
                }
                if let Some(recorder) = recorder.as_mut() {
                    recorder.write(&pcm);
                }
                if let Err(e) = self.decoder.feed(pcm) {
                    debug!(call_id = %self.call_id, "Decoder not accepting audio: {}", e);
                }
            }
            InboundFrame::Mark { mark } => {
                debug!(call_id = %self.call_id, mark = %mark.name, "Mark played");
                self.session.lock().await.on_mark();
            }
            InboundFrame::Stop => return Some(SessionEnd::Stopped),
            InboundFrame::Unrecognized => {
                debug!(call_id = %self.call_id, "Ignoring unrecognized transport event");
            }
        }
        None
    }

    fn reset_decoder(&self) {
        if let Err(e) = self.decoder.reset() {
            debug!(call_id = %self.call_id, "Decoder reset skipped: {}", e);
        }
    }

    async fn outbound_pump(&self, mut events: mpsc::Receiver<BackendEvent>) -> SessionEnd {
        while let Some(event) = events.recv().await {
            self.session.lock().await.touch();
            if let Err(end) = self.on_event(event).await {
                return end;
            }
        }
        SessionEnd::BackendLost
    }

    async fn on_event(&self, event: BackendEvent) -> Result<(), SessionEnd> {
        match event {
            BackendEvent::SessionReady => {
                info!(call_id = %self.call_id, "Backend session ready");
            }
            BackendEvent::ResponseStarted { response_id } => {
                debug!(call_id = %self.call_id, response_id = %response_id, "Response started");
            }
            BackendEvent::AudioDelta { response_id, audio } => {
                let decision = {
                    let mut session = self.session.lock().await;
                    let decision = session.on_audio_delta(&response_id);
                    if let AudioDecision::Forward { .. } = decision {
                        session.push_mark(RESPONSE_PART_MARK);
                    }
                    decision
                };

                match decision {
                    AudioDecision::Forward { stream_sid } => {
                        self.send(OutboundFrame::media(&stream_sid, &audio)).await?;
                        self.send(OutboundFrame::mark(&stream_sid)).await?;
                    }
                    AudioDecision::DropTruncated => {
                        debug!(call_id = %self.call_id, response_id = %response_id, "Dropping audio of truncated response");
                    }
                    AudioDecision::DropNoStream => {
                        warn!(call_id = %self.call_id, "Dropping response audio, stream not started");
                    }
                }
            }
            BackendEvent::SpeechStarted => {
                let interruption = self.session.lock().await.on_speech_started();
                if let Some(cut) = interruption {
                    self.backend
                        .truncate(cut.response_id, cut.elapsed_ms)
                        .await
                        .map_err(|_| SessionEnd::BackendLost)?;
                    if let Some(stream_sid) = &cut.stream_sid {
                        self.send(OutboundFrame::clear(stream_sid)).await?;
                    }
                    self.reset_decoder();
                }
            }
            BackendEvent::Truncated { response_id } => {
                self.session.lock().await.on_truncated(&response_id);
            }
            BackendEvent::ResponseDone => {
                self.session.lock().await.on_response_done();
            }
            BackendEvent::Reply(text) => {
                info!(call_id = %self.call_id, "Agent reply: {}", text);
                self.publish(Speaker::Agent, text);
            }
            BackendEvent::AgentTranscript(text) => {
                self.publish(Speaker::Agent, text);
            }
            BackendEvent::Error(message) => {
                warn!(call_id = %self.call_id, "Backend error: {}", message);
            }
            BackendEvent::Unrecognized(kind) => {
                debug!(call_id = %self.call_id, kind = %kind, "Unhandled backend event");
            }
        }
        Ok(())
    }

    async fn watchdog(&self, idle_timeout: Duration) -> SessionEnd {
        loop {
            let deadline = self.session.lock().await.last_activity() + idle_timeout;
            if std::time::Instant::now() >= deadline {
                return SessionEnd::IdleTimeout;
            }
            tokio::time::sleep_until(deadline.into()).await;
        }
    }
}

//! Incremental speech decoding
//!
//! Caller audio arrives in small PCM chunks. [`SpeechDecoder`] runs voice
//! activity detection over 20ms frames, buffers the audio of an open
//! utterance, and hands the utterance to a [`Transcriber`] once trailing
//! silence (or the length cap) closes it.
//!
//! The WebRTC VAD and the Whisper state are neither cheap nor `Send`, so each
//! call gets its own decoder living on a dedicated thread, driven through a
//! [`DecoderWorker`].

use crate::codec::SAMPLE_RATE;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, span, warn, Level};
use webrtc_vad::{SampleRate, Vad, VadMode};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Samples in one 20ms VAD frame at 8 kHz
pub const FRAME_SAMPLES: usize = 160;

const FRAME_MS: u64 = 20;

/// Chunks queued for a decoder thread before new audio is dropped (about
/// ten seconds of 20ms media frames)
pub const FEED_QUEUE_CHUNKS: usize = 500;

/// Error type for speech decoding operations
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("speech model not found at {0} (download a ggml Whisper model first)")]
    ModelMissing(PathBuf),

    #[error("Whisper error: {0}")]
    Whisper(String),

    #[error("VAD error: {0}")]
    Vad(String),

    #[error("decoder worker stopped")]
    WorkerStopped,

    #[error("decoder queue full, audio dropped")]
    QueueFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SpeechError>;

/// Endpointing configuration
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Number of voiced 20ms frames required to open an utterance
    pub open_voiced_frames: usize,

    /// Milliseconds of trailing silence that close an utterance
    pub close_silence_ms: u64,

    /// Maximum utterance length in milliseconds
    pub max_utterance_ms: u64,

    /// Utterances with less voiced audio than this are dropped untranscribed
    pub min_utterance_ms: u64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            open_voiced_frames: 3,   // 60ms of speech to open
            close_silence_ms: 500,   // 500ms silence to close
            max_utterance_ms: 10_000,
            min_utterance_ms: 200,
        }
    }
}

/// Frame-level voice activity decision
pub trait VoiceActivity {
    /// Classify one 20ms frame of 8 kHz PCM
    fn is_voiced(&mut self, frame: &[i16]) -> Result<bool>;
}

/// Turns a closed utterance of 8 kHz PCM into text
pub trait Transcriber {
    fn transcribe(&mut self, pcm: &[i16]) -> Result<String>;
}

/// WebRTC VAD configured for telephony audio
pub struct WebRtcVad {
    vad: Vad,
}

impl WebRtcVad {
    pub fn new() -> Self {
        Self {
            vad: Vad::new_with_rate_and_mode(SampleRate::Rate8kHz, VadMode::Aggressive),
        }
    }
}

impl Default for WebRtcVad {
    fn default() -> Self {
        Self::new()
    }
}

impl VoiceActivity for WebRtcVad {
    fn is_voiced(&mut self, frame: &[i16]) -> Result<bool> {
        self.vad
            .is_voice_segment(frame)
            .map_err(|_| SpeechError::Vad(format!("invalid frame length {}", frame.len())))
    }
}

/// A loaded Whisper model, shared by every call's transcriber
pub struct SpeechModel {
    ctx: WhisperContext,
    path: PathBuf,
}

impl SpeechModel {
    /// Load the model file. A missing file is a startup failure.
    pub fn load(path: &Path) -> Result<Arc<Self>> {
        if !path.is_file() {
            return Err(SpeechError::ModelMissing(path.to_path_buf()));
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| SpeechError::Whisper(format!("non UTF-8 model path {}", path.display())))?;

        info!("Loading Whisper model from {}", path.display());
        let ctx = WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
            .map_err(|e| SpeechError::Whisper(e.to_string()))?;

        Ok(Arc::new(Self {
            ctx,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whisper-backed transcriber; owns one inference state
pub struct WhisperTranscriber {
    _model: Arc<SpeechModel>,
    state: whisper_rs::WhisperState,
}

impl WhisperTranscriber {
    pub fn new(model: Arc<SpeechModel>) -> Result<Self> {
        let state = model
            .ctx
            .create_state()
            .map_err(|e| SpeechError::Whisper(e.to_string()))?;
        Ok(Self {
            _model: model,
            state,
        })
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe(&mut self, pcm: &[i16]) -> Result<String> {
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_language(Some("en"));
        params.set_translate(false);
        params.set_no_context(true);
        params.set_single_segment(true);

        let samples = upsample_for_whisper(pcm);
        self.state
            .full(params, &samples)
            .map_err(|e| SpeechError::Whisper(e.to_string()))?;

        let n_segments = self
            .state
            .full_n_segments()
            .map_err(|e| SpeechError::Whisper(e.to_string()))?;

        let mut text = String::new();
        for i in 0..n_segments {
            let segment = self
                .state
                .full_get_segment_text(i)
                .map_err(|e| SpeechError::Whisper(e.to_string()))?;
            text.push_str(&segment);
        }
        Ok(text)
    }
}

/// Whisper wants 16 kHz f32 and at least one second of audio.
fn upsample_for_whisper(pcm: &[i16]) -> Vec<f32> {
    let mut out = Vec::with_capacity((pcm.len() * 2).max(16_000));
    for (i, &s) in pcm.iter().enumerate() {
        let cur = s as f32 / 32768.0;
        let next = pcm.get(i + 1).map_or(cur, |&n| n as f32 / 32768.0);
        out.push(cur);
        out.push((cur + next) / 2.0);
    }
    if out.len() < 16_000 {
        out.resize(16_000, 0.0);
    }
    out
}

/// Stateful per-call decoder: VAD endpointing in front of a transcriber
pub struct SpeechDecoder {
    cfg: DecoderConfig,
    vad: Box<dyn VoiceActivity>,
    transcriber: Box<dyn Transcriber>,

    /// Samples not yet forming a full VAD frame
    pending: Vec<i16>,

    /// Audio of the open utterance
    buffer: Vec<i16>,

    /// Consecutive voiced frames seen while no utterance is open
    voiced_run: usize,

    /// Voiced run that may open an utterance; becomes its first audio
    preroll: Vec<i16>,

    /// Voiced frames inside the open utterance
    voiced_in_utterance: usize,

    silent_ms: u64,
    open: bool,
}

impl SpeechDecoder {
    pub fn new(
        cfg: DecoderConfig,
        vad: Box<dyn VoiceActivity>,
        transcriber: Box<dyn Transcriber>,
    ) -> Self {
        Self {
            cfg,
            vad,
            transcriber,
            pending: Vec::with_capacity(FRAME_SAMPLES),
            buffer: Vec::with_capacity(SAMPLE_RATE as usize * 4),
            voiced_run: 0,
            preroll: Vec::new(),
            voiced_in_utterance: 0,
            silent_ms: 0,
            open: false,
        }
    }

    /// Build the production decoder: WebRTC VAD in front of Whisper.
    pub fn with_model(cfg: DecoderConfig, model: Arc<SpeechModel>) -> Result<Self> {
        let transcriber = WhisperTranscriber::new(model)?;
        Ok(Self::new(cfg, Box::new(WebRtcVad::new()), Box::new(transcriber)))
    }

    /// Append a chunk of 8 kHz PCM.
    ///
    /// Returns the trimmed transcript when this chunk completes an utterance
    /// and the transcript is non-empty; `Ok(None)` otherwise.
    ///
    /// At most one utterance is returned per call. Audio past its end stays
    /// buffered, so callers keep feeding (an empty chunk will do) until this
    /// returns `Ok(None)`.
    pub fn feed(&mut self, pcm: &[i16]) -> Result<Option<String>> {
        let _span = span!(Level::TRACE, "speech.feed").entered();

        self.pending.extend_from_slice(pcm);
        let mut consumed = 0;
        let mut result = Ok(None);

        while self.pending.len() - consumed >= FRAME_SAMPLES {
            let frame: Vec<i16> = self.pending[consumed..consumed + FRAME_SAMPLES].to_vec();
            consumed += FRAME_SAMPLES;

            match self.push_frame(&frame) {
                Ok(Some(text)) => {
                    // Audio after the boundary waits for the next call
                    result = Ok(Some(text));
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.pending.drain(..consumed);
        result
    }

    /// Discard all partial utterance state.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.buffer.clear();
        self.preroll.clear();
        self.voiced_run = 0;
        self.voiced_in_utterance = 0;
        self.silent_ms = 0;
        self.open = false;
    }

    /// Whether an utterance is currently open
    pub fn is_capturing(&self) -> bool {
        self.open
    }

    fn push_frame(&mut self, frame: &[i16]) -> Result<Option<String>> {
        let voiced = self.vad.is_voiced(frame)?;

        if !self.open {
            if voiced {
                self.voiced_run += 1;
                self.preroll.extend_from_slice(frame);
                if self.voiced_run >= self.cfg.open_voiced_frames {
                    debug!("Opening utterance after {} voiced frames", self.voiced_run);
                    self.open = true;
                    self.buffer = std::mem::take(&mut self.preroll);
                    self.voiced_in_utterance = self.voiced_run;
                    self.silent_ms = 0;
                }
            } else {
                self.voiced_run = 0;
                self.preroll.clear();
            }
            return Ok(None);
        }

        self.buffer.extend_from_slice(frame);
        if voiced {
            self.voiced_in_utterance += 1;
            self.silent_ms = 0;
        } else {
            self.silent_ms += FRAME_MS;
        }

        let length_ms = self.buffer.len() as u64 * 1000 / SAMPLE_RATE as u64;
        if self.silent_ms >= self.cfg.close_silence_ms {
            debug!("Closing utterance after {}ms of silence", self.silent_ms);
            return self.finalize();
        }
        if length_ms >= self.cfg.max_utterance_ms {
            debug!("Closing utterance at max length ({}ms)", length_ms);
            return self.finalize();
        }
        Ok(None)
    }

    fn finalize(&mut self) -> Result<Option<String>> {
        let pcm = std::mem::take(&mut self.buffer);
        let voiced_ms = self.voiced_in_utterance as u64 * FRAME_MS;
        let pending = std::mem::take(&mut self.pending);
        self.reset();
        self.pending = pending;

        if voiced_ms < self.cfg.min_utterance_ms {
            debug!("Dropping short utterance ({}ms voiced)", voiced_ms);
            return Ok(None);
        }

        let text = self.transcriber.transcribe(&pcm)?;
        let text = text.trim();
        if text.is_empty() {
            Ok(None)
        } else {
            Ok(Some(text.to_string()))
        }
    }
}

/// Builds a decoder on the worker thread
pub type DecoderFactory = Arc<dyn Fn() -> Result<SpeechDecoder> + Send + Sync>;

/// Production factory sharing one loaded model across calls
pub fn whisper_factory(cfg: DecoderConfig, model: Arc<SpeechModel>) -> DecoderFactory {
    Arc::new(move || SpeechDecoder::with_model(cfg.clone(), model.clone()))
}

enum DecoderCommand {
    /// Audio tagged with the reset epoch it was captured in
    Feed(u64, Vec<i16>),
    Reset,
}

/// Handle to a per-call decoder thread.
///
/// Audio goes over a bounded queue and is dropped when the thread falls
/// behind. Resets bump a shared epoch instead, so a full queue cannot lose
/// them; queued audio from an older epoch is discarded by the thread.
///
/// Dropping the handle closes the command channel and the thread exits.
pub struct DecoderWorker {
    tx: SyncSender<DecoderCommand>,
    epoch: Arc<AtomicU64>,
    backlogged: AtomicBool,
}

impl DecoderWorker {
    /// Spawn the decoder thread. Finalized utterances arrive on the returned receiver.
    pub fn spawn(
        call_id: &str,
        factory: DecoderFactory,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>)> {
        let (tx, rx) = sync_channel::<DecoderCommand>(FEED_QUEUE_CHUNKS);
        let (text_tx, text_rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));
        let thread_epoch = epoch.clone();
        let call_id = call_id.to_string();

        std::thread::Builder::new()
            .name(format!("decoder-{}", call_id))
            .spawn(move || {
                let mut decoder = match factory() {
                    Ok(decoder) => decoder,
                    Err(e) => {
                        error!(call_id = %call_id, "Failed to build speech decoder: {}", e);
                        return;
                    }
                };
                debug!(call_id = %call_id, "Decoder thread started");
                let mut decoder_epoch = 0;

                'commands: while let Ok(cmd) = rx.recv() {
                    let current = thread_epoch.load(Ordering::Acquire);
                    if current != decoder_epoch {
                        decoder.reset();
                        decoder_epoch = current;
                    }

                    let (captured, pcm) = match cmd {
                        DecoderCommand::Feed(captured, pcm) => (captured, pcm),
                        DecoderCommand::Reset => continue,
                    };
                    if captured != current {
                        continue;
                    }

                    let mut chunk: &[i16] = &pcm;
                    loop {
                        match decoder.feed(chunk) {
                            Ok(Some(text)) => {
                                if text_tx.send(text).is_err() {
                                    break 'commands;
                                }
                                chunk = &[];
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(call_id = %call_id, "Decode error, skipping chunk: {}", e);
                                break;
                            }
                        }
                    }
                }
                debug!(call_id = %call_id, "Decoder thread stopped");
            })?;

        Ok((
            Self {
                tx,
                epoch,
                backlogged: AtomicBool::new(false),
            },
            text_rx,
        ))
    }

    /// Queue audio for decoding without blocking.
    pub fn feed(&self, pcm: Vec<i16>) -> Result<()> {
        let epoch = self.epoch.load(Ordering::Acquire);
        match self.tx.try_send(DecoderCommand::Feed(epoch, pcm)) {
            Ok(()) => {
                self.backlogged.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                if !self.backlogged.swap(true, Ordering::Relaxed) {
                    warn!("Speech decoder falling behind, dropping caller audio");
                }
                Err(SpeechError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(SpeechError::WorkerStopped),
        }
    }

    /// Discard everything fed so far, including audio still queued.
    pub fn reset(&self) -> Result<()> {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(DecoderCommand::Reset) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(SpeechError::WorkerStopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Frames with any sample above the threshold count as voiced
    pub struct EnergyVad;

    impl VoiceActivity for EnergyVad {
        fn is_voiced(&mut self, frame: &[i16]) -> Result<bool> {
            Ok(frame.iter().any(|s| s.unsigned_abs() > 1000))
        }
    }

    /// Records every utterance it is asked to transcribe
    pub struct RecordingTranscriber {
        pub seen: Arc<Mutex<Vec<Vec<i16>>>>,
        pub reply: String,
    }

    impl Transcriber for RecordingTranscriber {
        fn transcribe(&mut self, pcm: &[i16]) -> Result<String> {
            self.seen.lock().unwrap().push(pcm.to_vec());
            Ok(self.reply.clone())
        }
    }

    fn decoder(reply: &str) -> (SpeechDecoder, Arc<Mutex<Vec<Vec<i16>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let transcriber = RecordingTranscriber {
            seen: seen.clone(),
            reply: reply.to_string(),
        };
        let decoder = SpeechDecoder::new(
            DecoderConfig::default(),
            Box::new(EnergyVad),
            Box::new(transcriber),
        );
        (decoder, seen)
    }

    fn voiced(ms: usize, level: i16) -> Vec<i16> {
        vec![level; ms * 8]
    }

    fn silence(ms: usize) -> Vec<i16> {
        vec![0; ms * 8]
    }

    #[test]
    fn test_silence_never_finalizes() {
        let (mut dec, seen) = decoder("hello");
        for _ in 0..500 {
            assert_eq!(dec.feed(&silence(20)).unwrap(), None);
        }
        assert!(!dec.is_capturing());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_utterance_closes_on_trailing_silence() {
        let (mut dec, seen) = decoder("  book a blood test \n");
        assert_eq!(dec.feed(&voiced(400, 5000)).unwrap(), None);
        assert!(dec.is_capturing());
        assert_eq!(dec.feed(&silence(480)).unwrap(), None);

        let text = dec.feed(&silence(20)).unwrap();
        assert_eq!(text.as_deref(), Some("book a blood test"));
        assert!(!dec.is_capturing());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_whitespace_transcript_is_no_result() {
        let (mut dec, _) = decoder("   ");
        dec.feed(&voiced(400, 5000)).unwrap();
        assert_eq!(dec.feed(&silence(600)).unwrap(), None);
    }

    #[test]
    fn test_short_blip_is_dropped() {
        let (mut dec, seen) = decoder("noise");
        // Opens the utterance (3 frames) but stays under min_utterance_ms
        dec.feed(&voiced(100, 5000)).unwrap();
        assert_eq!(dec.feed(&silence(600)).unwrap(), None);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_max_length_closes_utterance() {
        let (mut dec, seen) = decoder("long");
        let mut results = Vec::new();
        for _ in 0..600 {
            if let Some(t) = dec.feed(&voiced(20, 5000)).unwrap() {
                results.push(t);
            }
        }
        assert_eq!(results, vec!["long".to_string()]);
        assert_eq!(seen.lock().unwrap()[0].len(), 10_000 * 8);
    }

    #[test]
    fn test_odd_chunk_sizes_are_carried() {
        let (mut dec, seen) = decoder("ok");
        let mut audio = voiced(400, 5000);
        audio.extend(silence(600));

        let mut got = None;
        for chunk in audio.chunks(37) {
            if let Some(t) = dec.feed(chunk).unwrap() {
                got = Some(t);
            }
        }
        assert_eq!(got.as_deref(), Some("ok"));
        assert_eq!(seen.lock().unwrap()[0].len() % FRAME_SAMPLES, 0);
    }

    #[test]
    fn test_reset_discards_pre_reset_audio() {
        let (mut dec, seen) = decoder("after");
        // Marker amplitude only present before the reset
        dec.feed(&voiced(400, 7777)).unwrap();
        dec.feed(&voiced(7, 7777)).unwrap();
        dec.reset();
        assert!(!dec.is_capturing());

        dec.feed(&voiced(400, 3000)).unwrap();
        let text = dec.feed(&silence(600)).unwrap();
        assert_eq!(text.as_deref(), Some("after"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].iter().all(|&s| s != 7777));
    }

    /// Numbers its transcripts: utt1, utt2, ...
    struct CountingTranscriber(usize);

    impl Transcriber for CountingTranscriber {
        fn transcribe(&mut self, _pcm: &[i16]) -> Result<String> {
            self.0 += 1;
            Ok(format!("utt{}", self.0))
        }
    }

    fn two_utterances() -> Vec<i16> {
        let mut audio = voiced(400, 5000);
        audio.extend(silence(600));
        audio.extend(voiced(400, 5000));
        audio.extend(silence(600));
        audio
    }

    #[test]
    fn test_one_chunk_closing_two_utterances() {
        let mut dec = SpeechDecoder::new(
            DecoderConfig::default(),
            Box::new(EnergyVad),
            Box::new(CountingTranscriber(0)),
        );

        assert_eq!(dec.feed(&two_utterances()).unwrap().as_deref(), Some("utt1"));
        assert_eq!(dec.feed(&[]).unwrap().as_deref(), Some("utt2"));
        assert_eq!(dec.feed(&[]).unwrap(), None);
    }

    /// Factory that holds the worker thread until the test releases it
    fn gated_factory(
        gate: Arc<std::sync::Barrier>,
        reply: &'static str,
    ) -> (DecoderFactory, Arc<Mutex<Vec<Vec<i16>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory_seen = seen.clone();
        let factory: DecoderFactory = Arc::new(move || -> Result<SpeechDecoder> {
            gate.wait();
            Ok(SpeechDecoder::new(
                DecoderConfig::default(),
                Box::new(EnergyVad),
                Box::new(RecordingTranscriber {
                    seen: factory_seen.clone(),
                    reply: reply.to_string(),
                }),
            ))
        });
        (factory, seen)
    }

    #[test]
    fn test_worker_queue_is_bounded() {
        let gate = Arc::new(std::sync::Barrier::new(2));
        let (factory, _) = gated_factory(gate.clone(), "x");
        let (worker, _texts) = DecoderWorker::spawn("test", factory).unwrap();

        for _ in 0..FEED_QUEUE_CHUNKS {
            worker.feed(silence(20)).unwrap();
        }
        assert!(matches!(worker.feed(silence(20)), Err(SpeechError::QueueFull)));
        // Resets still go through while audio is being dropped
        worker.reset().unwrap();

        gate.wait();
    }

    #[test]
    fn test_worker_reset_discards_queued_audio() {
        let gate = Arc::new(std::sync::Barrier::new(2));
        let (factory, seen) = gated_factory(gate.clone(), "after");
        let (worker, mut texts) = DecoderWorker::spawn("test", factory).unwrap();

        let mut stale = voiced(400, 7777);
        stale.extend(silence(600));
        worker.feed(stale).unwrap();
        worker.reset().unwrap();
        worker.feed(voiced(400, 3000)).unwrap();
        worker.feed(silence(600)).unwrap();
        gate.wait();

        assert_eq!(texts.blocking_recv().as_deref(), Some("after"));
        drop(worker);
        assert_eq!(texts.blocking_recv(), None);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].iter().all(|&s| s != 7777));
    }

    #[test]
    fn test_missing_model_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ggml-base.en.bin");
        match SpeechModel::load(&path) {
            Err(SpeechError::ModelMissing(p)) => assert_eq!(p, path),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("model should be missing"),
        }
    }

    #[test]
    fn test_upsample_pads_to_one_second() {
        let out = upsample_for_whisper(&[16384, 0]);
        assert_eq!(out.len(), 16_000);
        assert_eq!(out[0], 0.5);
        assert_eq!(out[1], 0.25);
        assert_eq!(out[2], 0.0);
    }

    #[tokio::test]
    async fn test_worker_delivers_utterances() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory: DecoderFactory = {
            let seen = seen.clone();
            Arc::new(move || -> Result<SpeechDecoder> {
                Ok(SpeechDecoder::new(
                    DecoderConfig::default(),
                    Box::new(EnergyVad),
                    Box::new(RecordingTranscriber {
                        seen: seen.clone(),
                        reply: "hi there".to_string(),
                    }),
                ))
            })
        };

        let (worker, mut texts) = DecoderWorker::spawn("test", factory).unwrap();
        worker.feed(voiced(400, 5000)).unwrap();
        worker.feed(silence(600)).unwrap();
        worker.feed(two_utterances()).unwrap();

        for _ in 0..3 {
            let text = tokio::time::timeout(std::time::Duration::from_secs(5), texts.recv())
                .await
                .unwrap();
            assert_eq!(text.as_deref(), Some("hi there"));
        }
        assert_eq!(seen.lock().unwrap().len(), 3);

        drop(worker);
        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), texts.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }
}

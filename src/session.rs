//! Per-call session state and the interruption state machine
//!
//! A [`CallSession`] tracks the caller clock (media timestamps), the
//! response currently being played back, and the marks for audio that the
//! transport has not confirmed yet. When the caller starts talking over a
//! playing response the session decides how far playback got so the backend
//! can truncate its copy of the response.

use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info};

/// Playback states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackState {
    /// Nothing is being played to the caller
    Idle,
    /// Audio of `response_id` is being forwarded to the caller
    Playing {
        response_id: String,
        started_at_ms: u64,
        /// Backend finished generating; playback ends when marks drain
        generation_done: bool,
    },
    /// Caller barged in; truncation of `response_id` is in flight
    Interrupting { response_id: String },
}

/// What to do with an audio chunk coming from the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioDecision {
    /// Send to the caller tagged with this stream
    Forward { stream_sid: String },
    /// Chunk belongs to a response that is being truncated
    DropTruncated,
    /// No `start` event yet, nowhere to send it
    DropNoStream,
}

/// Result of a barge-in while a response was playing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interruption {
    pub response_id: String,
    /// Milliseconds of the response the caller has heard
    pub elapsed_ms: u64,
    /// Stream whose buffered audio must be cleared
    pub stream_sid: Option<String>,
}

/// State of one telephone connection
#[derive(Debug)]
pub struct CallSession {
    call_id: String,
    stream_sid: Option<String>,
    latest_media_timestamp_ms: u64,
    playback: PlaybackState,
    pending_marks: VecDeque<String>,
    last_activity: Instant,
}

impl CallSession {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            stream_sid: None,
            latest_media_timestamp_ms: 0,
            playback: PlaybackState::Idle,
            pending_marks: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }

    pub fn latest_media_timestamp_ms(&self) -> u64 {
        self.latest_media_timestamp_ms
    }

    pub fn playback(&self) -> &PlaybackState {
        &self.playback
    }

    pub fn active_response_id(&self) -> Option<&str> {
        match &self.playback {
            PlaybackState::Idle => None,
            PlaybackState::Playing { response_id, .. }
            | PlaybackState::Interrupting { response_id } => Some(response_id),
        }
    }

    pub fn response_start_timestamp_ms(&self) -> Option<u64> {
        match &self.playback {
            PlaybackState::Playing { started_at_ms, .. } => Some(*started_at_ms),
            _ => None,
        }
    }

    pub fn pending_marks(&self) -> usize {
        self.pending_marks.len()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// A new call leg started: fresh clock, nothing playing.
    pub fn on_start(&mut self, stream_sid: String) {
        info!(call_id = %self.call_id, stream_sid = %stream_sid, "Media stream started");
        self.stream_sid = Some(stream_sid);
        self.latest_media_timestamp_ms = 0;
        self.playback = PlaybackState::Idle;
        self.pending_marks.clear();
    }

    /// Advance the caller clock. Timestamps never move backwards.
    pub fn on_media(&mut self, timestamp_ms: u64) {
        self.latest_media_timestamp_ms = self.latest_media_timestamp_ms.max(timestamp_ms);
    }

    /// The transport played one marked chunk.
    pub fn on_mark(&mut self) {
        if self.pending_marks.pop_front().is_none() {
            debug!(call_id = %self.call_id, "Mark received with no pending marks");
            return;
        }

        let drained = self.pending_marks.is_empty();
        if let PlaybackState::Playing {
            generation_done: true,
            response_id,
            ..
        } = &self.playback
        {
            if drained {
                debug!(call_id = %self.call_id, response_id = %response_id, "Playback drained");
                self.playback = PlaybackState::Idle;
            }
        }
    }

    /// Bookkeeping for one backend audio chunk of `response_id`.
    pub fn on_audio_delta(&mut self, response_id: &str) -> AudioDecision {
        match &self.playback {
            PlaybackState::Interrupting { response_id: cut } if cut == response_id => {
                return AudioDecision::DropTruncated;
            }
            PlaybackState::Playing {
                response_id: current,
                ..
            } if current == response_id => {}
            _ => {
                debug!(
                    call_id = %self.call_id,
                    response_id = %response_id,
                    started_at_ms = self.latest_media_timestamp_ms,
                    "Response playback started"
                );
                self.playback = PlaybackState::Playing {
                    response_id: response_id.to_string(),
                    started_at_ms: self.latest_media_timestamp_ms,
                    generation_done: false,
                };
            }
        }

        match &self.stream_sid {
            Some(sid) => AudioDecision::Forward {
                stream_sid: sid.clone(),
            },
            None => AudioDecision::DropNoStream,
        }
    }

    /// Record that a marked chunk was sent to the transport
    pub fn push_mark(&mut self, name: &str) {
        self.pending_marks.push_back(name.to_string());
    }

    /// Caller speech detected by the backend.
    ///
    /// Only a playing response is interrupted; otherwise this is a no-op.
    pub fn on_speech_started(&mut self) -> Option<Interruption> {
        let (response_id, started_at_ms) = match &self.playback {
            PlaybackState::Playing {
                response_id,
                started_at_ms,
                ..
            } => (response_id.clone(), *started_at_ms),
            _ => return None,
        };

        let elapsed_ms = self.latest_media_timestamp_ms.saturating_sub(started_at_ms);
        info!(
            call_id = %self.call_id,
            response_id = %response_id,
            elapsed_ms,
            "Caller interrupted response"
        );

        self.pending_marks.clear();
        self.playback = PlaybackState::Interrupting {
            response_id: response_id.clone(),
        };

        Some(Interruption {
            response_id,
            elapsed_ms,
            stream_sid: self.stream_sid.clone(),
        })
    }

    /// Backend acknowledged truncation of `response_id`.
    pub fn on_truncated(&mut self, response_id: &str) {
        if self.active_response_id() == Some(response_id) {
            self.playback = PlaybackState::Idle;
        }
    }

    /// Backend finished generating the current response.
    pub fn on_response_done(&mut self) {
        match &mut self.playback {
            PlaybackState::Playing {
                generation_done, ..
            } => {
                if self.pending_marks.is_empty() {
                    self.playback = PlaybackState::Idle;
                } else {
                    *generation_done = true;
                }
            }
            PlaybackState::Interrupting { .. } | PlaybackState::Idle => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(sid: &str) -> CallSession {
        let mut s = CallSession::new("call-1");
        s.on_start(sid.to_string());
        s
    }

    fn play(s: &mut CallSession, response_id: &str) {
        match s.on_audio_delta(response_id) {
            AudioDecision::Forward { .. } => s.push_mark(crate::transport::RESPONSE_PART_MARK),
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_speech_started_while_idle_is_noop() {
        let mut s = started("abc123");
        s.on_media(500);
        assert_eq!(s.on_speech_started(), None);
        assert_eq!(s.playback(), &PlaybackState::Idle);
    }

    #[test]
    fn test_elapsed_is_caller_time_since_response_start() {
        let mut s = started("abc123");
        for ts in (0..=200).step_by(20) {
            s.on_media(ts);
        }
        play(&mut s, "item_1");
        assert_eq!(s.response_start_timestamp_ms(), Some(200));

        for ts in (220..=960).step_by(20) {
            s.on_media(ts);
        }
        let cut = s.on_speech_started().unwrap();
        assert_eq!(
            cut,
            Interruption {
                response_id: "item_1".to_string(),
                elapsed_ms: 760,
                stream_sid: Some("abc123".to_string()),
            }
        );
        assert_eq!(s.pending_marks(), 0);
        assert_eq!(s.active_response_id(), Some("item_1"));
    }

    #[test]
    fn test_start_timestamp_recorded_once_per_response() {
        let mut s = started("abc123");
        s.on_media(100);
        play(&mut s, "item_1");
        s.on_media(300);
        play(&mut s, "item_1");
        assert_eq!(s.response_start_timestamp_ms(), Some(100));

        // A different response restarts the clock
        play(&mut s, "item_2");
        assert_eq!(s.response_start_timestamp_ms(), Some(300));
    }

    #[test]
    fn test_backwards_timestamps_do_not_rewind() {
        let mut s = started("abc123");
        s.on_media(400);
        s.on_media(380);
        assert_eq!(s.latest_media_timestamp_ms(), 400);
    }

    #[test]
    fn test_elapsed_never_negative() {
        let mut s = started("abc123");
        s.on_media(1000);
        play(&mut s, "item_1");
        // Same caller time: nothing heard yet
        assert_eq!(s.on_speech_started().unwrap().elapsed_ms, 0);
    }

    #[test]
    fn test_truncated_response_chunks_are_dropped() {
        let mut s = started("abc123");
        play(&mut s, "item_1");
        s.on_speech_started().unwrap();

        assert_eq!(s.on_audio_delta("item_1"), AudioDecision::DropTruncated);
        // A second barge-in while truncating does nothing
        assert_eq!(s.on_speech_started(), None);

        s.on_truncated("item_1");
        assert_eq!(s.playback(), &PlaybackState::Idle);
    }

    #[test]
    fn test_new_response_while_interrupting_plays() {
        let mut s = started("abc123");
        play(&mut s, "item_1");
        s.on_speech_started().unwrap();
        s.on_media(40);
        play(&mut s, "item_2");
        assert_eq!(s.active_response_id(), Some("item_2"));
        assert_eq!(s.response_start_timestamp_ms(), Some(40));
    }

    #[test]
    fn test_marks_never_underflow() {
        let mut s = started("abc123");
        play(&mut s, "item_1");
        play(&mut s, "item_1");
        play(&mut s, "item_1");
        assert_eq!(s.pending_marks(), 3);

        s.on_mark();
        s.on_mark();
        s.on_mark();
        assert_eq!(s.pending_marks(), 0);

        s.on_mark();
        assert_eq!(s.pending_marks(), 0);
    }

    #[test]
    fn test_playback_ends_when_done_and_drained() {
        let mut s = started("abc123");
        play(&mut s, "item_1");
        play(&mut s, "item_1");
        s.on_response_done();
        assert!(matches!(s.playback(), PlaybackState::Playing { .. }));

        s.on_mark();
        assert!(matches!(s.playback(), PlaybackState::Playing { .. }));
        s.on_mark();
        assert_eq!(s.playback(), &PlaybackState::Idle);
        assert_eq!(s.on_speech_started(), None);
    }

    #[test]
    fn test_audio_before_start_has_no_destination() {
        let mut s = CallSession::new("call-1");
        assert_eq!(s.on_audio_delta("item_1"), AudioDecision::DropNoStream);
    }

    #[test]
    fn test_start_resets_clock_and_playback() {
        let mut s = started("abc123");
        s.on_media(5000);
        play(&mut s, "item_1");
        s.on_start("def456".to_string());
        assert_eq!(s.latest_media_timestamp_ms(), 0);
        assert_eq!(s.playback(), &PlaybackState::Idle);
        assert_eq!(s.pending_marks(), 0);
        assert_eq!(s.stream_sid(), Some("def456"));
    }
}

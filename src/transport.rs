//! Telephony media-stream wire format
//!
//! Inbound frames come from the telephony provider over the `/media-stream`
//! WebSocket; outbound frames go back on the same socket.

use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};

/// Mark name attached to every outbound audio chunk
pub const RESPONSE_PART_MARK: &str = "responsePart";

/// Frame received from the telephony transport
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundFrame {
    Start { start: StartMeta },
    Media { media: MediaPayload },
    Mark { mark: MarkMeta },
    Stop,
    /// `connected`, `dtmf` and anything newer
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MediaPayload {
    /// Base64 μ-law audio
    pub payload: String,
    /// Milliseconds since the stream started
    #[serde(default, deserialize_with = "de_timestamp")]
    pub timestamp: u64,
}

impl MediaPayload {
    /// Decode the base64 payload to raw μ-law bytes
    pub fn ulaw(&self) -> Result<Vec<u8>, base64::DecodeError> {
        general_purpose::STANDARD.decode(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarkMeta {
    #[serde(default)]
    pub name: String,
}

/// Providers send the media timestamp either as a number or a numeric string
fn de_timestamp<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl InboundFrame {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Frame sent back to the telephony transport
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundFrame {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: OutboundMark,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMark {
    pub name: String,
}

impl OutboundFrame {
    /// Audio chunk for the caller; `ulaw` is base64 encoded here
    pub fn media(stream_sid: &str, ulaw: &[u8]) -> Self {
        Self::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia {
                payload: general_purpose::STANDARD.encode(ulaw),
            },
        }
    }

    pub fn mark(stream_sid: &str) -> Self {
        Self::Mark {
            stream_sid: stream_sid.to_string(),
            mark: OutboundMark {
                name: RESPONSE_PART_MARK.to_string(),
            },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        Self::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

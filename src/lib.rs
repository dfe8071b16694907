//! phonerelay - relay telephone media streams to a conversational model
//!
//! Caller audio arrives as G.711 μ-law over a media-stream WebSocket. It is
//! decoded locally into utterances and/or forwarded to a dialogue backend,
//! and the backend's replies are relayed back while the caller can barge in.

#![forbid(unsafe_code)]

pub mod backend;
pub mod codec;
pub mod config;
pub mod gemini;
pub mod gemini_client;
pub mod realtime;
pub mod recorder;
pub mod relay;
pub mod server;
pub mod session;
pub mod speech;
pub mod transport;

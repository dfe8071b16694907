//! HTTP surface: status, call webhook and the media-stream WebSocket

use crate::relay::{SessionEnd, StreamRelay};
use crate::transport::OutboundFrame;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<StreamRelay>,
    /// Overrides the request `Host` header (minus its port) in the stream URL
    pub public_host: Option<String>,
    pub greeting: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/incoming-call", get(incoming_call).post(incoming_call))
        .route("/media-stream", get(media_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /
async fn index(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "message": "Phone relay is running",
        "backend": state.relay.backend_name(),
    }))
}

/// GET|POST /incoming-call
async fn incoming_call(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let host = state
        .public_host
        .clone()
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(|h| strip_port(h).to_string())
        })
        .unwrap_or_else(|| "localhost".to_string());

    info!(host = %host, "Incoming call, connecting media stream");
    (
        [(header::CONTENT_TYPE, "application/xml")],
        stream_twiml(&state.greeting, &host),
    )
        .into_response()
}

/// Answer the call: greet, pause, then connect the media stream.
pub fn stream_twiml(greeting: &str, host: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Response>\
         <Say>{}</Say>\
         <Pause length=\"1\"/>\
         <Connect><Stream url=\"wss://{}/media-stream\"/></Connect>\
         </Response>",
        xml_escape(greeting),
        xml_escape(host)
    )
}

/// `host:port` → `host`; bracketed IPv6 literals keep their brackets.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// GET /media-stream
async fn media_stream(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn new_call_id() -> String {
    format!("call-{:08x}", rand::random::<u32>())
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let call_id = new_call_id();
    info!(call_id = %call_id, "Media stream connected");

    let (sender, receiver) = socket.split();
    let (frame_tx, frame_rx) = mpsc::channel::<OutboundFrame>(256);
    let (discard_tx, discard_rx) = oneshot::channel();

    let writer_call_id = call_id.clone();
    let writer = tokio::spawn(async move {
        write_frames(sender, frame_rx, discard_rx, &writer_call_id).await;
    });

    let inbound = Box::pin(futures_util::stream::unfold(receiver, |mut receiver| async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some((text, receiver)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Media stream receive error: {}", e);
                    return None;
                }
            }
        }
        None
    }));

    match state.relay.run(&call_id, inbound, frame_tx).await {
        Ok(end) => {
            info!(call_id = %call_id, outcome = ?end, "Media stream closed");
            if end == SessionEnd::Stopped {
                let _ = discard_tx.send(());
            }
        }
        Err(e) => error!(call_id = %call_id, "Relay failed: {}", e),
    }

    if let Err(e) = writer.await {
        warn!(call_id = %call_id, "Writer task failed: {}", e);
    }
}

/// Forward frames to the socket until the relay drops its sender.
///
/// Once `discard` fires, frames still queued are thrown away and the socket
/// is closed. A dropped `discard` flushes the queue as usual.
async fn write_frames<S>(
    mut sink: S,
    mut frames: mpsc::Receiver<OutboundFrame>,
    mut discard: oneshot::Receiver<()>,
    call_id: &str,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut listening = true;
    loop {
        tokio::select! {
            biased;
            signal = &mut discard, if listening => {
                listening = false;
                if signal.is_ok() {
                    frames.close();
                    let mut dropped = 0;
                    while frames.try_recv().is_ok() {
                        dropped += 1;
                    }
                    debug!(call_id = %call_id, dropped, "Stream stopped, discarding queued frames");
                    break;
                }
            }
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                let json = match frame.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(call_id = %call_id, "Failed to encode outbound frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    debug!(call_id = %call_id, "Media stream send failed: {}", e);
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

//! phonerelay server binary

use anyhow::Context;
use clap::Parser;
use phonerelay::backend::DialogueBackend;
use phonerelay::config::{BackendKind, Config};
use phonerelay::gemini::GeminiTurnBackend;
use phonerelay::realtime::RealtimeBackend;
use phonerelay::relay::{StreamRelay, TranscriptEntry};
use phonerelay::server::{create_router, AppState};
use phonerelay::speech::{whisper_factory, DecoderConfig, SpeechModel};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,phonerelay=debug")),
        )
        .init();

    let config = Config::parse();
    config.validate().context("invalid configuration")?;
    info!("Starting phonerelay with {:?} backend", config.backend);

    // The relay cannot produce transcripts without a model, so this blocks serving
    let model = SpeechModel::load(&config.model_path).map_err(|e| {
        error!("Cannot load speech model: {}", e);
        e
    })?;
    let decoders = whisper_factory(DecoderConfig::default(), model);

    let backend: Arc<dyn DialogueBackend> = match config.backend {
        BackendKind::Turn => {
            let key = config.gemini_api_key.clone().context("GEMINI_API_KEY not set")?;
            Arc::new(GeminiTurnBackend::new(key, config.gemini_config()))
        }
        BackendKind::Realtime => {
            let key = config.openai_api_key.clone().context("OPENAI_API_KEY not set")?;
            Arc::new(RealtimeBackend::new(key, config.realtime_config()))
        }
    };

    let (transcript_tx, mut transcript_rx) = mpsc::unbounded_channel::<TranscriptEntry>();
    tokio::spawn(async move {
        while let Some(entry) = transcript_rx.recv().await {
            info!(
                target: "transcript",
                call_id = %entry.call_id,
                speaker = ?entry.speaker,
                "{}",
                entry.text
            );
        }
    });

    let relay = StreamRelay::new(config.relay_config(), backend, decoders)
        .with_transcript_sink(transcript_tx);
    let state = AppState {
        relay: Arc::new(relay),
        public_host: config.public_host.clone(),
        greeting: config.greeting.clone(),
    };

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, create_router(state))
        .await
        .context("server error")?;
    Ok(())
}

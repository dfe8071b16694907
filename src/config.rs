//! Command-line and environment configuration

use crate::gemini::GeminiClientConfig;
use crate::realtime::{RealtimeConfig, DEFAULT_REALTIME_URL};
use crate::relay::RelayConfig;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Local speech decoding, one text reply per utterance
    Turn,
    /// Streaming audio in and out with server-side turn detection
    Realtime,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "phonerelay")]
#[command(about = "Relay telephone media streams to a conversational model")]
pub struct Config {
    #[arg(long, env = "PORT", default_value_t = 8010)]
    pub port: u16,

    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Host name the telephony provider should connect back to
    #[arg(long, env = "PUBLIC_HOST")]
    pub public_host: Option<String>,

    #[arg(long, env = "BACKEND", value_enum, default_value_t = BackendKind::Turn)]
    pub backend: BackendKind,

    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    #[arg(long, env = "GEMINI_MODEL", default_value = "models/gemini-2.0-flash-live-001")]
    pub gemini_model: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "REALTIME_URL", default_value = DEFAULT_REALTIME_URL)]
    pub realtime_url: String,

    #[arg(long, env = "REALTIME_MODEL", default_value = "gpt-4o-realtime-preview")]
    pub realtime_model: String,

    #[arg(long, env = "REALTIME_VOICE", default_value = "alloy")]
    pub realtime_voice: String,

    /// Instructions given to the conversational model
    #[arg(long, env = "SYSTEM_INSTRUCTION")]
    pub system_instruction: Option<String>,

    /// Spoken to the caller before the media stream connects
    #[arg(
        long,
        env = "GREETING",
        default_value = "Please wait while we connect your call."
    )]
    pub greeting: String,

    /// Whisper model file
    #[arg(long, env = "MODEL_PATH", default_value = "model/ggml-base.en.bin")]
    pub model_path: PathBuf,

    /// Record decoded caller audio here, one WAV per stream
    #[arg(long, env = "RECORD_DIR")]
    pub record_dir: Option<PathBuf>,

    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value_t = 60)]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required for the {1} backend")]
    MissingKey(&'static str, &'static str),

    #[error("idle timeout must be at least one second")]
    ZeroIdleTimeout,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend {
            BackendKind::Turn if blank(&self.gemini_api_key) => {
                return Err(ConfigError::MissingKey("GEMINI_API_KEY", "turn"))
            }
            BackendKind::Realtime if blank(&self.openai_api_key) => {
                return Err(ConfigError::MissingKey("OPENAI_API_KEY", "realtime"))
            }
            _ => {}
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::ZeroIdleTimeout);
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            record_dir: self.record_dir.clone(),
        }
    }

    pub fn gemini_config(&self) -> GeminiClientConfig {
        GeminiClientConfig {
            model: self.gemini_model.clone(),
            system_instruction: self.system_instruction.clone(),
            ..Default::default()
        }
    }

    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            url: self.realtime_url.clone(),
            model: self.realtime_model.clone(),
            voice: self.realtime_voice.clone(),
            instructions: self.system_instruction.clone(),
        }
    }
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["phonerelay"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--gemini-api-key", "g-key"]);
        assert_eq!(config.port, 8010);
        assert_eq!(config.bind_addr(), "127.0.0.1:8010");
        assert_eq!(config.backend, BackendKind::Turn);
        assert_eq!(config.model_path, PathBuf::from("model/ggml-base.en.bin"));
        assert_eq!(config.relay_config().idle_timeout, Duration::from_secs(60));
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_selected_backend_needs_its_key() {
        let config = parse(&["--backend", "realtime", "--gemini-api-key", "g-key"]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingKey("OPENAI_API_KEY", "realtime"))
        );

        let config = parse(&["--backend", "realtime", "--openai-api-key", "sk-1"]);
        assert_eq!(config.validate(), Ok(()));

        let config = parse(&["--gemini-api-key", "  "]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingKey("GEMINI_API_KEY", "turn"))
        );
    }

    #[test]
    fn test_zero_idle_timeout_rejected() {
        let config = parse(&["--gemini-api-key", "g", "--idle-timeout-secs", "0"]);
        assert_eq!(config.validate(), Err(ConfigError::ZeroIdleTimeout));
    }

    #[test]
    fn test_backend_configs_share_instruction() {
        let config = parse(&[
            "--backend",
            "realtime",
            "--openai-api-key",
            "sk-1",
            "--system-instruction",
            "Book driving tests.",
            "--realtime-voice",
            "verse",
        ]);
        let realtime = config.realtime_config();
        assert_eq!(realtime.voice, "verse");
        assert_eq!(realtime.instructions.as_deref(), Some("Book driving tests."));
        assert_eq!(
            config.gemini_config().system_instruction.as_deref(),
            Some("Book driving tests.")
        );
    }
}

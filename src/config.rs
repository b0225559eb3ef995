//! Configuration management for speaking-coach-rs.
//!
//! Loads config from YAML files in standard locations. Every section
//! falls back to its defaults, so an empty file is a valid config.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::events::Channel;

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a professional American English speaking coach who excels in helping students improve their English speaking skills.
Your task is:
1. Continue the conversation with the student
2. Evaluate the student's oral expression and identify grammar, pronunciation, or expression issues (if there are none, leave the field out)
3. Provide improvement suggestions and practical methods (if there are none, leave the field out)
4. Adjust the difficulty of the conversation to the student's level
5. Offer an authentic reply the student could use next

Wrap each part of your answer in its tag:
<response>your spoken reply to the student</response>
<pronunciationSuggestion>pronunciation advice</pronunciationSuggestion>
<grammarSuggestion>grammar advice</grammarSuggestion>
<userResponseSuggestion>a reply the student could say next</userResponseSuggestion>

Answer in English and do not use rich text or any other formatting."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackendKind {
    Ollama,
    OpenAi,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: LlmBackendKind,
    pub model: String,
    pub host: String,
    pub api_key: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackendKind::Ollama,
            model: "llama3.2:3b".into(),
            host: "http://localhost:11434".into(),
            api_key: String::new(),
            temperature: 0.5,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    pub model: String,
    pub language: String,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model: "base".into(),
            language: "en".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsBackendKind {
    Kokoro,
    OpenAi,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub backend: TtsBackendKind,
    pub voice: String,
    pub speed: f32,
    pub model_path: String,
    pub voices_path: String,
    pub tokenizer_path: String,
    /// OpenAI-compatible speech API settings.
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub format: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            backend: TtsBackendKind::Kokoro,
            voice: "af_heart".into(),
            speed: 1.0,
            model_path: "kokoro-v1.0.onnx".into(),
            voices_path: "voices-v1.0.bin".into(),
            tokenizer_path: "tokenizer.json".into(),
            host: "https://api.openai.com/v1".into(),
            api_key: String::new(),
            model: "tts-1".into(),
            format: "mp3".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentScheme {
    Tagged,
    Untagged,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    pub scheme: SegmentScheme,
    /// Untagged scheme only: a unit closes once it is longer than this
    /// (in chars) and ends in a sentence terminator.
    pub min_unit_chars: usize,
    /// Channels whose units are sent to the synthesizer.
    pub audio_channels: Vec<Channel>,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            scheme: SegmentScheme::Tagged,
            min_unit_chars: 50,
            audio_channels: vec![Channel::Response],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoachConfig {
    pub system_prompt: String,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Keep at most this many turns per session. Unbounded when unset.
    pub max_turns: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub whisper: WhisperConfig,
    pub tts: TtsConfig,
    pub segmenter: SegmenterConfig,
    pub coach: CoachConfig,
    pub history: HistoryConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/speaking-coach/config.yaml
    /// 3. /etc/speaking-coach/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/speaking-coach/config.yaml")),
                Some(PathBuf::from("/etc/speaking-coach/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}

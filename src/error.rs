//! Error types for each collaborator the turn pipeline talks to.

use thiserror::Error;

/// Speech recognition failed. Terminal for the turn.
#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("invalid audio input: {0}")]
    Decode(String),

    #[error("audio input is empty")]
    Empty,

    #[error("no speech recognized")]
    NoSpeech,

    #[error("Whisper inference failed: {0}")]
    Inference(String),

    #[error("transcription task panicked: {0}")]
    Join(String),
}

/// The model stream could not be opened, or broke mid-flight. Terminal.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("model API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model stream broke: {0}")]
    Stream(String),

    #[error("malformed model stream payload: {0}")]
    Payload(String),
}

/// Synthesis of a single unit failed. Recoverable: the turn continues.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("unknown voice: {0}")]
    UnknownVoice(String),

    #[error("TTS generation failed: {0}")]
    Generation(String),

    #[error("WAV encoding failed: {0}")]
    Encode(String),

    #[error("speech request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("speech API returned status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Loading the Whisper or Kokoro model files failed at startup.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model {name} not found, {hint}")]
    NotFound { name: String, hint: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid model file {path}: {reason}")]
    Invalid { path: String, reason: String },
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("history file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

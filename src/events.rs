//! Output events of a turn, and the sink they are pushed into.
//!
//! Events are produced in strict emission order; ordering is the only
//! synchronization the consumer gets.

use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Logical output field a piece of reply text belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    /// Text outside any marker, passed through for live display.
    Plain,
    Response,
    PronunciationSuggestion,
    GrammarSuggestion,
    UserResponseSuggestion,
}

impl Channel {
    /// Channels that have open/close markers in the tagged scheme.
    pub const TAGGED: [Channel; 4] = [
        Channel::Response,
        Channel::PronunciationSuggestion,
        Channel::GrammarSuggestion,
        Channel::UserResponseSuggestion,
    ];

    /// Name used inside `<...>` markers and as the SSE `type` field.
    pub fn tag_name(self) -> &'static str {
        match self {
            Self::Plain => "text",
            Self::Response => "response",
            Self::PronunciationSuggestion => "pronunciationSuggestion",
            Self::GrammarSuggestion => "grammarSuggestion",
            Self::UserResponseSuggestion => "userResponseSuggestion",
        }
    }

    pub fn open_marker(self) -> String {
        format!("<{}>", self.tag_name())
    }

    pub fn close_marker(self) -> String {
        format!("</{}>", self.tag_name())
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag_name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    RecognizedText(String),
    TextChunk {
        channel: Channel,
        text: String,
    },
    Audio {
        channel: Channel,
        bytes: Vec<u8>,
        format: String,
    },
    Error {
        channel: Option<Channel>,
        message: String,
    },
    End,
}

impl OutputEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            channel: None,
            message: message.into(),
        }
    }

    /// JSON shape consumed by the web client.
    pub fn to_wire(&self) -> WireMessage {
        match self {
            Self::RecognizedText(text) => WireMessage::text("recognized_text", text),
            Self::TextChunk { channel, text } => WireMessage::text(channel.tag_name(), text),
            Self::Audio {
                channel,
                bytes,
                format,
            } => WireMessage {
                kind: "audio".into(),
                data: channel.tag_name().into(),
                audio: base64::engine::general_purpose::STANDARD.encode(bytes),
                format: Some(format.clone()),
            },
            Self::Error { channel, message } => WireMessage {
                kind: "error".into(),
                data: match channel {
                    Some(channel) => format!("[{channel}] {message}"),
                    None => message.clone(),
                },
                audio: String::new(),
                format: None,
            },
            Self::End => WireMessage::text("end", ""),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
    /// Base64 audio, only set for `audio` messages.
    pub audio: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl WireMessage {
    fn text(kind: &str, data: &str) -> Self {
        Self {
            kind: kind.into(),
            data: data.into(),
            audio: String::new(),
            format: None,
        }
    }
}

#[derive(Debug, Error)]
#[error("event consumer disconnected")]
pub struct Disconnected;

/// Sending half of a turn's event stream.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<OutputEvent>,
}

impl EventSink {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<OutputEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: OutputEvent) -> Result<(), Disconnected> {
        self.tx.send(event).await.map_err(|_| Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the consumer has dropped its receiver.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

//! Advanced diagnosis of a single coach remark or user answer.
//!
//! The model condenses the text into key issues, search keywords and a
//! summary. Progress streams back as log messages, then the extraction.
//! Looking up learning material for the keywords is left to the client.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::events::Disconnected;
use crate::history::{ConversationTurn, Role};
use crate::llm::TokenSource;

pub const DIAGNOSIS_BUFFER: usize = 8;

const DIAGNOSIS_SYSTEM_PROMPT: &str =
    "You analyse English learners' mistakes. Answer with a single JSON object and nothing else.";

const SUMMARY_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiagnosisKind {
    Pronunciation,
    Grammar,
    UserResponse,
}

impl fmt::Display for DiagnosisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pronunciation => write!(f, "pronunciation"),
            Self::Grammar => write!(f, "grammar"),
            Self::UserResponse => write!(f, "userResponse"),
        }
    }
}

impl FromStr for DiagnosisKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pronunciation" => Ok(Self::Pronunciation),
            "grammar" => Ok(Self::Grammar),
            "userResponse" => Ok(Self::UserResponse),
            other => Err(format!(
                "unknown diagnosis type {other:?}, expected pronunciation, grammar or userResponse"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub key_issues: Vec<String>,
    #[serde(default)]
    pub search_keywords: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosisEvent {
    Log(String),
    Extracted(Extraction),
    Error(String),
    /// Closes the stream. Carries no search results.
    Complete,
}

impl DiagnosisEvent {
    /// The JSON message the web client consumes.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Self::Log(message) => json!({ "type": "log", "data": message }),
            Self::Extracted(extraction) => json!({
                "type": "extracted",
                "status": "extracted",
                "data": extraction,
            }),
            Self::Error(message) => json!({
                "type": "error",
                "status": "error",
                "message": message,
                "data": message,
            }),
            Self::Complete => json!({ "type": "complete", "status": "complete", "results": [] }),
        }
    }
}

fn extraction_prompt(kind: DiagnosisKind, content: &str) -> String {
    let focus = match kind {
        DiagnosisKind::Pronunciation => "the pronunciation problems described",
        DiagnosisKind::Grammar => "the grammar mistakes described",
        DiagnosisKind::UserResponse => "the language problems in this learner's answer",
    };
    format!(
        "Read the following text and identify {focus}.\n\
         \n\
         Text:\n{content}\n\
         \n\
         Reply with JSON of the form \
         {{\"key_issues\": [\"...\"], \"search_keywords\": [\"...\"], \"summary\": \"...\"}} \
         where search_keywords are short phrases a learner could search for."
    )
}

/// Pull the extraction out of a model reply.
///
/// Accepts JSON wrapped in prose or code fences. Falls back to keywords
/// taken from `content` when the reply has no usable JSON.
pub fn parse_extraction(reply: &str, kind: DiagnosisKind, content: &str) -> Extraction {
    let json = match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => {
            warn!("Diagnosis reply has no JSON object, falling back to the content");
            return Extraction {
                key_issues: vec![format!("{kind} issues")],
                search_keywords: content.split_whitespace().take(3).map(str::to_string).collect(),
                summary: summary_of(content),
            };
        }
    };

    let mut extraction = match serde_json::from_str::<Extraction>(json) {
        Ok(extraction) => extraction,
        Err(e) => {
            warn!("Diagnosis reply is not valid JSON: {e}");
            Extraction {
                key_issues: vec![format!("{kind} problems")],
                search_keywords: long_words(content),
                summary: summary_of(content),
            }
        }
    };

    if extraction.search_keywords.is_empty() {
        extraction.search_keywords = long_words(content);
    }
    extraction
}

fn long_words(content: &str) -> Vec<String> {
    content
        .split_whitespace()
        .filter(|w| w.chars().count() > 3)
        .take(5)
        .map(str::to_string)
        .collect()
}

fn summary_of(content: &str) -> String {
    content.chars().take(SUMMARY_CHARS).collect()
}

async fn send(events: &mpsc::Sender<DiagnosisEvent>, event: DiagnosisEvent) -> Result<(), Disconnected> {
    events.send(event).await.map_err(|_| Disconnected)
}

/// Run one diagnosis, reporting progress on `events`.
pub async fn diagnose(
    model: &dyn TokenSource,
    kind: DiagnosisKind,
    content: &str,
    events: &mpsc::Sender<DiagnosisEvent>,
) -> Result<(), Disconnected> {
    send(events, DiagnosisEvent::Log(format!("Starting {kind} diagnosis"))).await?;

    let history = [ConversationTurn::new(Role::User, extraction_prompt(kind, content))];
    let reply = match model.generate(&history, DIAGNOSIS_SYSTEM_PROMPT).await {
        Ok(reply) => reply,
        Err(e) => {
            error!("Diagnosis request failed: {e}");
            return send(events, DiagnosisEvent::Error(format!("diagnosis failed: {e}"))).await;
        }
    };

    let extraction = parse_extraction(&reply, kind, content);
    let keywords = extraction.search_keywords.join(", ");
    info!("{kind} diagnosis keywords: {keywords}");

    send(events, DiagnosisEvent::Extracted(extraction)).await?;
    send(events, DiagnosisEvent::Log(format!("Extracted key content: {keywords}"))).await?;
    send(events, DiagnosisEvent::Complete).await
}

/// Run a diagnosis on a background task. Dropping the receiver cancels it.
pub fn spawn_diagnosis(
    model: Arc<dyn TokenSource>,
    kind: DiagnosisKind,
    content: String,
) -> mpsc::Receiver<DiagnosisEvent> {
    let (tx, rx) = mpsc::channel(DIAGNOSIS_BUFFER);
    tokio::spawn(async move {
        if diagnose(model.as_ref(), kind, &content, &tx).await.is_err() {
            info!("Consumer disconnected, {kind} diagnosis abandoned");
        }
    });
    rx
}

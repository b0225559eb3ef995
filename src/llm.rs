//! Streaming chat clients that produce the reply token by token.
//!
//! - Ollama: `POST /api/chat` with `stream: true`, newline-delimited JSON.
//! - OpenAI-compatible (DeepSeek, OpenAI, vLLM...): `POST /chat/completions`
//!   with `stream: true`, server-sent events terminated by `[DONE]`.

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{self, Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::{LlmBackendKind, LlmConfig};
use crate::error::ModelError;
use crate::history::ConversationTurn;

/// Lazy, finite, non-restartable sequence of reply fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Start generating a reply to `history`, prefixed by `system_prompt`.
    async fn open_stream(
        &self,
        history: &[ConversationTurn],
        system_prompt: &str,
    ) -> Result<FragmentStream, ModelError>;

    /// Generate the whole reply at once.
    async fn generate(&self, history: &[ConversationTurn], system_prompt: &str) -> Result<String, ModelError> {
        let mut stream = self.open_stream(history, system_prompt).await?;
        let mut reply = String::new();
        while let Some(fragment) = stream.next().await {
            reply.push_str(&fragment?);
        }
        Ok(reply)
    }
}

/// Chat backend picked once at startup from `llm.backend`.
pub enum ModelBackend {
    Ollama(ChatClient),
    OpenAi(ChatClient),
}

impl ModelBackend {
    pub fn new(config: &LlmConfig) -> Self {
        let client = ChatClient::new(config);
        info!("LLM backend: {:?}, model: {}", config.backend, config.model);
        match config.backend {
            LlmBackendKind::Ollama => Self::Ollama(client),
            LlmBackendKind::OpenAi => Self::OpenAi(client),
        }
    }
}

#[async_trait]
impl TokenSource for ModelBackend {
    async fn open_stream(
        &self,
        history: &[ConversationTurn],
        system_prompt: &str,
    ) -> Result<FragmentStream, ModelError> {
        let messages = chat_messages(history, system_prompt);
        match self {
            Self::Ollama(client) => {
                let body = json!({
                    "model": client.model,
                    "messages": messages,
                    "stream": true,
                    "options": {
                        "temperature": client.temperature,
                        "num_predict": client.max_tokens
                    }
                });
                let resp = client.post("api/chat", &body).await?;
                Ok(ndjson_fragments(resp.bytes_stream()))
            }
            Self::OpenAi(client) => {
                let body = json!({
                    "model": client.model,
                    "messages": messages,
                    "stream": true,
                    "temperature": client.temperature,
                    "max_tokens": client.max_tokens
                });
                let resp = client.post("chat/completions", &body).await?;
                Ok(sse_fragments(resp.bytes_stream()))
            }
        }
    }
}

pub struct ChatClient {
    client: Client,
    host: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl ChatClient {
    fn new(config: &LlmConfig) -> Self {
        // No overall timeout: a reply streams for as long as the model talks.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            host: config.host.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response, ModelError> {
        let url = format!("{}/{path}", self.host);
        debug!("Opening model stream at {url}");

        let mut request = self.client.post(&url).json(body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let resp = request
            .send()
            .await
            .map_err(|source| ModelError::Request { url, source })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

fn chat_messages(history: &[ConversationTurn], system_prompt: &str) -> Vec<serde_json::Value> {
    std::iter::once(json!({"role": "system", "content": system_prompt}))
        .chain(history.iter().map(|turn| json!({"role": turn.role, "content": turn.content})))
        .collect()
}

// --- Ollama NDJSON ---

#[derive(Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

struct NdjsonState<S> {
    inner: S,
    buf: Vec<u8>,
    ready: VecDeque<Result<String, ModelError>>,
    done: bool,
}

impl<S> NdjsonState<S> {
    fn drain_lines(&mut self, at_end: bool) {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.parse_line(&line);
        }
        if at_end && !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.parse_line(&line);
        }
    }

    fn parse_line(&mut self, line: &[u8]) {
        if self.done || line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        match serde_json::from_slice::<OllamaChunk>(line) {
            Ok(chunk) => {
                if let Some(error) = chunk.error {
                    self.ready.push_back(Err(ModelError::Stream(error)));
                    self.done = true;
                    return;
                }
                if let Some(message) = chunk.message {
                    if !message.content.is_empty() {
                        self.ready.push_back(Ok(message.content));
                    }
                }
                self.done = chunk.done;
            }
            Err(e) => {
                self.ready.push_back(Err(ModelError::Payload(e.to_string())));
                self.done = true;
            }
        }
    }
}

/// Decode an Ollama NDJSON byte stream into content fragments.
fn ndjson_fragments<S, B, E>(inner: S) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = NdjsonState {
        inner: Box::pin(inner),
        buf: Vec::new(),
        ready: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.ready.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    st.buf.extend_from_slice(chunk.as_ref());
                    st.drain_lines(false);
                }
                Some(Err(e)) => {
                    st.ready.push_back(Err(ModelError::Stream(e.to_string())));
                    st.done = true;
                }
                None => {
                    st.drain_lines(true);
                    st.done = true;
                }
            }
        }
    }))
}

// --- OpenAI-compatible SSE ---

#[derive(Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<SseChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: SseDelta,
}

#[derive(Default, Deserialize)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
}

fn parse_sse_data(data: &str) -> Result<Option<String>, ModelError> {
    let chunk: SseChunk = serde_json::from_str(data).map_err(|e| ModelError::Payload(format!("{e}, data: {data}")))?;

    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(ModelError::Stream(message));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|content| !content.is_empty()))
}

/// Decode an OpenAI-style SSE byte stream into content fragments.
fn sse_fragments<S, B, E>(inner: S) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let events = inner
        .eventsource()
        .take_while(|event| futures::future::ready(!matches!(event, Ok(e) if e.data.trim() == "[DONE]")))
        .filter_map(|event| async move {
            match event {
                Ok(event) => parse_sse_data(&event.data).transpose(),
                Err(e) => Some(Err(ModelError::Stream(e.to_string()))),
            }
        });

    Box::pin(events)
}

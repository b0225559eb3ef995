//! HTTP API for the web client.
//!
//! Each turn streams back as server-sent events, one JSON message per
//! output event. Diagnoses stream the same way. Sessions live in memory only.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::diagnosis::{self, DiagnosisEvent, DiagnosisKind};
use crate::events::{EventSink, OutputEvent};
use crate::history::{Conversation, ConversationTurn};
use crate::llm::TokenSource;
use crate::orchestrator::{TurnInput, TurnOrchestrator, EVENT_BUFFER};

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {0} already has a turn in progress")]
    Busy(String),

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Busy(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

enum Slot {
    Idle(Conversation),
    /// The conversation is checked out by a running turn.
    Busy,
}

/// In-memory sessions keyed by id.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Slot>>,
    max_turns: Option<usize>,
}

impl SessionStore {
    pub fn new(max_turns: Option<usize>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_turns,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.lock()
            .insert(id.clone(), Slot::Idle(Conversation::new(self.max_turns)));
        id
    }

    /// Take the conversation out for the length of a turn.
    pub fn checkout(&self, id: &str) -> Result<Conversation, ApiError> {
        let mut sessions = self.lock();
        let slot = sessions
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound(id.to_string()))?;
        match std::mem::replace(slot, Slot::Busy) {
            Slot::Idle(conversation) => Ok(conversation),
            Slot::Busy => Err(ApiError::Busy(id.to_string())),
        }
    }

    pub fn checkin(&self, id: &str, conversation: Conversation) {
        self.lock().insert(id.to_string(), Slot::Idle(conversation));
    }

    pub fn history(&self, id: &str) -> Result<Vec<ConversationTurn>, ApiError> {
        match self.lock().get(id) {
            Some(Slot::Idle(conversation)) => Ok(conversation.turns().to_vec()),
            Some(Slot::Busy) => Err(ApiError::Busy(id.to_string())),
            None => Err(ApiError::NotFound(id.to_string())),
        }
    }

    pub fn clear(&self, id: &str) -> Result<(), ApiError> {
        match self.lock().get_mut(id) {
            Some(Slot::Idle(conversation)) => {
                conversation.clear();
                Ok(())
            }
            Some(Slot::Busy) => Err(ApiError::Busy(id.to_string())),
            None => Err(ApiError::NotFound(id.to_string())),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub coach: Arc<TurnOrchestrator>,
    pub sessions: Arc<SessionStore>,
    /// Shared with the coach; used for one-shot diagnoses.
    pub model: Arc<dyn TokenSource>,
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct TextRequest {
    text: String,
}

#[derive(Deserialize)]
struct DiagnosisRequest {
    content: String,
}

#[derive(Serialize)]
struct SessionResponse {
    session_id: String,
}

#[derive(Serialize)]
struct HistoryResponse {
    session_id: String,
    turns: Vec<ConversationTurn>,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Build the axum router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/api/sessions", post(handle_create_session))
        .route("/api/sessions/{id}/text", post(handle_text_turn))
        .route("/api/sessions/{id}/audio", post(handle_audio_turn))
        .route(
            "/api/sessions/{id}/history",
            get(handle_get_history).delete(handle_clear_history),
        )
        .route("/api/advanced_diagnosis/{kind}", post(handle_diagnosis))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Serve the API until the process is stopped.
pub async fn serve(state: AppState, host: &str, port: u16) -> std::io::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Speaking coach API listening on http://{addr}");
    axum::serve(listener, router(state)).await
}

// --- Handlers ---

async fn handle_root() -> &'static str {
    "Speaking coach API is running"
}

async fn handle_create_session(State(state): State<AppState>) -> Json<SessionResponse> {
    let session_id = state.sessions.create();
    info!("Created session {session_id}");
    Json(SessionResponse { session_id })
}

async fn handle_text_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TextRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let text = req.text.trim();
    if text.is_empty() {
        return Err(ApiError::BadRequest("empty text".into()));
    }

    let preview: String = text.chars().take(80).collect();
    info!("Session {id} text turn: \"{}\"", preview.replace('\n', " "));

    start_turn(&state, id, TurnInput::Text(text.to_string()))
}

async fn handle_audio_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut audio = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() == Some("audio") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            audio = Some(bytes.to_vec());
            break;
        }
    }

    let audio = audio.ok_or_else(|| ApiError::BadRequest("missing multipart field \"audio\"".into()))?;
    if audio.is_empty() {
        return Err(ApiError::BadRequest("empty audio upload".into()));
    }
    info!("Session {id} audio turn: {} bytes", audio.len());

    start_turn(&state, id, TurnInput::Audio(audio))
}

async fn handle_get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let turns = state.sessions.history(&id)?;
    Ok(Json(HistoryResponse { session_id: id, turns }))
}

async fn handle_clear_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.sessions.clear(&id)?;
    info!("Cleared history of session {id}");
    Ok(Json(StatusResponse { status: "cleared" }))
}

async fn handle_diagnosis(
    State(state): State<AppState>,
    Path(kind): Path<DiagnosisKind>,
    Json(req): Json<DiagnosisRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let content = req.content.trim();
    if content.is_empty() {
        return Err(ApiError::BadRequest("empty content".into()));
    }
    info!("{kind} diagnosis of {} chars", content.chars().count());

    let rx = diagnosis::spawn_diagnosis(state.model.clone(), kind, content.to_string());
    Ok(Sse::new(sse_events(rx, DiagnosisEvent::to_wire)).keep_alive(KeepAlive::default()))
}

fn start_turn(
    state: &AppState,
    id: String,
    input: TurnInput,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let conversation = state.sessions.checkout(&id)?;
    let (sink, rx) = EventSink::channel(EVENT_BUFFER);
    let handle = state.coach.spawn_turn(conversation, input, sink.clone());

    // Holding a sink clone keeps the event stream open until the
    // conversation is back in the store.
    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        let conversation = match handle.await {
            Ok(conversation) => conversation,
            Err(e) => {
                error!("Turn task for session {id} failed: {e}");
                Conversation::new(sessions.max_turns)
            }
        };
        sessions.checkin(&id, conversation);
        drop(sink);
    });

    Ok(Sse::new(sse_events(rx, OutputEvent::to_wire)).keep_alive(KeepAlive::default()))
}

/// One SSE `data:` message per item, until every sender is gone.
fn sse_events<T, W>(rx: mpsc::Receiver<T>, to_wire: fn(&T) -> W) -> impl Stream<Item = Result<Event, Infallible>>
where
    T: Send + 'static,
    W: Serialize,
{
    stream::unfold(rx, move |mut rx| async move {
        let item = rx.recv().await?;
        Some((Ok(sse_event(&to_wire(&item))), rx))
    })
}

fn sse_event(message: &impl Serialize) -> Event {
    match serde_json::to_string(message) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            warn!("Failed to serialize event: {e}");
            Event::default().data(format!("{{\"type\":\"error\",\"data\":\"{e}\",\"audio\":\"\"}}"))
        }
    }
}

//! speaking-coach-rs: streaming spoken-English coach.
//!
//! Speech or text in; live text and synthesized audio of the coach's reply
//! out, unit by unit, while the model is still generating.

mod config;
mod diagnosis;
mod error;
mod events;
mod history;
mod llm;
mod orchestrator;
mod sanitizer;
mod scheduler;
mod segmenter;
mod server;
mod transcriber;
mod tts;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::diagnosis::DiagnosisKind;
use crate::events::{EventSink, OutputEvent};
use crate::history::Conversation;
use crate::llm::{ModelBackend, TokenSource};
use crate::orchestrator::{TurnInput, TurnOrchestrator, EVENT_BUFFER};
use crate::scheduler::SynthesisScheduler;
use crate::server::{AppState, SessionStore};
use crate::transcriber::WhisperTranscriber;
use crate::tts::SpeechBackend;

#[derive(Parser, Debug)]
#[command(name = "speaking-coach", about = "Streaming spoken-English coach")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/SSE API
    Serve {
        /// Override server.host
        #[arg(long)]
        host: Option<String>,

        /// Override server.port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run a single turn locally and print the events
    Chat {
        /// Typed user message
        #[arg(long, conflicts_with = "audio", required_unless_present = "audio")]
        text: Option<String>,

        /// WAV file with the spoken user message
        #[arg(long)]
        audio: Option<PathBuf>,

        /// Directory to write synthesized audio units into
        #[arg(long, default_value = "coach-audio")]
        out_dir: PathBuf,

        /// Conversation history JSON file, loaded before and saved after the turn
        #[arg(long)]
        history: Option<PathBuf>,
    },

    /// Extract key issues and search keywords from a coach remark
    Diagnose {
        /// pronunciation, grammar or userResponse
        #[arg(long)]
        kind: DiagnosisKind,

        /// The remark or answer to analyse
        content: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy ort/hyper internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,ort=info,hyper=info,reqwest=info")
    } else {
        EnvFilter::new("info,ort=warn,hyper=warn,reqwest=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("speaking-coach-rs starting");

    let config = Config::load(args.config.as_deref());
    info!(
        "Config loaded: llm={:?}/{}, tts={:?}, segmenter={:?}",
        config.llm.backend, config.llm.model, config.tts.backend, config.segmenter.scheme
    );

    let model: Arc<dyn TokenSource> = Arc::new(ModelBackend::new(&config.llm));

    match args.command {
        Command::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let state = AppState {
                coach: Arc::new(build_coach(&config, model.clone()).await?),
                sessions: Arc::new(SessionStore::new(config.history.max_turns)),
                model,
            };
            server::serve(state, &host, port).await?;
        }
        Command::Chat {
            text,
            audio,
            out_dir,
            history,
        } => {
            let input = match (text, audio) {
                (Some(text), _) => TurnInput::Text(text),
                (None, Some(path)) => TurnInput::Audio(std::fs::read(&path)?),
                (None, None) => return Err("either --text or --audio is required".into()),
            };

            let mut conversation = Conversation::new(config.history.max_turns);
            if let Some(path) = history.as_deref().filter(|p| p.exists()) {
                conversation.load(path)?;
            }

            let coach = Arc::new(build_coach(&config, model).await?);
            let conversation = run_chat(&coach, conversation, input, &out_dir).await?;

            if let Some(path) = history.as_deref() {
                conversation.save(path)?;
            }
        }
        Command::Diagnose { kind, content } => {
            let mut rx = diagnosis::spawn_diagnosis(model, kind, content);
            while let Some(event) = rx.recv().await {
                println!("{}", event.to_wire());
            }
        }
    }

    Ok(())
}

/// Load the models and wire up the turn pipeline.
async fn build_coach(
    config: &Config,
    model: Arc<dyn TokenSource>,
) -> Result<TurnOrchestrator, Box<dyn std::error::Error>> {
    // Whisper and Kokoro loads are blocking and take a few seconds
    info!("Loading Whisper model...");
    let transcriber = tokio::task::spawn_blocking({
        let whisper_config = config.whisper.clone();
        move || WhisperTranscriber::load(&whisper_config)
    })
    .await??;

    info!("Loading speech backend...");
    let speech = tokio::task::spawn_blocking({
        let tts_config = config.tts.clone();
        move || SpeechBackend::load(&tts_config)
    })
    .await??;

    let scheduler = SynthesisScheduler::new(Arc::new(speech), config.segmenter.audio_channels.clone());

    Ok(TurnOrchestrator::new(
        Arc::new(transcriber),
        model,
        scheduler,
        config.segmenter.clone(),
        config.coach.system_prompt.clone(),
    ))
}

async fn run_chat(
    coach: &Arc<TurnOrchestrator>,
    conversation: Conversation,
    input: TurnInput,
    out_dir: &std::path::Path,
) -> Result<Conversation, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(out_dir)?;

    let (sink, mut rx) = EventSink::channel(EVENT_BUFFER);
    let handle = coach.spawn_turn(conversation, input, sink);

    let mut audio_units = 0usize;
    while let Some(event) = rx.recv().await {
        match &event {
            OutputEvent::Audio {
                channel,
                bytes,
                format,
            } => {
                audio_units += 1;
                let path = out_dir.join(format!("{audio_units:03}-{channel}.{format}"));
                match std::fs::write(&path, bytes) {
                    Ok(()) => println!("[audio] {channel} -> {}", path.display()),
                    Err(e) => warn!("Failed to write {}: {e}", path.display()),
                }
            }
            other => {
                let wire = other.to_wire();
                println!("[{}] {}", wire.kind, wire.data);
            }
        }
    }

    Ok(handle.await?)
}

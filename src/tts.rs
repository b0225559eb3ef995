//! Speech synthesis backends.
//!
//! Kokoro pipeline:
//! 1. Text → sentences (split on .!?)
//! 2. Sentence → phonemes (misaki-rs G2P)
//! 3. Phonemes → token IDs (tokenizer.json vocabulary)
//! 4. Token IDs + voice style + speed → ONNX inference → f32 audio (24kHz)
//! 5. Audio → 16-bit mono WAV bytes
//!
//! The OpenAI-compatible backend posts the text to `/audio/speech` and
//! returns the encoded audio as-is.

use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use ndarray::{Array2, Array3};
use ndarray_npy::NpzReader;
use ort::value::Tensor;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info};

use crate::config::{TtsBackendKind, TtsConfig};
use crate::error::{LoadError, SynthesisError};
use crate::events::Channel;

const SAMPLE_RATE: u32 = 24000;
const MAX_TOKENS: usize = 510; // Voice style array first dimension

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    /// Container format, e.g. "wav" or "mp3".
    pub format: String,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Render one finished unit. `channel` is a hint the backend may use.
    async fn synthesize(&self, text: &str, channel: Channel) -> Result<SynthesizedAudio, SynthesisError>;
}

/// Synthesizer picked once at startup from `tts.backend`.
#[derive(Clone)]
pub enum SpeechBackend {
    Kokoro(Arc<KokoroTtsEngine>),
    OpenAi(OpenAiSpeech),
}

impl SpeechBackend {
    /// Build the configured backend. Kokoro loads its model files here,
    /// so call this from a blocking context.
    pub fn load(config: &TtsConfig) -> Result<Self, LoadError> {
        match config.backend {
            TtsBackendKind::Kokoro => Ok(Self::Kokoro(Arc::new(KokoroTtsEngine::load(config)?))),
            TtsBackendKind::OpenAi => Ok(Self::OpenAi(OpenAiSpeech::new(config))),
        }
    }
}

#[async_trait]
impl Synthesizer for SpeechBackend {
    async fn synthesize(&self, text: &str, channel: Channel) -> Result<SynthesizedAudio, SynthesisError> {
        match self {
            Self::Kokoro(engine) => {
                let engine = engine.clone();
                let text = text.to_string();
                tokio::task::spawn_blocking(move || engine.render_wav(&text, channel))
                    .await
                    .map_err(|e| SynthesisError::Generation(format!("TTS task failed: {e}")))?
            }
            Self::OpenAi(speech) => speech.synthesize(text, channel).await,
        }
    }
}

/// Loaded voice style data: shape (510, 1, 256) f32.
struct VoiceData {
    /// Style vectors indexed by token count. shape: (510, 256)
    styles: Array2<f32>,
}

/// Native Kokoro TTS engine.
pub struct KokoroTtsEngine {
    // ONNX model (Mutex because ort 2.0 Session::run needs &mut)
    session: Mutex<ort::session::Session>,
    phonemizer: misaki_rs::G2P,
    // Tokenizer vocabulary: char → token ID
    vocab: HashMap<char, i64>,
    voices: HashMap<String, VoiceData>,
    voice: String,
    speed: f32,
}

impl KokoroTtsEngine {
    /// Load the ONNX model, tokenizer, voices, and phonemizer. Blocking.
    pub fn load(config: &TtsConfig) -> Result<Self, LoadError> {
        let t0 = Instant::now();
        let model_path = PathBuf::from(&config.model_path);
        let voices_path = PathBuf::from(&config.voices_path);
        let tokenizer_path = PathBuf::from(&config.tokenizer_path);

        info!("Loading tokenizer from {}", tokenizer_path.display());
        let vocab = load_tokenizer(&tokenizer_path)?;
        info!("Tokenizer loaded: {} tokens", vocab.len());

        info!("Loading voices from {}", voices_path.display());
        let voices = load_voices(&voices_path)?;
        info!("Loaded {} voices", voices.len());
        if !voices.contains_key(&config.voice) {
            return Err(invalid(&voices_path, format!("voice '{}' not in voices file", config.voice)));
        }

        info!("Loading ONNX model from {}", model_path.display());
        let session = ort::session::Session::builder()
            .map_err(|e| invalid(&model_path, format!("session builder: {e}")))?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(|e| invalid(&model_path, format!("optimization level: {e}")))?
            .with_intra_threads(4)
            .map_err(|e| invalid(&model_path, format!("thread count: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| invalid(&model_path, e.to_string()))?;

        info!("Initializing misaki-rs phonemizer...");
        let phonemizer = misaki_rs::G2P::new(misaki_rs::Language::EnglishUS);

        info!("Kokoro TTS loaded in {}ms (voice: {}, speed: {})", t0.elapsed().as_millis(), config.voice, config.speed);

        Ok(Self {
            session: Mutex::new(session),
            phonemizer,
            vocab,
            voices,
            voice: config.voice.clone(),
            speed: config.speed,
        })
    }

    /// Render text to a WAV file in memory. Blocking.
    pub fn render_wav(&self, text: &str, channel: Channel) -> Result<SynthesizedAudio, SynthesisError> {
        let t0 = Instant::now();
        let mut samples = Vec::new();
        for sentence in split_sentences(text.trim()) {
            samples.extend(self.generate_audio(sentence)?);
        }

        let bytes = encode_wav(&samples)?;
        debug!(
            "Rendered {:.1}s of <{channel}> audio in {}ms",
            samples.len() as f32 / SAMPLE_RATE as f32,
            t0.elapsed().as_millis()
        );

        Ok(SynthesizedAudio {
            bytes,
            format: "wav".into(),
        })
    }

    /// Generate audio samples for a single sentence.
    fn generate_audio(&self, text: &str) -> Result<Vec<f32>, SynthesisError> {
        let gen_err = |what: &str, e: &dyn std::fmt::Display| SynthesisError::Generation(format!("{what}: {e}"));

        let (phonemes, _tokens) = self
            .phonemizer
            .g2p(text)
            .map_err(|e| gen_err("phonemization failed", &e))?;

        if phonemes.is_empty() {
            return Ok(Vec::new());
        }

        let mut token_ids: Vec<i64> = Vec::with_capacity(phonemes.len() + 2);
        token_ids.push(0); // Start padding
        token_ids.extend(phonemes.chars().filter_map(|ch| self.vocab.get(&ch).copied()));
        token_ids.push(0); // End padding

        let n_tokens = token_ids.len().min(MAX_TOKENS);
        token_ids.truncate(n_tokens);

        let voice_data = self
            .voices
            .get(&self.voice)
            .ok_or_else(|| SynthesisError::UnknownVoice(self.voice.clone()))?;

        // Index into style array by token count (clamped to max)
        let style_idx = (n_tokens.saturating_sub(2)).min(voice_data.styles.nrows() - 1);
        let style_vec: Vec<f32> = voice_data.styles.row(style_idx).to_vec();

        let tokens_array = Array2::from_shape_vec((1, n_tokens), token_ids)
            .map_err(|e| gen_err("tokens tensor", &e))?;
        let tokens_tensor = Tensor::from_array(tokens_array).map_err(|e| gen_err("tokens tensor", &e))?;

        let style_array = Array2::from_shape_vec((1, 256), style_vec).map_err(|e| gen_err("style tensor", &e))?;
        let style_tensor = Tensor::from_array(style_array).map_err(|e| gen_err("style tensor", &e))?;

        let speed_array = ndarray::Array1::from_vec(vec![self.speed]);
        let speed_tensor = Tensor::from_array(speed_array).map_err(|e| gen_err("speed tensor", &e))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| SynthesisError::Generation("ONNX session lock poisoned".into()))?;
        let outputs = session
            .run(ort::inputs![
                "tokens" => tokens_tensor,
                "style" => style_tensor,
                "speed" => speed_tensor
            ])
            .map_err(|e| gen_err("ONNX inference failed", &e))?;

        // ort 2.0: try_extract_tensor returns (&Shape, &[T]) tuple
        let first_output = outputs
            .iter()
            .next()
            .ok_or_else(|| SynthesisError::Generation("no output tensor from model".into()))?;
        let (_shape, audio_slice) = first_output
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| gen_err("failed to extract audio tensor", &e))?;

        Ok(audio_slice.to_vec())
    }
}

/// OpenAI-compatible `/audio/speech` client.
#[derive(Clone)]
pub struct OpenAiSpeech {
    client: Client,
    host: String,
    api_key: String,
    model: String,
    voice: String,
    speed: f32,
    format: String,
}

impl OpenAiSpeech {
    pub fn new(config: &TtsConfig) -> Self {
        Self {
            client: Client::new(),
            host: config.host.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            voice: config.voice.clone(),
            speed: config.speed,
            format: config.format.clone(),
        }
    }

    async fn synthesize(&self, text: &str, channel: Channel) -> Result<SynthesizedAudio, SynthesisError> {
        let body = json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "speed": self.speed,
            "response_format": self.format,
        });

        let t0 = Instant::now();
        let resp = self
            .client
            .post(format!("{}/audio/speech", self.host))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SynthesisError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await?.to_vec();
        debug!("Speech API returned {} bytes for <{channel}> in {}ms", bytes.len(), t0.elapsed().as_millis());

        Ok(SynthesizedAudio {
            bytes,
            format: self.format.clone(),
        })
    }
}

// --- Helper functions ---

fn invalid(path: &Path, reason: impl Into<String>) -> LoadError {
    LoadError::Invalid {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Load tokenizer vocabulary from tokenizer.json.
fn load_tokenizer(path: &Path) -> Result<HashMap<char, i64>, LoadError> {
    let contents = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let data: serde_json::Value = serde_json::from_str(&contents).map_err(|e| invalid(path, e.to_string()))?;

    let vocab = data["model"]["vocab"]
        .as_object()
        .ok_or_else(|| invalid(path, "missing model.vocab"))?;

    let mut map = HashMap::new();
    for (token, id) in vocab {
        let id = id.as_i64().ok_or_else(|| invalid(path, format!("token id for {token:?} is not an integer")))?;
        // Each token should be a single character
        if let Some(ch) = token.chars().next() {
            map.insert(ch, id);
        }
    }

    Ok(map)
}

/// Load all voice styles from an NPZ file.
fn load_voices(path: &Path) -> Result<HashMap<String, VoiceData>, LoadError> {
    let file = fs::File::open(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let mut npz = NpzReader::new(file).map_err(|e| invalid(path, e.to_string()))?;

    let names: Vec<String> = npz
        .names()
        .map_err(|e| invalid(path, e.to_string()))?
        .into_iter()
        .map(|n| n.trim_end_matches(".npy").to_string())
        .collect();

    let mut voices = HashMap::new();
    for name in &names {
        let arr: Array3<f32> = npz
            .by_name(&format!("{name}.npy"))
            .map_err(|e| invalid(path, format!("voice '{name}': {e}")))?;

        // Shape is (510, 1, 256). Squeeze the middle dimension to (510, 256).
        let dim0 = arr.shape()[0];
        let dim2 = arr.shape()[2];
        let styles = arr
            .into_shape_with_order((dim0, dim2))
            .map_err(|e| invalid(path, format!("voice '{name}': {e}")))?;

        voices.insert(name.clone(), VoiceData { styles });
    }

    Ok(voices)
}

/// Encode f32 samples in [-1, 1] as a 24kHz 16-bit mono WAV file.
fn encode_wav(samples: &[f32]) -> Result<Vec<u8>, SynthesisError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut buf = Vec::new();
    let encode_err = |e: hound::Error| SynthesisError::Encode(e.to_string());
    let mut writer = hound::WavWriter::new(Cursor::new(&mut buf), spec).map_err(encode_err)?;
    for &sample in samples {
        // f32 [-1, 1] → i16
        let s = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        writer.write_sample(s).map_err(encode_err)?;
    }
    writer.finalize().map_err(encode_err)?;

    Ok(buf)
}

/// Split text into sentences at .!? boundaries.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    for (i, &b) in bytes.iter().enumerate() {
        if (b == b'.' || b == b'!' || b == b'?') && i + 1 < bytes.len() && bytes[i + 1].is_ascii_whitespace() {
            let end = i + 1;
            let s = text[start..end].trim();
            if !s.is_empty() {
                sentences.push(s);
            }
            start = end;
        }
    }

    // Remainder
    let s = text[start..].trim();
    if !s.is_empty() {
        sentences.push(s);
    }

    sentences
}

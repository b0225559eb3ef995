//! Whisper ASR transcription using whisper-rs (whisper.cpp bindings).
//!
//! Loads a GGML model once at startup. Uploaded audio arrives as WAV
//! bytes; it is decoded with hound, downmixed to mono and resampled to
//! 16kHz before inference.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rubato::{FftFixedIn, Resampler};
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::config::WhisperConfig;
use crate::error::{LoadError, TranscribeError};

const WHISPER_SAMPLE_RATE: u32 = 16000;

/// Input frames per resampler chunk.
const RESAMPLE_CHUNK: usize = 1024;

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, TranscribeError>;
}

/// Thread-safe wrapper around WhisperContext.
#[derive(Clone)]
pub struct WhisperTranscriber {
    ctx: Arc<WhisperContext>,
    language: String,
}

impl WhisperTranscriber {
    /// Load the Whisper GGML model. Blocking.
    pub fn load(config: &WhisperConfig) -> Result<Self, LoadError> {
        let model_path = Self::find_model(&config.model)?;

        info!("Loading Whisper model from {}", model_path.display());
        let t0 = Instant::now();

        let path = model_path.to_str().ok_or_else(|| LoadError::Invalid {
            path: model_path.display().to_string(),
            reason: "path is not UTF-8".to_string(),
        })?;
        let ctx = WhisperContext::new_with_params(path, WhisperContextParameters::default()).map_err(|e| {
            LoadError::Invalid {
                path: path.to_string(),
                reason: e.to_string(),
            }
        })?;

        info!("Whisper model loaded in {}ms", t0.elapsed().as_millis());

        Ok(Self {
            ctx: Arc::new(ctx),
            language: config.language.clone(),
        })
    }

    /// Transcribe audio samples (f32, 16kHz, mono) to text. Blocking.
    pub fn transcribe_samples(&self, samples: &[f32]) -> Result<String, TranscribeError> {
        let t0 = Instant::now();

        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| TranscribeError::Inference(format!("failed to create whisper state: {e}")))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some(&self.language));
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_token_timestamps(false);

        state
            .full(params, samples)
            .map_err(|e| TranscribeError::Inference(e.to_string()))?;

        // Collect all segments into a single string
        let mut text = String::new();
        for i in 0..state.full_n_segments() {
            if let Some(segment) = state.get_segment(i) {
                if let Ok(segment_text) = segment.to_str_lossy() {
                    let trimmed = segment_text.trim();
                    if !trimmed.is_empty() {
                        if !text.is_empty() {
                            text.push(' ');
                        }
                        text.push_str(trimmed);
                    }
                }
            }
        }

        let latency_ms = t0.elapsed().as_secs_f64() * 1000.0;
        let audio_duration = samples.len() as f64 / WHISPER_SAMPLE_RATE as f64;
        info!(
            "Transcribed {:.1}s audio in {:.0}ms: \"{}\"",
            audio_duration,
            latency_ms,
            truncate_preview(&text, 80)
        );

        Ok(text)
    }

    /// Find the GGML model file.
    fn find_model(model_name: &str) -> Result<PathBuf, LoadError> {
        // Check if it's a direct path to an existing file
        let direct = PathBuf::from(model_name);
        if direct.exists() && direct.extension().is_some() {
            return Ok(direct);
        }

        let filenames = [
            format!("ggml-{}.bin", model_name.replace('/', "-")),
            "ggml-base.en.bin".to_string(),
            "ggml-base.bin".to_string(),
        ];

        let search_dirs: Vec<PathBuf> = [
            std::env::current_dir().ok(),
            std::env::current_dir().ok().map(|d| d.join("models")),
            dirs::home_dir().map(|h| h.join(".cache/whisper")),
        ]
        .into_iter()
        .flatten()
        .collect();

        for dir in &search_dirs {
            for filename in &filenames {
                let path = dir.join(filename);
                if path.exists() {
                    return Ok(path);
                }
            }
        }

        Err(LoadError::NotFound {
            name: model_name.to_string(),
            hint: format!(
                "download with:\n  \
                 wget https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.bin\n\
                 Searched in: {:?}",
                search_dirs
            ),
        })
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, TranscribeError> {
        let samples = decode_wav(audio)?;
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.transcribe_samples(&samples))
            .await
            .map_err(|e| TranscribeError::Join(e.to_string()))?
    }
}

/// Decode WAV bytes into 16kHz mono f32 samples.
pub fn decode_wav(bytes: &[u8]) -> Result<Vec<f32>, TranscribeError> {
    let decode_err = |e: hound::Error| TranscribeError::Decode(e.to_string());
    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(decode_err)?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>().map_err(decode_err)?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(decode_err)?
        }
    };

    let channels = spec.channels.max(1) as usize;
    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    if mono.is_empty() {
        return Err(TranscribeError::Empty);
    }

    resample(&mono, spec.sample_rate, WHISPER_SAMPLE_RATE)
}

/// Band-limited resampling with rubato's FFT resampler.
fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>, TranscribeError> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let resample_err = |e: rubato::ResampleError| TranscribeError::Decode(format!("resampling {from}Hz failed: {e}"));
    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
        .map_err(|e| TranscribeError::Decode(format!("cannot resample {from}Hz to {to}Hz: {e}")))?;

    let expected = (samples.len() as f64 * to as f64 / from as f64).round() as usize;
    let mut output = Vec::with_capacity(expected + RESAMPLE_CHUNK);
    let mut pos = 0;

    while samples.len() - pos >= resampler.input_frames_next() {
        let frames = resampler.input_frames_next();
        let chunk = resampler
            .process(&[&samples[pos..pos + frames]], None)
            .map_err(resample_err)?;
        output.extend_from_slice(&chunk[0]);
        pos += frames;
    }

    if pos < samples.len() {
        let tail: &[&[f32]] = &[&samples[pos..]];
        let chunk = resampler
            .process_partial(Some(tail), None)
            .map_err(resample_err)?;
        output.extend_from_slice(&chunk[0]);
    }

    // Flush the filter tail, then drop the leading delay
    let delay = resampler.output_delay();
    while output.len() < expected + delay {
        let chunk = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(resample_err)?;
        if chunk[0].is_empty() {
            break;
        }
        output.extend_from_slice(&chunk[0]);
    }
    output.drain(..delay.min(output.len()));
    output.truncate(expected);

    debug!("Resampled {} frames at {from}Hz to {} at {to}Hz", samples.len(), output.len());
    Ok(output)
}

fn truncate_preview(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(spec: hound::WavSpec, samples: &[i16]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut writer = hound::WavWriter::new(Cursor::new(&mut buf), spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        buf
    }

    fn spec(channels: u16, sample_rate: u32) -> hound::WavSpec {
        hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        }
    }

    #[test]
    fn test_decode_16k_mono() {
        let bytes = wav_bytes(spec(1, 16000), &[0, 16384, -16384, 0]);
        let samples = decode_wav(&bytes).unwrap();
        assert_eq!(samples.len(), 4);
        assert!((samples[1] - 0.5).abs() < 1e-4);
        assert!((samples[2] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_decode_downmixes_stereo() {
        let bytes = wav_bytes(spec(2, 16000), &[16384, 0, 0, -16384]);
        let samples = decode_wav(&bytes).unwrap();
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.25).abs() < 1e-4);
        assert!((samples[1] + 0.25).abs() < 1e-4);
    }

    fn tone(sample_rate: u32, freq: f32, secs: f32) -> Vec<i16> {
        let n = (sample_rate as f32 * secs) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                ((2.0 * std::f32::consts::PI * freq * t).sin() * 16384.0) as i16
            })
            .collect()
    }

    /// RMS over the middle half, away from filter edges.
    fn mid_rms(samples: &[f32]) -> f32 {
        let mid = &samples[samples.len() / 4..samples.len() * 3 / 4];
        (mid.iter().map(|s| s * s).sum::<f32>() / mid.len() as f32).sqrt()
    }

    #[test]
    fn test_decode_resamples_to_16k() {
        let bytes = wav_bytes(spec(1, 48000), &vec![0; 4800]);
        assert_eq!(decode_wav(&bytes).unwrap().len(), 1600);

        // Lengths that are not a whole number of chunks
        let bytes = wav_bytes(spec(1, 44100), &tone(44100, 440.0, 0.37));
        let samples = decode_wav(&bytes).unwrap();
        let expected = (0.37f32 * 16000.0).round() as usize;
        assert!(samples.len().abs_diff(expected) <= 2, "got {} samples", samples.len());
    }

    #[test]
    fn test_resample_keeps_speech_band() {
        let bytes = wav_bytes(spec(1, 48000), &tone(48000, 1000.0, 0.5));
        let samples = decode_wav(&bytes).unwrap();
        // 0.5 amplitude sine
        assert!(mid_rms(&samples) > 0.3, "rms {}", mid_rms(&samples));
    }

    #[test]
    fn test_resample_filters_above_nyquist() {
        // 10kHz is above the 8kHz Nyquist of the output and must not alias down
        let bytes = wav_bytes(spec(1, 48000), &tone(48000, 10000.0, 0.5));
        let samples = decode_wav(&bytes).unwrap();
        assert!(mid_rms(&samples) < 0.05, "rms {}", mid_rms(&samples));
    }

    #[test]
    fn test_find_model_accepts_direct_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ggml-tiny.bin");
        std::fs::write(&path, b"").unwrap();

        let found = WhisperTranscriber::find_model(path.to_str().unwrap()).unwrap();
        assert_eq!(found, path);
    }

    #[test]
    fn test_decode_rejects_garbage_and_empty() {
        assert!(matches!(decode_wav(b"not a wav"), Err(TranscribeError::Decode(_))));

        let empty = wav_bytes(spec(1, 16000), &[]);
        assert!(matches!(decode_wav(&empty), Err(TranscribeError::Empty)));
    }

    #[test]
    fn test_truncate_preview_is_char_safe() {
        assert_eq!(truncate_preview("héllo", 2), "hé...");
        assert_eq!(truncate_preview("hi", 5), "hi");
    }
}

//! Hands finished units to the synthesizer, one at a time, in order.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::events::{Channel, Disconnected, EventSink, OutputEvent};
use crate::sanitizer::sanitize;
use crate::segmenter::Unit;
use crate::tts::Synthesizer;

pub struct SynthesisScheduler {
    synthesizer: Arc<dyn Synthesizer>,
    audio_channels: Vec<Channel>,
}

impl SynthesisScheduler {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, audio_channels: Vec<Channel>) -> Self {
        Self {
            synthesizer,
            audio_channels,
        }
    }

    pub fn is_audio_channel(&self, channel: Channel) -> bool {
        self.audio_channels.contains(&channel)
    }

    /// Emit the unit's text, then its audio if the channel is spoken.
    ///
    /// A synthesis failure becomes an `Error` event and is not propagated.
    /// Only a vanished consumer stops the caller.
    pub async fn dispatch(&self, unit: Unit, sink: &EventSink) -> Result<(), Disconnected> {
        let Unit { channel, text } = unit;
        let spoken = self.is_audio_channel(channel).then(|| sanitize(&text));

        sink.emit(OutputEvent::TextChunk { channel, text }).await?;

        let Some(spoken) = spoken.filter(|s| !s.is_empty()) else {
            return Ok(());
        };

        if sink.is_closed() {
            return Err(Disconnected);
        }

        let t0 = Instant::now();
        let event = match self.synthesizer.synthesize(&spoken, channel).await {
            Ok(audio) => {
                debug!(
                    "Synthesized {} chars on {channel} in {}ms ({} bytes)",
                    spoken.chars().count(),
                    t0.elapsed().as_millis(),
                    audio.bytes.len()
                );
                OutputEvent::Audio {
                    channel,
                    bytes: audio.bytes,
                    format: audio.format,
                }
            }
            Err(e) => {
                warn!("Synthesis failed on {channel}: {e}");
                OutputEvent::Error {
                    channel: Some(channel),
                    message: e.to_string(),
                }
            }
        };

        sink.emit(event).await
    }
}

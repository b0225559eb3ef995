//! Drives one conversational turn.
//!
//! IDLE → RECOGNIZING (audio only) → GENERATING → DRAINING → DONE
//!
//! Model fragments are pumped through the segmenter; every finished unit
//! goes through the scheduler before the next fragment is pulled, so text
//! and audio events leave in reply order. A consumer that goes away stops
//! the pump between fragments and the scheduler between units.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SegmenterConfig;
use crate::error::TranscribeError;
use crate::events::{Channel, Disconnected, EventSink, OutputEvent};
use crate::history::{Conversation, Role};
use crate::llm::TokenSource;
use crate::scheduler::SynthesisScheduler;
use crate::segmenter::{Segment, Segmenter};
use crate::transcriber::Transcriber;

pub const EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnInput {
    Text(String),
    /// WAV bytes.
    Audio(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Recognizing,
    Generating,
    Draining,
    Done,
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Recognizing => write!(f, "RECOGNIZING"),
            Self::Generating => write!(f, "GENERATING"),
            Self::Draining => write!(f, "DRAINING"),
            Self::Done => write!(f, "DONE"),
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    /// Recognition or the model failed; the consumer got `Error` then `End`.
    Failed,
    /// The consumer disconnected.
    Cancelled,
}

pub struct TurnOrchestrator {
    transcriber: Arc<dyn Transcriber>,
    model: Arc<dyn TokenSource>,
    scheduler: SynthesisScheduler,
    segmenter: SegmenterConfig,
    system_prompt: String,
}

impl TurnOrchestrator {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        model: Arc<dyn TokenSource>,
        scheduler: SynthesisScheduler,
        segmenter: SegmenterConfig,
        system_prompt: String,
    ) -> Self {
        Self {
            transcriber,
            model,
            scheduler,
            segmenter,
            system_prompt,
        }
    }

    /// Run the turn on a background task.
    ///
    /// Dropping the receiving end of `sink` cancels the turn. The task hands
    /// the conversation back when it finishes.
    pub fn spawn_turn(
        self: &Arc<Self>,
        mut conversation: Conversation,
        input: TurnInput,
        sink: EventSink,
    ) -> JoinHandle<Conversation> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_turn(&mut conversation, input, &sink).await;
            conversation
        })
    }

    pub async fn run_turn(&self, conversation: &mut Conversation, input: TurnInput, sink: &EventSink) -> TurnOutcome {
        let t0 = Instant::now();
        let mut state = TurnState::Idle;

        let outcome = match self.drive(conversation, input, sink, &mut state).await {
            Ok(outcome) => outcome,
            Err(Disconnected) => {
                info!("Consumer disconnected while {state}, turn cancelled");
                TurnOutcome::Cancelled
            }
        };

        info!(
            "Turn finished ({outcome:?}) in {}ms, history has {} turns",
            t0.elapsed().as_millis(),
            conversation.len()
        );
        outcome
    }

    async fn drive(
        &self,
        conversation: &mut Conversation,
        input: TurnInput,
        sink: &EventSink,
        state: &mut TurnState,
    ) -> Result<TurnOutcome, Disconnected> {
        let text = match input {
            TurnInput::Text(text) => text,
            TurnInput::Audio(audio) => {
                transition(state, TurnState::Recognizing);
                match self.recognize(&audio).await {
                    Ok(text) => {
                        sink.emit(OutputEvent::RecognizedText(text.clone())).await?;
                        text
                    }
                    Err(e) => {
                        error!("Recognition failed: {e}");
                        sink.emit(OutputEvent::error(e.to_string())).await?;
                        sink.emit(OutputEvent::End).await?;
                        return Ok(TurnOutcome::Failed);
                    }
                }
            }
        };

        transition(state, TurnState::Generating);
        conversation.push(Role::User, text);

        let mut stream = match self.model.open_stream(conversation.turns(), &self.system_prompt).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to open model stream: {e}");
                conversation.pop_unanswered();
                sink.emit(OutputEvent::error(e.to_string())).await?;
                sink.emit(OutputEvent::End).await?;
                return Ok(TurnOutcome::Failed);
            }
        };

        let mut segmenter = Segmenter::new(&self.segmenter);
        let mut fragments = 0usize;

        let pumped = loop {
            let next = tokio::select! {
                biased;
                _ = sink.closed() => break Err(Disconnected),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(fragment)) => {
                    fragments += 1;
                    debug!("Fragment {fragments}: {fragment:?}");
                    if let Err(e) = self.forward(segmenter.push(&fragment), sink).await {
                        break Err(e);
                    }
                }
                Some(Err(e)) => break Ok(Some(e)),
                None => break Ok(None),
            }
        };

        let failure = match pumped {
            Ok(failure) => failure,
            Err(Disconnected) => {
                record_reply(conversation, segmenter.full_reply());
                return Err(Disconnected);
            }
        };

        transition(state, TurnState::Draining);
        let drained = self.forward(segmenter.finish(), sink).await;
        record_reply(conversation, segmenter.full_reply());
        drained?;

        let outcome = match failure {
            Some(e) => {
                error!("Model stream broke after {fragments} fragments: {e}");
                sink.emit(OutputEvent::error(e.to_string())).await?;
                TurnOutcome::Failed
            }
            None => TurnOutcome::Completed,
        };

        transition(state, TurnState::Done);
        sink.emit(OutputEvent::End).await?;
        Ok(outcome)
    }

    async fn recognize(&self, audio: &[u8]) -> Result<String, TranscribeError> {
        let text = self.transcriber.transcribe(audio).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(TranscribeError::NoSpeech);
        }
        Ok(text.to_string())
    }

    async fn forward(&self, segments: Vec<Segment>, sink: &EventSink) -> Result<(), Disconnected> {
        for segment in segments {
            match segment {
                Segment::Plain(text) => {
                    sink.emit(OutputEvent::TextChunk {
                        channel: Channel::Plain,
                        text,
                    })
                    .await?
                }
                Segment::Unit(unit) => self.scheduler.dispatch(unit, sink).await?,
            }
        }
        Ok(())
    }
}

fn transition(state: &mut TurnState, next: TurnState) {
    debug!("Turn state: {state} → {next}");
    *state = next;
}

/// Store whatever the model produced; an empty reply withdraws the question.
fn record_reply(conversation: &mut Conversation, reply: &str) {
    if reply.is_empty() {
        warn!("Model produced no output, dropping the unanswered user turn");
        conversation.pop_unanswered();
    } else {
        conversation.push(Role::Assistant, reply);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::stream;
    use tokio::sync::Notify;

    use super::*;
    use crate::config::SegmentScheme;
    use crate::error::{ModelError, SynthesisError};
    use crate::history::ConversationTurn;
    use crate::llm::FragmentStream;
    use crate::tts::{SynthesizedAudio, Synthesizer};

    struct FakeTranscriber(Option<&'static str>);

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn transcribe(&self, _audio: &[u8]) -> Result<String, TranscribeError> {
            self.0
                .map(str::to_string)
                .ok_or_else(|| TranscribeError::Decode("bad header".into()))
        }
    }

    #[derive(Default)]
    struct FakeModel {
        fragments: Vec<Result<&'static str, &'static str>>,
        open_fails: bool,
        hang_after: bool,
        seen: Mutex<Vec<(Vec<ConversationTurn>, String)>>,
    }

    impl FakeModel {
        fn replying(fragments: &[&'static str]) -> Self {
            Self {
                fragments: fragments.iter().map(|f| Ok(*f)).collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl TokenSource for FakeModel {
        async fn open_stream(
            &self,
            history: &[ConversationTurn],
            system_prompt: &str,
        ) -> Result<FragmentStream, ModelError> {
            self.seen
                .lock()
                .unwrap()
                .push((history.to_vec(), system_prompt.to_string()));
            if self.open_fails {
                return Err(ModelError::Status {
                    status: 503,
                    body: "overloaded".into(),
                });
            }
            let items: Vec<Result<String, ModelError>> = self
                .fragments
                .iter()
                .map(|f| match f {
                    Ok(text) => Ok(text.to_string()),
                    Err(msg) => Err(ModelError::Stream(msg.to_string())),
                })
                .collect();
            if self.hang_after {
                Ok(Box::pin(stream::iter(items).chain(stream::pending())))
            } else {
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }

    #[derive(Default)]
    struct FakeSynth {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Synthesizer for FakeSynth {
        async fn synthesize(&self, text: &str, _channel: Channel) -> Result<SynthesizedAudio, SynthesisError> {
            self.calls.lock().unwrap().push(text.to_string());
            if text.contains("fail") {
                return Err(SynthesisError::Generation("vocoder exploded".into()));
            }
            Ok(SynthesizedAudio {
                bytes: vec![1, 2, 3],
                format: "wav".into(),
            })
        }
    }

    /// Holds every synthesis call until released.
    #[derive(Default)]
    struct GatedSynth {
        started: Notify,
        release: Notify,
        calls: Mutex<Vec<String>>,
        finished: Mutex<usize>,
    }

    #[async_trait]
    impl Synthesizer for GatedSynth {
        async fn synthesize(&self, text: &str, _channel: Channel) -> Result<SynthesizedAudio, SynthesisError> {
            self.calls.lock().unwrap().push(text.to_string());
            self.started.notify_one();
            self.release.notified().await;
            *self.finished.lock().unwrap() += 1;
            Ok(SynthesizedAudio {
                bytes: vec![9],
                format: "wav".into(),
            })
        }
    }

    fn coach(transcript: Option<&'static str>, model: Arc<FakeModel>, synth: Arc<FakeSynth>) -> Arc<TurnOrchestrator> {
        coach_with(transcript, model, synth, SegmenterConfig::default())
    }

    fn coach_with(
        transcript: Option<&'static str>,
        model: Arc<FakeModel>,
        synth: Arc<FakeSynth>,
        segmenter: SegmenterConfig,
    ) -> Arc<TurnOrchestrator> {
        let scheduler = SynthesisScheduler::new(synth, segmenter.audio_channels.clone());
        Arc::new(TurnOrchestrator::new(
            Arc::new(FakeTranscriber(transcript)),
            model,
            scheduler,
            segmenter,
            "You are a coach.".into(),
        ))
    }

    async fn run(
        coach: &Arc<TurnOrchestrator>,
        conversation: Conversation,
        input: TurnInput,
    ) -> (Vec<OutputEvent>, Conversation) {
        let (sink, mut rx) = EventSink::channel(EVENT_BUFFER);
        let handle = coach.spawn_turn(conversation, input, sink);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (events, handle.await.unwrap())
    }

    fn kinds(events: &[OutputEvent]) -> Vec<String> {
        events.iter().map(|e| e.to_wire().kind).collect()
    }

    fn text(channel: Channel, text: &str) -> OutputEvent {
        OutputEvent::TextChunk {
            channel,
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn test_synthesis_failure_on_second_of_three_units() {
        let model = Arc::new(FakeModel::replying(&[
            "<response>One.</response>",
            "<response>Two fail.</response>",
            "<response>Three.</response>",
        ]));
        let coach = coach(None, model, Arc::new(FakeSynth::default()));

        let (events, conversation) = run(&coach, Conversation::default(), TurnInput::Text("Hi".into())).await;

        assert_eq!(
            kinds(&events),
            ["response", "audio", "response", "error", "response", "audio", "end"]
        );
        assert_eq!(events[2], text(Channel::Response, "Two fail."));
        assert!(matches!(
            &events[3],
            OutputEvent::Error { channel: Some(Channel::Response), message } if message.contains("vocoder exploded")
        ));
        assert_eq!(conversation.len(), 2);
    }

    #[tokio::test]
    async fn test_tagged_reply_routes_channels_and_records_raw_reply() {
        let fragments = [
            "Sure! <r",
            "esponse>Hi there</resp",
            "onse><grammarSuggestion>Say 'I went'.</grammarSuggestion>",
        ];
        let model = Arc::new(FakeModel::replying(&fragments));
        let synth = Arc::new(FakeSynth::default());
        let coach = coach(None, model.clone(), synth.clone());

        let (events, conversation) = run(&coach, Conversation::default(), TurnInput::Text("I go yesterday".into())).await;

        assert_eq!(
            events,
            vec![
                text(Channel::Plain, "Sure! "),
                text(Channel::Response, "Hi there"),
                OutputEvent::Audio {
                    channel: Channel::Response,
                    bytes: vec![1, 2, 3],
                    format: "wav".into()
                },
                text(Channel::GrammarSuggestion, "Say 'I went'."),
                OutputEvent::End,
            ]
        );
        assert_eq!(*synth.calls.lock().unwrap(), vec!["Hi there".to_string()]);

        let turns = conversation.turns();
        assert_eq!(turns[0], ConversationTurn::new(Role::User, "I go yesterday"));
        assert_eq!(turns[1], ConversationTurn::new(Role::Assistant, fragments.concat()));
    }

    #[tokio::test]
    async fn test_model_sees_history_and_system_prompt() {
        let model = Arc::new(FakeModel::replying(&["<response>Fine.</response>"]));
        let coach = coach(None, model.clone(), Arc::new(FakeSynth::default()));

        let mut conversation = Conversation::default();
        conversation.push(Role::User, "Hello");
        conversation.push(Role::Assistant, "<response>Hi!</response>");

        let (_, conversation) = run(&coach, conversation, TurnInput::Text("How are you?".into())).await;

        let seen = model.seen.lock().unwrap();
        let (history, prompt) = &seen[0];
        assert_eq!(prompt, "You are a coach.");
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].content, "How are you?");
        assert_eq!(conversation.len(), 4);
    }

    #[tokio::test]
    async fn test_audio_input_emits_recognized_text_first() {
        let model = Arc::new(FakeModel::replying(&["<response>Good.</response>"]));
        let coach = coach(Some("  I like apples. "), model.clone(), Arc::new(FakeSynth::default()));

        let (events, conversation) = run(&coach, Conversation::default(), TurnInput::Audio(vec![0; 4])).await;

        assert_eq!(events[0], OutputEvent::RecognizedText("I like apples.".into()));
        assert_eq!(kinds(&events), ["recognized_text", "response", "audio", "end"]);
        assert_eq!(conversation.turns()[0].content, "I like apples.");
    }

    #[tokio::test]
    async fn test_recognition_failure_is_terminal() {
        let model = Arc::new(FakeModel::replying(&["<response>unused</response>"]));
        let coach = coach(None, model.clone(), Arc::new(FakeSynth::default()));

        let (events, conversation) = run(&coach, Conversation::default(), TurnInput::Audio(vec![0; 4])).await;

        assert_eq!(kinds(&events), ["error", "end"]);
        assert!(conversation.is_empty());
        assert!(model.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_silence_is_a_recognition_failure() {
        let model = Arc::new(FakeModel::replying(&["<response>unused</response>"]));
        let coach = coach(Some("   "), model.clone(), Arc::new(FakeSynth::default()));

        let (events, _) = run(&coach, Conversation::default(), TurnInput::Audio(vec![0; 4])).await;

        assert_eq!(kinds(&events), ["error", "end"]);
        assert!(events[0].to_wire().data.contains("no speech"));
    }

    #[tokio::test]
    async fn test_model_open_failure_rolls_back_user_turn() {
        let model = Arc::new(FakeModel {
            open_fails: true,
            ..FakeModel::default()
        });
        let coach = coach(None, model, Arc::new(FakeSynth::default()));

        let (events, conversation) = run(&coach, Conversation::default(), TurnInput::Text("Hi".into())).await;

        assert_eq!(kinds(&events), ["error", "end"]);
        assert!(events[0].to_wire().data.contains("503"));
        assert!(conversation.is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_keeps_bounded_history() {
        let model = Arc::new(FakeModel {
            open_fails: true,
            ..FakeModel::default()
        });
        let coach = coach(None, model, Arc::new(FakeSynth::default()));

        let mut conversation = Conversation::new(Some(2));
        conversation.push(Role::User, "q0");
        conversation.push(Role::Assistant, "a0");

        let (events, conversation) = run(&coach, conversation, TurnInput::Text("q1".into())).await;

        assert_eq!(kinds(&events), ["error", "end"]);
        assert_eq!(
            conversation.turns(),
            [
                ConversationTurn::new(Role::User, "q0"),
                ConversationTurn::new(Role::Assistant, "a0"),
            ]
        );
    }

    #[tokio::test]
    async fn test_bounded_history_evicts_after_reply() {
        let model = Arc::new(FakeModel::replying(&["<response>Fine.</response>"]));
        let coach = coach(None, model.clone(), Arc::new(FakeSynth::default()));

        let mut conversation = Conversation::new(Some(2));
        conversation.push(Role::User, "q0");
        conversation.push(Role::Assistant, "a0");

        let (_, conversation) = run(&coach, conversation, TurnInput::Text("q1".into())).await;

        // The model still saw the full pair before the new question
        assert_eq!(model.seen.lock().unwrap()[0].0.len(), 3);
        assert_eq!(
            conversation.turns(),
            [
                ConversationTurn::new(Role::User, "q1"),
                ConversationTurn::new(Role::Assistant, "<response>Fine.</response>"),
            ]
        );
    }

    #[tokio::test]
    async fn test_mid_stream_break_drains_then_errors() {
        let model = Arc::new(FakeModel {
            fragments: vec![
                Ok("<response>One.</response><grammarSuggestion>Use 'went'"),
                Err("connection reset"),
                Ok("<response>never seen</response>"),
            ],
            ..FakeModel::default()
        });
        let coach = coach(None, model, Arc::new(FakeSynth::default()));

        let (events, conversation) = run(&coach, Conversation::default(), TurnInput::Text("Hi".into())).await;

        assert_eq!(events[0], text(Channel::Response, "One."));
        assert_eq!(kinds(&events), ["response", "audio", "grammarSuggestion", "error", "end"]);
        assert_eq!(events[2], text(Channel::GrammarSuggestion, "Use 'went'"));
        assert!(events[3].to_wire().data.contains("connection reset"));

        assert_eq!(conversation.len(), 2);
        assert_eq!(
            conversation.turns()[1].content,
            "<response>One.</response><grammarSuggestion>Use 'went'"
        );
    }

    #[tokio::test]
    async fn test_untagged_reply_is_cut_at_sentences() {
        let model = Arc::new(FakeModel::replying(&[
            "That is a very good question about English grammar. ",
            "Let me explain.",
            " Short tail",
        ]));
        let synth = Arc::new(FakeSynth::default());
        let segmenter = SegmenterConfig {
            scheme: SegmentScheme::Untagged,
            ..SegmenterConfig::default()
        };
        let coach = coach_with(None, model, synth.clone(), segmenter);

        let (events, _) = run(&coach, Conversation::default(), TurnInput::Text("Why?".into())).await;

        assert_eq!(kinds(&events), ["response", "audio", "response", "audio", "end"]);
        assert_eq!(
            events[0],
            text(
                Channel::Response,
                "That is a very good question about English grammar. Let me explain."
            )
        );
        assert_eq!(events[2], text(Channel::Response, " Short tail"));
        assert_eq!(synth.calls.lock().unwrap()[1], "Short tail");
    }

    #[tokio::test]
    async fn test_disconnect_stops_pumping_and_keeps_partial_reply() {
        let model = Arc::new(FakeModel {
            fragments: vec![Ok("<response>One.</response>")],
            hang_after: true,
            ..FakeModel::default()
        });
        let synth = Arc::new(FakeSynth::default());
        let coach = coach(None, model, synth.clone());

        let (sink, mut rx) = EventSink::channel(EVENT_BUFFER);
        let handle = coach.spawn_turn(Conversation::default(), TurnInput::Text("Hi".into()), sink);
        assert_eq!(rx.recv().await, Some(text(Channel::Response, "One.")));
        assert!(matches!(rx.recv().await, Some(OutputEvent::Audio { .. })));
        drop(rx);

        let conversation = handle.await.unwrap();
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.turns()[1].content, "<response>One.</response>");
        assert_eq!(synth.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_during_synthesis_discards_audio() {
        let reply = "<response>One.</response><response>Two.</response>";
        let model = Arc::new(FakeModel::replying(&[reply]));
        let synth = Arc::new(GatedSynth::default());
        let scheduler = SynthesisScheduler::new(synth.clone(), SegmenterConfig::default().audio_channels);
        let coach = Arc::new(TurnOrchestrator::new(
            Arc::new(FakeTranscriber(None)),
            model,
            scheduler,
            SegmenterConfig::default(),
            "You are a coach.".into(),
        ));

        let (sink, mut rx) = EventSink::channel(EVENT_BUFFER);
        let task = tokio::spawn({
            let coach = coach.clone();
            async move {
                let mut conversation = Conversation::default();
                let outcome = coach.run_turn(&mut conversation, TurnInput::Text("Hi".into()), &sink).await;
                (outcome, conversation)
            }
        });

        assert_eq!(rx.recv().await, Some(text(Channel::Response, "One.")));
        synth.started.notified().await;
        drop(rx);
        synth.release.notify_one();

        let (outcome, conversation) = task.await.unwrap();
        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert_eq!(*synth.calls.lock().unwrap(), vec!["One.".to_string()]);
        assert_eq!(*synth.finished.lock().unwrap(), 1);
        assert_eq!(conversation.turns()[1].content, reply);
    }

    #[tokio::test]
    async fn test_empty_reply_drops_user_turn() {
        let model = Arc::new(FakeModel::replying(&[]));
        let coach = coach(None, model, Arc::new(FakeSynth::default()));

        let (events, conversation) = run(&coach, Conversation::default(), TurnInput::Text("Hi".into())).await;

        assert_eq!(events, vec![OutputEvent::End]);
        assert!(conversation.is_empty());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TurnState::Draining.to_string(), "DRAINING");
    }
}

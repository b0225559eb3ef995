//! Incremental segmentation of a live model token stream.
//!
//! Two schemes:
//! - Tagged: the reply carries `<channel>...</channel>` markers. Text between
//!   a channel's markers becomes one unit; text outside any marker is passed
//!   through as it arrives.
//! - Untagged: the whole reply is the `Response` channel, cut into units at
//!   sentence terminators once enough text has accumulated.
//!
//! Both keep their look-ahead state across fragments, so a marker or a
//! sentence split over two chunks segments exactly like the unsplit stream.

use tracing::{debug, warn};

use crate::config::{SegmentScheme, SegmenterConfig};
use crate::events::Channel;

const SENTENCE_TERMINATORS: [char; 6] = ['.', '!', '?', '。', '！', '？'];

/// A finished span of text attributed to one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub channel: Channel,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Text outside any marker, emitted immediately.
    Plain(String),
    /// A closed unit, ready for the scheduler.
    Unit(Unit),
}

pub enum Segmenter {
    Tagged(TagSegmenter),
    Untagged(SentenceSegmenter),
}

impl Segmenter {
    pub fn new(config: &SegmenterConfig) -> Self {
        match config.scheme {
            SegmentScheme::Tagged => Self::Tagged(TagSegmenter::new()),
            SegmentScheme::Untagged => Self::Untagged(SentenceSegmenter::new(config.min_unit_chars)),
        }
    }

    /// Feed one model fragment. Returns whatever became final because of it.
    pub fn push(&mut self, fragment: &str) -> Vec<Segment> {
        match self {
            Self::Tagged(s) => s.push(fragment),
            Self::Untagged(s) => s.push(fragment),
        }
    }

    /// End of stream: flush look-ahead and force-close any open unit.
    pub fn finish(&mut self) -> Vec<Segment> {
        match self {
            Self::Tagged(s) => s.finish(),
            Self::Untagged(s) => s.finish(),
        }
    }

    /// Every raw fragment received so far, concatenated.
    pub fn full_reply(&self) -> &str {
        match self {
            Self::Tagged(s) => &s.full_reply,
            Self::Untagged(s) => &s.full_reply,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Open(Channel),
    Close(Channel),
}

enum MarkerMatch {
    Complete(Marker),
    Partial,
    None,
}

pub struct TagSegmenter {
    markers: Vec<(String, Marker)>,
    active: Option<Channel>,
    unit: String,
    /// Characters that may still turn out to be a marker. Survives across
    /// fragments.
    pending: String,
    full_reply: String,
}

impl TagSegmenter {
    pub fn new() -> Self {
        let markers = Channel::TAGGED
            .iter()
            .flat_map(|&c| [(c.open_marker(), Marker::Open(c)), (c.close_marker(), Marker::Close(c))])
            .collect();

        Self {
            markers,
            active: None,
            unit: String::new(),
            pending: String::new(),
            full_reply: String::new(),
        }
    }

    pub fn push(&mut self, fragment: &str) -> Vec<Segment> {
        self.full_reply.push_str(fragment);

        let mut out = Vec::new();
        for c in fragment.chars() {
            self.feed(c, &mut out);
        }
        out
    }

    pub fn finish(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();

        // Whatever is pending is a strict marker prefix, so it can only be text.
        let pending = std::mem::take(&mut self.pending);
        for c in pending.chars() {
            self.literal(c, &mut out);
        }

        if let Some(channel) = self.active.take() {
            let text = self.unit.trim();
            if !text.is_empty() {
                warn!("Stream ended inside <{channel}>, closing unit");
                out.push(Segment::Unit(Unit {
                    channel,
                    text: text.to_string(),
                }));
            }
            self.unit.clear();
        }

        out
    }

    fn feed(&mut self, c: char, out: &mut Vec<Segment>) {
        if self.pending.is_empty() && c != '<' {
            self.literal(c, out);
            return;
        }

        self.pending.push(c);
        match self.match_pending() {
            MarkerMatch::Partial => {}
            MarkerMatch::Complete(marker) => {
                self.pending.clear();
                self.apply(marker, out);
            }
            MarkerMatch::None => {
                // The leading '<' is literal; a later '<' in the buffer may
                // still start a real marker, so rescan the rest.
                let pending = std::mem::take(&mut self.pending);
                let mut chars = pending.chars();
                if let Some(first) = chars.next() {
                    self.literal(first, out);
                }
                for c in chars {
                    self.feed(c, out);
                }
            }
        }
    }

    fn match_pending(&self) -> MarkerMatch {
        let mut partial = false;
        for (text, marker) in &self.markers {
            let candidate = match marker {
                Marker::Open(_) => true,
                Marker::Close(channel) => self.active == Some(*channel),
            };
            if !candidate {
                continue;
            }
            if *text == self.pending {
                return MarkerMatch::Complete(*marker);
            }
            if text.starts_with(self.pending.as_str()) {
                partial = true;
            }
        }
        if partial {
            MarkerMatch::Partial
        } else {
            MarkerMatch::None
        }
    }

    fn apply(&mut self, marker: Marker, out: &mut Vec<Segment>) {
        match (marker, self.active) {
            (Marker::Open(channel), None) => {
                debug!("Opened <{channel}>");
                self.active = Some(channel);
                self.unit.clear();
            }
            (Marker::Open(channel), Some(current)) => {
                warn!("Nested <{channel}> inside <{current}>, keeping it as text");
                self.unit.push_str(&channel.open_marker());
            }
            (Marker::Close(channel), _) => {
                let text = self.unit.trim();
                if !text.is_empty() {
                    out.push(Segment::Unit(Unit {
                        channel,
                        text: text.to_string(),
                    }));
                }
                debug!("Closed <{channel}>");
                self.unit.clear();
                self.active = None;
            }
        }
    }

    fn literal(&mut self, c: char, out: &mut Vec<Segment>) {
        if self.active.is_some() {
            self.unit.push(c);
            return;
        }
        match out.last_mut() {
            Some(Segment::Plain(text)) => text.push(c),
            _ => out.push(Segment::Plain(c.to_string())),
        }
    }
}

impl Default for TagSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SentenceSegmenter {
    min_chars: usize,
    unit: String,
    unit_chars: usize,
    full_reply: String,
}

impl SentenceSegmenter {
    pub fn new(min_chars: usize) -> Self {
        Self {
            min_chars,
            unit: String::new(),
            unit_chars: 0,
            full_reply: String::new(),
        }
    }

    pub fn push(&mut self, fragment: &str) -> Vec<Segment> {
        self.full_reply.push_str(fragment);
        self.unit.push_str(fragment);
        self.unit_chars += fragment.chars().count();

        let ends_sentence = self
            .unit
            .chars()
            .next_back()
            .is_some_and(|c| SENTENCE_TERMINATORS.contains(&c));

        if self.unit_chars > self.min_chars && ends_sentence {
            vec![self.take_unit()]
        } else {
            Vec::new()
        }
    }

    pub fn finish(&mut self) -> Vec<Segment> {
        if self.unit.is_empty() {
            Vec::new()
        } else {
            vec![self.take_unit()]
        }
    }

    fn take_unit(&mut self) -> Segment {
        self.unit_chars = 0;
        Segment::Unit(Unit {
            channel: Channel::Response,
            text: std::mem::take(&mut self.unit),
        })
    }
}

//! Per-session conversation history.
//!
//! The turns plus the system prompt form the full context sent to the model
//! on every turn. Can be saved to and restored from a JSON file.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::HistoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Ordered, append-only list of turns.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
    max_turns: Option<usize>,
}

impl Conversation {
    pub fn new(max_turns: Option<usize>) -> Self {
        Self {
            turns: Vec::new(),
            max_turns,
        }
    }

    /// Append a turn. The bound is applied once an assistant turn completes
    /// a pair, so a user turn that is later withdrawn never costs history.
    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.turns.push(ConversationTurn::new(role, content));
        if role == Role::Assistant {
            self.evict();
        }
    }

    /// Drop the last turn if it is an unanswered user message.
    pub fn pop_unanswered(&mut self) -> Option<ConversationTurn> {
        match self.turns.last() {
            Some(turn) if turn.role == Role::User => self.turns.pop(),
            _ => None,
        }
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn save(&self, path: &Path) -> Result<(), HistoryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.turns)?;
        fs::write(path, json)?;
        info!("Saved {} turns to {}", self.turns.len(), path.display());
        Ok(())
    }

    /// Replace the current turns with those stored at `path`.
    pub fn load(&mut self, path: &Path) -> Result<(), HistoryError> {
        let contents = fs::read_to_string(path)?;
        self.turns = serde_json::from_str(&contents)?;
        self.evict();
        info!("Loaded {} turns from {}", self.turns.len(), path.display());
        Ok(())
    }

    /// Keep at most `max_turns`, dropping the oldest user/assistant pairs.
    ///
    /// The bound is rounded up to a whole number of pairs (at least one).
    fn evict(&mut self) {
        let Some(max) = self.max_turns else {
            return;
        };
        let max = max.max(2).next_multiple_of(2);
        if self.turns.len() <= max {
            return;
        }
        let mut excess = self.turns.len() - max;
        // Whole pairs only, so the history still opens with a user turn.
        excess += excess % 2;
        let excess = excess.min(self.turns.len());
        self.turns.drain(..excess);
        debug!("Evicted {excess} old turns");
    }
}

//! Conversation log built from streamed transcription fragments.
//!
//! User speech is shown live: the open user turn is provisional and its text
//! tracks the inbound accumulator. Storyteller text is held back and appended
//! as one turn when the turn completes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Ai,
}

/// One entry in the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    /// When the first fragment of this turn arrived.
    pub started_at: DateTime<Utc>,
}

impl Turn {
    fn new(speaker: Speaker, text: String) -> Self {
        Self {
            speaker,
            text,
            started_at: Utc::now(),
        }
    }
}

/// What a completed turn added to the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnSummary {
    pub user: Option<String>,
    pub ai: Option<String>,
}

/// Append-only turn log plus the per-turn accumulators.
#[derive(Debug, Default)]
pub struct Conversation {
    finalized: Vec<Turn>,
    /// The open user turn; always rendered after every finalized turn.
    provisional: Option<Turn>,
    user_buffer: String,
    ai_buffer: String,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// All turns in chronological order, the provisional one last.
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.finalized.iter().chain(self.provisional.iter())
    }

    pub fn len(&self) -> usize {
        self.finalized.len() + usize::from(self.provisional.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<&Turn> {
        self.provisional.as_ref().or_else(|| self.finalized.last())
    }

    pub fn has_open_user_turn(&self) -> bool {
        self.provisional.is_some()
    }

    pub fn pending_user_text(&self) -> &str {
        &self.user_buffer
    }

    pub fn pending_ai_text(&self) -> &str {
        &self.ai_buffer
    }

    /// Append a fragment of user speech and mirror it into the open user turn.
    pub fn push_user_delta(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.user_buffer.push_str(delta);
        match self.provisional.as_mut() {
            Some(turn) => turn.text.clone_from(&self.user_buffer),
            None => self.provisional = Some(Turn::new(Speaker::User, self.user_buffer.clone())),
        }
    }

    /// Append a fragment of storyteller speech; not visible until the turn completes.
    pub fn push_ai_delta(&mut self, delta: &str) {
        self.ai_buffer.push_str(delta);
    }

    /// Close the turn: finalize the open user turn with the full user
    /// transcript, append the storyteller's text if any, reset both buffers.
    pub fn complete_turn(&mut self) -> TurnSummary {
        let mut summary = TurnSummary::default();

        let user_text = std::mem::take(&mut self.user_buffer);
        if self.provisional.is_some() {
            summary.user = Some(user_text.clone());
            self.promote(user_text);
        }

        let ai_text = std::mem::take(&mut self.ai_buffer);
        if !ai_text.is_empty() {
            summary.ai = Some(ai_text.clone());
            self.finalized.push(Turn::new(Speaker::Ai, ai_text));
        }

        debug!("Turn complete: {:?}", summary);
        summary
    }

    /// Session ended mid-turn: keep what the user visibly said, drop unshown
    /// storyteller text.
    pub fn abandon_turn(&mut self) {
        let user_text = std::mem::take(&mut self.user_buffer);
        if self.provisional.is_some() {
            self.promote(user_text);
        }
        self.ai_buffer.clear();
    }

    /// The only path from provisional to final.
    fn promote(&mut self, text: String) {
        if let Some(mut turn) = self.provisional.take() {
            turn.text = text;
            self.finalized.push(turn);
        }
    }
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One committed message. Turns are immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// Append-only conversation history, oldest first.
///
/// The transcript is the single source of truth for what is rendered and
/// what is replayed into the next model request. There is no removal and no
/// reordering; a render pass and a request builder both walk `turns()` in
/// order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push(Turn {
            role: Role::User,
            text: text.into(),
        });
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.turns.push(Turn {
            role: Role::Assistant,
            text: text.into(),
        });
    }

    pub fn turns(&self) -> &[Turn] {
        self.turns.as_slice()
    }

    /// Texts of assistant turns in commit order. This is what the story
    /// selector is populated from.
    pub fn stories(&self) -> Vec<&str> {
        self.turns
            .iter()
            .filter(|turn| turn.role == Role::Assistant)
            .map(|turn| turn.text.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// True when the most recent turn is a user turn still waiting for a
    /// reply (a failed generation leaves the transcript in this shape).
    pub fn awaiting_reply(&self) -> bool {
        self.turns
            .last()
            .map(|turn| turn.role == Role::User)
            .unwrap_or(false)
    }
}

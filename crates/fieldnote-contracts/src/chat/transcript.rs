use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed prompt paired with every captured photo.
pub const IDENTIFY_PROMPT: &str = "You are a wildlife expert. Identify the organism in this \
picture. Tell me the name of the organism. The species. The scientific name. Two fun facts \
about this organism that are not known to many.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TurnContent {
    Text(String),
    /// Base64-encoded JPEG, exactly as persisted to the gallery.
    Photo(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: TurnContent,
    pub description: Option<String>,
}

impl ChatTurn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Text(text.into()),
            description: None,
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: TurnContent::Text(text.into()),
            description: None,
        }
    }

    pub fn user_photo(image_b64: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Photo(image_b64.into()),
            description: None,
        }
    }

    pub fn is_photo(&self) -> bool {
        matches!(self.content, TurnContent::Photo(_))
    }
}

/// Ordered, append-only record of one session's chat turns.
///
/// Turns are never removed; the only in-place mutation is the one-shot
/// description attached to the first photo turn after the model replies.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub session_id: String,
    pub started_at: String,
    turns: Vec<ChatTurn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            turns: Vec::new(),
        }
    }

    pub fn push(&mut self, turn: ChatTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[ChatTurn] {
        self.turns.as_slice()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Attaches `description` to the first photo turn. A transcript without a
    /// photo turn is left untouched; with several photo turns only the first
    /// is ever annotated.
    pub fn annotate_first_photo(&mut self, description: &str) -> bool {
        match self.turns.iter_mut().find(|turn| turn.is_photo()) {
            Some(turn) => {
                turn.description = Some(description.to_string());
                true
            }
            None => false,
        }
    }

    /// Photo turns carrying a non-empty description, in transcript order.
    pub fn described_photos(&self) -> Vec<(&str, &str)> {
        self.turns
            .iter()
            .filter_map(|turn| match (&turn.content, turn.description.as_deref()) {
                (TurnContent::Photo(image), Some(description)) if !description.is_empty() => {
                    Some((image.as_str(), description))
                }
                _ => None,
            })
            .collect()
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

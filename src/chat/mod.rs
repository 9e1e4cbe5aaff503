//! Chat message model shared by the validator, the detector and the
//! configuration manager.
//!
//! A message sequence is what a caller wants to send through a chat-turn
//! API. `ChatRestrictions` describes the structural rules a runtime is
//! known (or inferred) to enforce on such sequences.

pub mod inference;
pub mod validator;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use inference::{infer_restrictions, ProbeOutcome, RestrictionInference, RuleTableInference};
pub use validator::validate;

/// Role of a message in a chat-turn sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Structural rules a runtime enforces on message sequences.
///
/// Every field is independent. `None` means "no known restriction", which
/// is different from the restriction being explicitly `false`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRestrictions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_system_at_start: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternating_turns: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_user_last: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_system_messages: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_empty_messages: Option<bool>,
}

impl ChatRestrictions {
    /// Number of restriction fields that carry a value (whatever the value).
    pub fn defined_count(&self) -> usize {
        [
            self.single_system_at_start.is_some(),
            self.alternating_turns.is_some(),
            self.requires_user_last.is_some(),
            self.max_system_messages.is_some(),
            self.allow_empty_messages.is_some(),
        ]
        .into_iter()
        .filter(|defined| *defined)
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.defined_count() == 0
    }
}

/// Outcome of validating a message sequence against a restriction set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Fully repaired message sequence, when a repair was possible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fixes: Option<Vec<Message>>,
    /// Audit trail of what the repair changed and why.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_fixes: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            ..Default::default()
        }
    }
}

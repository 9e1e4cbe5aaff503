//! Caller-injected hooks.
//!
//! Every hook has a default body returning `None`, which means "use the
//! built-in behavior". A hook that returns `Some` fully replaces the
//! default, except `determine_api` whose `None` is read as "no opinion"
//! and lets the strategy-based decision run.

use crate::chat::{ChatRestrictions, Message, ValidationResult};

use super::{ApiStrategy, InvocationMode, ModelCapabilities};

/// Everything a custom API selector may look at.
#[derive(Debug, Clone, Copy)]
pub struct ApiSelectionContext<'a> {
    pub messages: &'a [Message],
    pub validation: &'a ValidationResult,
    pub capabilities: Option<&'a ModelCapabilities>,
    pub restrictions: Option<&'a ChatRestrictions>,
    pub strategy: ApiStrategy,
}

/// Model-specific processing hooks.
pub trait CustomProcessor: Send + Sync {
    fn preprocess_messages(&self, _messages: &[Message]) -> Option<Vec<Message>> {
        None
    }

    fn preprocess_completion(&self, _prompt: &str) -> Option<String> {
        None
    }

    fn validate_messages(
        &self,
        _messages: &[Message],
        _restrictions: Option<&ChatRestrictions>,
    ) -> Option<ValidationResult> {
        None
    }

    fn determine_api(&self, _context: &ApiSelectionContext<'_>) -> Option<InvocationMode> {
        None
    }
}

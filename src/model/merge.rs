//! Field merge policies.
//!
//! Each configuration field has its own merge semantics. The policies are
//! named functions so the construction-time merge and the post-detection
//! merge apply exactly the same rules:
//!
//! | Field               | Policy                         |
//! |---------------------|--------------------------------|
//! | `api_strategy`      | [`shallow_override`]           |
//! | `capabilities`      | [`deep_merge_keys`]            |
//! | `chat_restrictions` | [`shallow_with_explicit_clear`]|
//! | `custom_processor`  | [`priority_chain`]             |

use std::sync::Arc;

use super::presets::ModelPreset;
use super::processor::CustomProcessor;
use super::{DetectedConfig, ModelCapabilities, ModelConfig, ModelOverride, RestrictionsOverride};
use crate::chat::ChatRestrictions;

/// Types whose top-level keys can be merged one by one.
pub trait KeyMerge: Clone {
    /// Keeps every key of `base` unless `priority` defines the same key.
    fn merge_keys(base: &Self, priority: &Self) -> Self;
}

impl KeyMerge for ModelCapabilities {
    fn merge_keys(base: &Self, priority: &Self) -> Self {
        Self {
            has_chat_template: priority.has_chat_template.or(base.has_chat_template),
            supports_completion: priority.supports_completion.or(base.supports_completion),
            special_tokens: priority
                .special_tokens
                .clone()
                .or_else(|| base.special_tokens.clone()),
        }
    }
}

/// The override wins whole if present, otherwise the base.
pub fn shallow_override<T: Clone>(over: Option<&T>, base: Option<&T>) -> Option<T> {
    over.or(base).cloned()
}

/// Key-wise merge where `priority` wins per key.
pub fn deep_merge_keys<T: KeyMerge>(base: Option<&T>, priority: Option<&T>) -> Option<T> {
    match (base, priority) {
        (Some(base), Some(priority)) => Some(T::merge_keys(base, priority)),
        (base, priority) => priority.or(base).cloned(),
    }
}

/// Shallow override that can also explicitly clear the base value.
pub fn shallow_with_explicit_clear(
    over: &RestrictionsOverride,
    base: Option<&ChatRestrictions>,
) -> Option<ChatRestrictions> {
    match over {
        RestrictionsOverride::Inherit => base.cloned(),
        RestrictionsOverride::Clear => None,
        RestrictionsOverride::Replace(restrictions) => Some(restrictions.clone()),
    }
}

/// First present candidate wins.
pub fn priority_chain<T>(candidates: impl IntoIterator<Item = Option<T>>) -> Option<T> {
    candidates.into_iter().flatten().next()
}

/// Construction-time merge of preset and caller override.
pub fn merge_initial(
    model_name: &str,
    preset: Option<&ModelPreset>,
    over: &ModelOverride,
) -> ModelConfig {
    ModelConfig {
        model_name: model_name.to_string(),
        api_strategy: shallow_override(
            over.api_strategy.as_ref(),
            preset.and_then(|p| p.api_strategy.as_ref()),
        )
        .unwrap_or_default(),
        capabilities: deep_merge_keys(
            preset.and_then(|p| p.capabilities.as_ref()),
            over.capabilities.as_ref(),
        ),
        chat_restrictions: shallow_with_explicit_clear(
            &over.chat_restrictions,
            preset.and_then(|p| p.chat_restrictions.as_ref()),
        ),
    }
}

/// Resolves which custom processor a manager uses.
pub fn resolve_processor(
    explicit: Option<Arc<dyn CustomProcessor>>,
    over: &ModelOverride,
    preset: Option<&ModelPreset>,
) -> Option<Arc<dyn CustomProcessor>> {
    priority_chain([
        explicit,
        over.custom_processor.clone(),
        preset.and_then(|p| p.custom_processor.clone()),
    ])
}

/// Folds detection results into an existing configuration.
///
/// Only capabilities are merged and the existing keys win. Strategy and
/// restrictions set at construction are left alone.
pub fn merge_detected(config: &mut ModelConfig, detected: &DetectedConfig) {
    config.capabilities = deep_merge_keys(
        detected.capabilities.as_ref(),
        config.capabilities.as_ref(),
    );
}

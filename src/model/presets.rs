//! Preset table: default configurations for known model families.
//!
//! A preset is selected by matching its pattern against the model name,
//! case-insensitively. Patterns are unanchored and `*` matches any run of
//! characters, so `mistral*instruct` matches
//! `mlx-community/Mistral-7B-Instruct-v0.3-4bit`. The first matching preset
//! wins.

use std::fmt;
use std::sync::Arc;

use super::processor::CustomProcessor;
use super::{ApiStrategy, ModelCapabilities};
use crate::chat::ChatRestrictions;

/// Defaults for one model family.
#[derive(Clone)]
pub struct ModelPreset {
    pub pattern: String,
    pub api_strategy: Option<ApiStrategy>,
    pub capabilities: Option<ModelCapabilities>,
    pub chat_restrictions: Option<ChatRestrictions>,
    pub custom_processor: Option<Arc<dyn CustomProcessor>>,
}

impl ModelPreset {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            api_strategy: None,
            capabilities: None,
            chat_restrictions: None,
            custom_processor: None,
        }
    }

    pub fn matches(&self, model_name: &str) -> bool {
        pattern_matches(&self.pattern, model_name)
    }
}

impl fmt::Debug for ModelPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelPreset")
            .field("pattern", &self.pattern)
            .field("api_strategy", &self.api_strategy)
            .field("capabilities", &self.capabilities)
            .field("chat_restrictions", &self.chat_restrictions)
            .field("custom_processor", &self.custom_processor.is_some())
            .finish()
    }
}

/// Ordered list of presets.
#[derive(Debug, Clone, Default)]
pub struct PresetTable {
    presets: Vec<ModelPreset>,
}

impl PresetTable {
    pub fn new(presets: Vec<ModelPreset>) -> Self {
        Self { presets }
    }

    /// Presets for the model families whose chat templates are known.
    pub fn builtin() -> Self {
        let template_and_completion = ModelCapabilities {
            has_chat_template: Some(true),
            supports_completion: Some(true),
            special_tokens: None,
        };

        Self::new(vec![
            // Gemma 1.1/2 templates reject the system role and non-alternating turns
            ModelPreset {
                capabilities: Some(template_and_completion.clone()),
                chat_restrictions: Some(ChatRestrictions {
                    max_system_messages: Some(0),
                    alternating_turns: Some(true),
                    ..Default::default()
                }),
                ..ModelPreset::new("gemma-2-")
            },
            ModelPreset {
                capabilities: Some(template_and_completion.clone()),
                chat_restrictions: Some(ChatRestrictions {
                    max_system_messages: Some(0),
                    alternating_turns: Some(true),
                    ..Default::default()
                }),
                ..ModelPreset::new("gemma-1.1")
            },
            ModelPreset {
                capabilities: Some(template_and_completion.clone()),
                chat_restrictions: Some(ChatRestrictions {
                    single_system_at_start: Some(true),
                    alternating_turns: Some(true),
                    requires_user_last: Some(true),
                    ..Default::default()
                }),
                ..ModelPreset::new("mistral*instruct")
            },
            ModelPreset {
                capabilities: Some(template_and_completion.clone()),
                chat_restrictions: Some(ChatRestrictions {
                    single_system_at_start: Some(true),
                    alternating_turns: Some(true),
                    ..Default::default()
                }),
                ..ModelPreset::new("llama-2*chat")
            },
            ModelPreset {
                api_strategy: Some(ApiStrategy::Auto),
                capabilities: Some(template_and_completion),
                ..ModelPreset::new("qwen")
            },
        ])
    }

    pub fn find(&self, model_name: &str) -> Option<&ModelPreset> {
        self.presets.iter().find(|p| p.matches(model_name))
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}

/// Unanchored, case-insensitive match with `*` wildcards.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    let name = name.to_lowercase();
    let pattern = pattern.to_lowercase();
    let mut rest = name.as_str();
    for segment in pattern.split('*').filter(|s| !s.is_empty()) {
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches_substring_case_insensitive() {
        assert!(pattern_matches("qwen", "mlx-community/Qwen3-0.6B-4bit"));
        assert!(!pattern_matches("qwen", "mlx-community/gemma-2-2b-it-4bit"));
    }

    #[test]
    fn test_pattern_matches_wildcard_in_order() {
        assert!(pattern_matches(
            "mistral*instruct",
            "mlx-community/Mistral-7B-Instruct-v0.3-4bit"
        ));
        assert!(!pattern_matches("instruct*mistral", "Mistral-7B-Instruct"));
        assert!(pattern_matches("*", "anything"));
    }

    #[test]
    fn test_builtin_gemma_preset() {
        let table = PresetTable::builtin();
        let preset = table.find("mlx-community/gemma-2-2b-it-4bit").unwrap();
        assert_eq!(preset.pattern, "gemma-2-");
        let restrictions = preset.chat_restrictions.as_ref().unwrap();
        assert_eq!(restrictions.max_system_messages, Some(0));
        assert_eq!(restrictions.alternating_turns, Some(true));
    }

    #[test]
    fn test_builtin_mistral_has_three_restrictions() {
        let table = PresetTable::builtin();
        let preset = table
            .find("mistralai/Mistral-7B-Instruct-v0.2")
            .unwrap();
        assert_eq!(preset.chat_restrictions.as_ref().unwrap().defined_count(), 3);
    }

    #[test]
    fn test_unknown_model_has_no_preset() {
        let table = PresetTable::builtin();
        assert!(table.find("some-org/custom-model").is_none());
        assert!(!table.is_empty());
    }

    #[test]
    fn test_first_match_wins() {
        let table = PresetTable::new(vec![
            ModelPreset {
                api_strategy: Some(ApiStrategy::ForceChat),
                ..ModelPreset::new("llama")
            },
            ModelPreset {
                api_strategy: Some(ApiStrategy::ForceCompletion),
                ..ModelPreset::new("llama-3")
            },
        ]);
        let preset = table.find("meta/llama-3-8b").unwrap();
        assert_eq!(preset.api_strategy, Some(ApiStrategy::ForceChat));
        assert_eq!(table.len(), 2);
    }
}

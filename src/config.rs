use serde::Deserialize;

use crate::chat::ChatRestrictions;
use crate::model::cache::DEFAULT_CACHE_CAPACITY;
use crate::model::{
    ApiStrategy, ModelCapabilities, ModelOverride, RestrictionsOverride,
    DEFAULT_RESTRICTION_THRESHOLD,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub model: ModelSection,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelSection {
    /// Model identifier, e.g. "mlx-community/gemma-2-2b-it-4bit"
    pub name: String,
    pub api_strategy: Option<ApiStrategy>,
    pub capabilities: Option<ModelCapabilities>,
    pub chat_restrictions: Option<ChatRestrictions>,
    /// Drop the preset's restrictions without replacing them
    #[serde(default)]
    pub clear_chat_restrictions: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RuntimeConfig {
    /// TCP address of a runtime bridge, e.g. "127.0.0.1:7411".
    /// Supports ${ENV_VAR} substitution
    pub address: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_restriction_threshold")]
    pub restriction_threshold: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            restriction_threshold: default_restriction_threshold(),
        }
    }
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_restriction_threshold() -> usize {
    DEFAULT_RESTRICTION_THRESHOLD
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${RUNTIME_ADDR}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        if config.model.clear_chat_restrictions && config.model.chat_restrictions.is_some() {
            anyhow::bail!("model: clear_chat_restrictions conflicts with [model.chat_restrictions]");
        }
        Ok(config)
    }

    /// Caller override built from the `[model]` section
    pub fn model_override(&self) -> ModelOverride {
        let chat_restrictions = match (&self.model.chat_restrictions, self.model.clear_chat_restrictions) {
            (Some(r), _) => RestrictionsOverride::Replace(r.clone()),
            (None, true) => RestrictionsOverride::Clear,
            (None, false) => RestrictionsOverride::Inherit,
        };
        ModelOverride {
            api_strategy: self.model.api_strategy,
            capabilities: self.model.capabilities.clone(),
            chat_restrictions,
            custom_processor: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ── parse tests ─────────────────────────────────────

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse("[model]\nname = \"some/model\"\n").unwrap();
        assert_eq!(config.model.name, "some/model");
        assert!(config.runtime.address.is_none());
        assert_eq!(config.validation.cache_capacity, 256);
        assert_eq!(config.validation.restriction_threshold, 3);

        let over = config.model_override();
        assert!(over.api_strategy.is_none());
        assert!(over.capabilities.is_none());
        assert_eq!(over.chat_restrictions, RestrictionsOverride::Inherit);
    }

    #[test]
    fn test_full_model_section() {
        let config = Config::parse(
            r#"
[model]
name = "mlx-community/Mistral-7B-Instruct-v0.3-4bit"
api_strategy = "prefer-chat"

[model.capabilities]
has_chat_template = true
supports_completion = false

[model.chat_restrictions]
requires_user_last = true
max_system_messages = 1

[validation]
cache_capacity = 16
restriction_threshold = 2
"#,
        )
        .unwrap();

        let over = config.model_override();
        assert_eq!(over.api_strategy, Some(ApiStrategy::PreferChat));
        let caps = over.capabilities.unwrap();
        assert_eq!(caps.has_chat_template, Some(true));
        assert_eq!(caps.supports_completion, Some(false));
        assert_eq!(
            over.chat_restrictions,
            RestrictionsOverride::Replace(ChatRestrictions {
                requires_user_last: Some(true),
                max_system_messages: Some(1),
                ..Default::default()
            })
        );
        assert_eq!(config.validation.cache_capacity, 16);
        assert_eq!(config.validation.restriction_threshold, 2);
    }

    #[test]
    fn test_clear_chat_restrictions() {
        let config = Config::parse(
            "[model]\nname = \"gemma-2-2b\"\nclear_chat_restrictions = true\n",
        )
        .unwrap();
        assert_eq!(config.model_override().chat_restrictions, RestrictionsOverride::Clear);
    }

    #[test]
    fn test_clear_conflicts_with_explicit_restrictions() {
        let result = Config::parse(
            "[model]\nname = \"x\"\nclear_chat_restrictions = true\n\n[model.chat_restrictions]\nalternating_turns = true\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let result = Config::parse("[model]\nname = \"x\"\napi_strategy = \"sometimes\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_model_section_is_rejected() {
        assert!(Config::parse("[runtime]\naddress = \"127.0.0.1:1\"\n").is_err());
    }

    // ── load tests ──────────────────────────────────────

    #[test]
    fn test_load_expands_env_vars() {
        std::env::set_var("MODE_NEGOTIATOR_TEST_ADDR", "127.0.0.1:7411");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[model]\nname = \"qwen\"\n\n[runtime]\naddress = \"${{MODE_NEGOTIATOR_TEST_ADDR}}\""
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.runtime.address.as_deref(), Some("127.0.0.1:7411"));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/nonexistent/mode-negotiator.toml").is_err());
    }
}

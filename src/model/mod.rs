//! Model configuration: what a runtime can do, how the caller wants it
//! used, and the manager that decides between chat and completion mode.

pub mod cache;
pub mod detector;
pub mod manager;
pub mod merge;
pub mod presets;
pub mod processor;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chat::ChatRestrictions;

pub use detector::CapabilityDetector;
pub use manager::ModelConfigManager;
pub use processor::{ApiSelectionContext, CustomProcessor};

/// Restriction count at or above which `auto` prefers completion mode.
pub const DEFAULT_RESTRICTION_THRESHOLD: usize = 3;

/// A special token id and its text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRef {
    pub text: String,
    pub id: u32,
}

/// A special token known to the runtime's tokenizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenSpec {
    /// Delimiter pair, e.g. `<|system|>` … `<|/system|>`.
    Pair { start: TokenRef, end: TokenRef },
    /// Standalone token, e.g. the end-of-document marker.
    Single { text: String, id: u32 },
}

/// What the runtime can physically do.
///
/// Every key is optional so that presets, caller overrides and detection
/// results can be merged key by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_chat_template: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_completion: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_tokens: Option<BTreeMap<String, TokenSpec>>,
}

/// Caller policy for choosing the invocation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiStrategy {
    #[default]
    Auto,
    PreferChat,
    PreferCompletion,
    ForceChat,
    ForceCompletion,
}

impl ApiStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiStrategy::Auto => "auto",
            ApiStrategy::PreferChat => "prefer-chat",
            ApiStrategy::PreferCompletion => "prefer-completion",
            ApiStrategy::ForceChat => "force-chat",
            ApiStrategy::ForceCompletion => "force-completion",
        }
    }
}

impl fmt::Display for ApiStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The API a request is sent through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationMode {
    Chat,
    Completion,
}

impl fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InvocationMode::Chat => "chat",
            InvocationMode::Completion => "completion",
        })
    }
}

/// Merged configuration of one model, as returned by
/// [`ModelConfigManager::config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelConfig {
    pub model_name: String,
    pub api_strategy: ApiStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<ModelCapabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_restrictions: Option<ChatRestrictions>,
}

/// Partial configuration produced by capability detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectedConfig {
    pub model_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_strategy: Option<ApiStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<ModelCapabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_restrictions: Option<ChatRestrictions>,
}

/// How a caller override treats the preset's restrictions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RestrictionsOverride {
    /// Key not given: keep the preset's restrictions.
    #[default]
    Inherit,
    /// Key given with no value: drop the preset's restrictions.
    Clear,
    /// Key given: use these restrictions instead of the preset's.
    Replace(ChatRestrictions),
}

/// Caller-supplied configuration layered on top of the preset.
#[derive(Clone, Default)]
pub struct ModelOverride {
    pub api_strategy: Option<ApiStrategy>,
    pub capabilities: Option<ModelCapabilities>,
    pub chat_restrictions: RestrictionsOverride,
    pub custom_processor: Option<Arc<dyn CustomProcessor>>,
}

impl fmt::Debug for ModelOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelOverride")
            .field("api_strategy", &self.api_strategy)
            .field("capabilities", &self.capabilities)
            .field("chat_restrictions", &self.chat_restrictions)
            .field("custom_processor", &self.custom_processor.is_some())
            .finish()
    }
}

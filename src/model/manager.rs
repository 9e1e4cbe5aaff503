//! Model Configuration Manager.
//!
//! Owns the merged configuration of one model: preset and caller override
//! are merged at construction, detected capabilities are folded in once by
//! [`ModelConfigManager::initialize`], and every request is routed through
//! [`ModelConfigManager::determine_api`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use anyhow::{Context, Result};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::cache::{CacheStats, ValidationCache, DEFAULT_CACHE_CAPACITY};
use super::detector::CapabilityDetector;
use super::merge::{merge_detected, merge_initial, resolve_processor};
use super::presets::PresetTable;
use super::processor::{ApiSelectionContext, CustomProcessor};
use super::{ApiStrategy, InvocationMode, ModelConfig, ModelOverride, DEFAULT_RESTRICTION_THRESHOLD};
use crate::chat::{validate, Message, ValidationResult};
use crate::runtime::ModelRuntime;

pub struct ModelConfigManager {
    runtime: Arc<dyn ModelRuntime>,
    config: RwLock<ModelConfig>,
    processor: Option<Arc<dyn CustomProcessor>>,
    cache: Mutex<ValidationCache>,
    /// Set once detection has been merged. Concurrent first callers share
    /// the same in-flight detection.
    initialized: OnceCell<()>,
    restriction_threshold: usize,
}

impl ModelConfigManager {
    /// Builds a manager using the built-in preset table.
    pub fn new(
        model_name: &str,
        runtime: Arc<dyn ModelRuntime>,
        over: Option<ModelOverride>,
        processor: Option<Arc<dyn CustomProcessor>>,
    ) -> Self {
        Self::with_presets(model_name, runtime, over, processor, &PresetTable::builtin())
    }

    pub fn with_presets(
        model_name: &str,
        runtime: Arc<dyn ModelRuntime>,
        over: Option<ModelOverride>,
        processor: Option<Arc<dyn CustomProcessor>>,
        presets: &PresetTable,
    ) -> Self {
        let over = over.unwrap_or_default();
        let preset = presets.find(model_name);
        match preset {
            Some(p) => debug!("Model {model_name} matches preset {}", p.pattern),
            None => debug!("No preset for model {model_name}"),
        }

        let config = merge_initial(model_name, preset, &over);
        let processor = resolve_processor(processor, &over, preset);

        info!(
            "Model {model_name}: strategy {}, {} restriction(s)",
            config.api_strategy,
            config
                .chat_restrictions
                .as_ref()
                .map_or(0, |r| r.defined_count())
        );

        Self {
            runtime,
            config: RwLock::new(config),
            processor,
            cache: Mutex::new(ValidationCache::new(DEFAULT_CACHE_CAPACITY)),
            initialized: OnceCell::new(),
            restriction_threshold: DEFAULT_RESTRICTION_THRESHOLD,
        }
    }

    /// Overrides the restriction count at which `auto` switches to completion.
    pub fn with_restriction_threshold(mut self, threshold: usize) -> Self {
        self.restriction_threshold = threshold;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = Mutex::new(ValidationCache::new(capacity));
        self
    }

    // ── Detection ────────────────────────────────────────

    /// Detects runtime capabilities and merges them into the configuration.
    ///
    /// Runs at most once. Only `capabilities` is merged, and values already
    /// configured take priority over detected ones. Fails only when the
    /// runtime breaks its response contract, in which case a later call
    /// retries.
    pub async fn initialize(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                let model_name = self.read_config().model_name.clone();
                let detected = CapabilityDetector::new(model_name.as_str(), self.runtime.clone())
                    .with_threshold(self.restriction_threshold)
                    .detect()
                    .await
                    .with_context(|| format!("capability detection failed for {model_name}"))?;

                {
                    let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
                    if let Some(recommended) = detected.api_strategy {
                        if recommended != config.api_strategy {
                            debug!(
                                "Detection recommends {recommended}, keeping configured {}",
                                config.api_strategy
                            );
                        }
                    }
                    merge_detected(&mut config, &detected);
                }

                info!("Model {model_name} initialized");
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    // ── Decision ─────────────────────────────────────────

    /// Picks the invocation mode for `messages`.
    ///
    /// Priority: custom hook, forced strategy, missing chat template,
    /// missing completion support, then the preference strategies.
    pub fn determine_api(&self, messages: &[Message]) -> InvocationMode {
        let config = self.config();
        let mut validation = None;

        if let Some(ref processor) = self.processor {
            let result = self.validate_messages(messages);
            let context = ApiSelectionContext {
                messages,
                validation: &result,
                capabilities: config.capabilities.as_ref(),
                restrictions: config.chat_restrictions.as_ref(),
                strategy: config.api_strategy,
            };
            if let Some(mode) = processor.determine_api(&context) {
                debug!("Custom processor selected {mode}");
                return mode;
            }
            validation = Some(result);
        }

        match config.api_strategy {
            ApiStrategy::ForceChat => {
                if !can_use_chat(&config) {
                    warn!(
                        "force-chat is set for {} but no chat template is known, sending chat anyway",
                        config.model_name
                    );
                }
                return InvocationMode::Chat;
            }
            ApiStrategy::ForceCompletion => {
                if !can_use_completion(&config) {
                    warn!(
                        "force-completion is set for {} but completion is reported unsupported, sending completion anyway",
                        config.model_name
                    );
                }
                return InvocationMode::Completion;
            }
            _ => {}
        }

        if !can_use_chat(&config) {
            return InvocationMode::Completion;
        }
        if !can_use_completion(&config) {
            return InvocationMode::Chat;
        }

        let mut is_valid = || {
            validation
                .get_or_insert_with(|| self.validate_messages(messages))
                .valid
        };

        match config.api_strategy {
            ApiStrategy::PreferChat => {
                if is_valid() {
                    InvocationMode::Chat
                } else {
                    InvocationMode::Completion
                }
            }
            ApiStrategy::PreferCompletion => InvocationMode::Completion,
            _ => {
                let restriction_count = config
                    .chat_restrictions
                    .as_ref()
                    .map_or(0, |r| r.defined_count());
                if !is_valid() || restriction_count >= self.restriction_threshold {
                    InvocationMode::Completion
                } else {
                    InvocationMode::Chat
                }
            }
        }
    }

    // ── Validation and preprocessing ─────────────────────

    /// Validates `messages` against the configured restrictions, caching
    /// results by message sequence.
    pub fn validate_messages(&self, messages: &[Message]) -> ValidationResult {
        let restrictions = self.read_config().chat_restrictions.clone();

        if let Some(ref processor) = self.processor {
            if let Some(result) = processor.validate_messages(messages, restrictions.as_ref()) {
                return result;
            }
        }

        let key = ValidationCache::key(messages);
        if let Some(hit) = self.lock_cache().get(&key) {
            return hit;
        }

        let result = match restrictions {
            Some(ref r) => validate(messages, r),
            None => ValidationResult::ok(),
        };
        self.lock_cache().insert(key, result.clone());
        result
    }

    /// Returns the sequence to send in chat mode, repaired when possible.
    pub fn preprocess_messages(&self, messages: &[Message]) -> Vec<Message> {
        if let Some(ref processor) = self.processor {
            if let Some(processed) = processor.preprocess_messages(messages) {
                return processed;
            }
        }

        let validation = self.validate_messages(messages);
        for warning in &validation.warnings {
            warn!("Message warning: {warning}");
        }

        if !validation.valid {
            if let Some(fixed) = validation.suggested_fixes {
                for fix in &validation.applied_fixes {
                    warn!("Auto-fix: {fix}");
                }
                for error in &validation.errors {
                    warn!("Validation error: {error}");
                }
                return fixed;
            }
            debug!(
                "Sequence invalid with no repair available: {}",
                validation.errors.join("; ")
            );
        }

        messages.to_vec()
    }

    /// Returns the prompt to send in completion mode.
    pub fn preprocess_completion(&self, prompt: &str) -> String {
        self.processor
            .as_ref()
            .and_then(|p| p.preprocess_completion(prompt))
            .unwrap_or_else(|| prompt.to_string())
    }

    // ── Predicates and accessors ─────────────────────────

    /// True only when a chat template is known to exist.
    pub fn can_use_chat(&self) -> bool {
        can_use_chat(&self.read_config())
    }

    /// True unless completion is known to be unsupported.
    pub fn can_use_completion(&self) -> bool {
        can_use_completion(&self.read_config())
    }

    /// Snapshot of the merged configuration.
    pub fn config(&self) -> ModelConfig {
        self.read_config().clone()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.lock_cache().stats()
    }

    pub fn runtime_description(&self) -> String {
        self.runtime.description()
    }

    fn read_config(&self) -> RwLockReadGuard<'_, ModelConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cache(&self) -> MutexGuard<'_, ValidationCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn can_use_chat(config: &ModelConfig) -> bool {
    config
        .capabilities
        .as_ref()
        .and_then(|c| c.has_chat_template)
        .unwrap_or(false)
}

fn can_use_completion(config: &ModelConfig) -> bool {
    config
        .capabilities
        .as_ref()
        .and_then(|c| c.supports_completion)
        .unwrap_or(true)
}

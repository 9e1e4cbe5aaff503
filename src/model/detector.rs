//! Capability Detector.
//!
//! Runs a fixed battery of synthetic message patterns against a
//! [`ModelRuntime`] and folds the outcomes into a capability and
//! restriction estimate. Probes are awaited one after another so their
//! order is deterministic.
//!
//! Detection degrades instead of failing: a failed baseline probe yields a
//! capability-less result, and a failed pattern probe counts as evidence
//! that the runtime rejects that shape. Only a runtime that breaks the
//! response contract makes `detect()` return an error.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{ApiStrategy, DetectedConfig, ModelCapabilities, DEFAULT_RESTRICTION_THRESHOLD};
use crate::chat::inference::pattern;
use crate::chat::{ChatRestrictions, Message, ProbeOutcome, RestrictionInference, RuleTableInference};
use crate::runtime::{ModelRuntime, ProbeError, ProbeOptions};

/// Prompt used to check that the runtime accepts plain completion input.
pub const COMPLETION_PROBE_TEXT: &str = "Complete this text: The capital of Japan is";

/// Primer used by the `with-primer` pattern.
const PROBE_PRIMER: &str = "Sure,";

/// A synthetic message sequence sent during detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPattern {
    pub name: &'static str,
    pub messages: Vec<Message>,
    pub primer: Option<&'static str>,
}

impl TestPattern {
    fn new(name: &'static str, messages: Vec<Message>) -> Self {
        Self {
            name,
            messages,
            primer: None,
        }
    }
}

/// The detection battery, in probe order.
pub fn test_patterns() -> Vec<TestPattern> {
    vec![
        TestPattern::new(pattern::BASIC, vec![Message::user("Hello")]),
        TestPattern::new(
            pattern::WITH_SYSTEM,
            vec![
                Message::system("You are a helpful assistant."),
                Message::user("Hello"),
            ],
        ),
        TestPattern::new(
            pattern::MULTI_SYSTEM,
            vec![
                Message::system("First system message."),
                Message::system("Second system message."),
                Message::user("Hello"),
            ],
        ),
        TestPattern::new(
            pattern::CONSECUTIVE_USER,
            vec![Message::user("First question"), Message::user("Second question")],
        ),
        TestPattern::new(
            pattern::ASSISTANT_LAST,
            vec![Message::user("Hello"), Message::assistant("Hi there!")],
        ),
        TestPattern::new(
            pattern::ALTERNATING,
            vec![
                Message::user("Question 1"),
                Message::assistant("Answer 1"),
                Message::user("Question 2"),
            ],
        ),
        TestPattern {
            primer: Some(PROBE_PRIMER),
            ..TestPattern::new(pattern::WITH_PRIMER, vec![Message::user("Hello")])
        },
        TestPattern::new(pattern::EMPTY_MESSAGE, vec![Message::user("")]),
        TestPattern::new(
            pattern::SYSTEM_IN_MIDDLE,
            vec![
                Message::user("First"),
                Message::system("System in middle"),
                Message::user("Second"),
            ],
        ),
    ]
}

/// Recommends a strategy from what detection found.
pub fn recommend_strategy(
    chat: bool,
    completion: bool,
    restriction_count: usize,
    threshold: usize,
) -> Option<ApiStrategy> {
    match (chat, completion) {
        (true, true) if restriction_count >= threshold => Some(ApiStrategy::PreferCompletion),
        (true, true) => Some(ApiStrategy::Auto),
        (true, false) => Some(ApiStrategy::ForceChat),
        (false, true) => Some(ApiStrategy::ForceCompletion),
        (false, false) => None,
    }
}

pub struct CapabilityDetector {
    model_name: String,
    runtime: Arc<dyn ModelRuntime>,
    inference: Box<dyn RestrictionInference>,
    threshold: usize,
}

impl CapabilityDetector {
    pub fn new(model_name: impl Into<String>, runtime: Arc<dyn ModelRuntime>) -> Self {
        Self {
            model_name: model_name.into(),
            runtime,
            inference: Box::new(RuleTableInference),
            threshold: DEFAULT_RESTRICTION_THRESHOLD,
        }
    }

    /// Replaces the rule table with another inference strategy.
    pub fn with_inference(mut self, inference: Box<dyn RestrictionInference>) -> Self {
        self.inference = inference;
        self
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub async fn detect(&self) -> Result<DetectedConfig, ProbeError> {
        let mut detected = DetectedConfig {
            model_name: self.model_name.clone(),
            ..Default::default()
        };

        info!(
            "Detecting capabilities of {} via {}",
            self.model_name,
            self.runtime.description()
        );

        let baseline = match self.runtime.probe_baseline().await {
            Ok(baseline) => baseline,
            Err(e) if e.is_contract_violation() => return Err(e),
            Err(e) => {
                warn!(
                    "Baseline probe failed for {}: {e}, capabilities stay unknown",
                    self.model_name
                );
                return Ok(detected);
            }
        };

        let restrictions = if baseline.has_chat_template {
            let results = self.run_battery().await?;
            let inferred = self.inference.infer(&results);
            (!inferred.is_empty()).then_some(inferred)
        } else {
            debug!("No chat template, skipping restriction battery");
            None
        };

        let supports_completion = self.test_completion().await?;
        let restriction_count = restrictions.as_ref().map_or(0, ChatRestrictions::defined_count);

        detected.api_strategy = recommend_strategy(
            baseline.has_chat_template,
            supports_completion,
            restriction_count,
            self.threshold,
        );
        detected.capabilities = Some(ModelCapabilities {
            has_chat_template: Some(baseline.has_chat_template),
            supports_completion: Some(supports_completion),
            special_tokens: Some(baseline.special_tokens),
        });
        detected.chat_restrictions = restrictions;

        info!(
            "Detected {}: chat_template={}, completion={}, {} restriction(s), recommended strategy {}",
            self.model_name,
            baseline.has_chat_template,
            supports_completion,
            restriction_count,
            detected
                .api_strategy
                .map_or("none".to_string(), |s| s.to_string()),
        );

        Ok(detected)
    }

    /// Runs every test pattern. A failing pattern never stops the battery.
    async fn run_battery(&self) -> Result<HashMap<String, ProbeOutcome>, ProbeError> {
        let mut results = HashMap::new();

        for test in test_patterns() {
            let options = ProbeOptions {
                primer: test.primer.map(str::to_string),
            };
            let outcome = match self.runtime.probe(&test.messages, &options).await {
                Ok(result) => match result.error {
                    Some(error) => ProbeOutcome::failure(error),
                    None => ProbeOutcome::success(),
                },
                Err(e) if e.is_contract_violation() => return Err(e),
                Err(e) => ProbeOutcome::failure(e.to_string()),
            };
            debug!(
                "Pattern {}: {}",
                test.name,
                if outcome.rejected() { "rejected" } else { "accepted" }
            );
            results.insert(test.name.to_string(), outcome);
        }

        Ok(results)
    }

    async fn test_completion(&self) -> Result<bool, ProbeError> {
        let probe = [Message::user(COMPLETION_PROBE_TEXT)];
        match self.runtime.probe(&probe, &ProbeOptions::default()).await {
            Ok(result) => Ok(!result.applied || result.error.is_none()),
            Err(e) if e.is_contract_violation() => Err(e),
            Err(e) => {
                warn!("Completion probe failed for {}: {e}", self.model_name);
                Ok(false)
            }
        }
    }
}

//! Restriction inference from probe results.
//!
//! Each rule reads the outcome of one or two named test patterns and asserts
//! a restriction when the runtime rejected the corresponding shape. A probe
//! that errored counts as a rejection. A pattern with no recorded outcome
//! never asserts anything.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ChatRestrictions;

/// Names of the test patterns in the detection battery.
pub mod pattern {
    pub const BASIC: &str = "basic";
    pub const WITH_SYSTEM: &str = "with-system";
    pub const MULTI_SYSTEM: &str = "multi-system";
    pub const CONSECUTIVE_USER: &str = "consecutive-user";
    pub const ASSISTANT_LAST: &str = "assistant-last";
    pub const ALTERNATING: &str = "alternating";
    pub const WITH_PRIMER: &str = "with-primer";
    pub const EMPTY_MESSAGE: &str = "empty-message";
    pub const SYSTEM_IN_MIDDLE: &str = "system-in-middle";
}

/// Result of running a single test pattern against the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }

    /// True when the runtime rejected the pattern or the probe itself failed.
    pub fn rejected(&self) -> bool {
        !self.success || self.error.is_some()
    }
}

/// Turns a set of probe outcomes into a restriction estimate.
pub trait RestrictionInference: Send + Sync {
    fn infer(&self, results: &HashMap<String, ProbeOutcome>) -> ChatRestrictions;
}

type Evidence<'a> = &'a HashMap<String, ProbeOutcome>;

struct InferenceRule {
    applies: fn(Evidence<'_>) -> bool,
    assert: fn(&mut ChatRestrictions),
}

fn rejected(results: Evidence<'_>, name: &str) -> bool {
    results.get(name).is_some_and(ProbeOutcome::rejected)
}

fn accepted(results: Evidence<'_>, name: &str) -> bool {
    results.get(name).is_some_and(|o| !o.rejected())
}

const RULES: &[InferenceRule] = &[
    // The system role itself is refused
    InferenceRule {
        applies: |r| rejected(r, pattern::WITH_SYSTEM),
        assert: |c| c.max_system_messages = Some(0),
    },
    InferenceRule {
        applies: |r| accepted(r, pattern::WITH_SYSTEM) && rejected(r, pattern::MULTI_SYSTEM),
        assert: |c| {
            c.single_system_at_start = Some(true);
            c.max_system_messages = Some(1);
        },
    },
    InferenceRule {
        applies: |r| rejected(r, pattern::ASSISTANT_LAST),
        assert: |c| c.requires_user_last = Some(true),
    },
    InferenceRule {
        applies: |r| rejected(r, pattern::CONSECUTIVE_USER),
        assert: |c| c.alternating_turns = Some(true),
    },
    InferenceRule {
        applies: |r| rejected(r, pattern::EMPTY_MESSAGE),
        assert: |c| c.allow_empty_messages = Some(false),
    },
];

/// Deterministic "if pattern X is rejected, assert restriction Y" table.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleTableInference;

impl RestrictionInference for RuleTableInference {
    fn infer(&self, results: &HashMap<String, ProbeOutcome>) -> ChatRestrictions {
        let mut restrictions = ChatRestrictions::default();
        for rule in RULES.iter().filter(|rule| (rule.applies)(results)) {
            (rule.assert)(&mut restrictions);
        }
        restrictions
    }
}

/// Infers restrictions with the default rule table.
pub fn infer_restrictions(results: &HashMap<String, ProbeOutcome>) -> ChatRestrictions {
    RuleTableInference.infer(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(entries: &[(&str, ProbeOutcome)]) -> HashMap<String, ProbeOutcome> {
        entries
            .iter()
            .map(|(name, outcome)| (name.to_string(), outcome.clone()))
            .collect()
    }

    #[test]
    fn test_all_patterns_accepted_yields_no_restrictions() {
        let r = results(&[
            (pattern::BASIC, ProbeOutcome::success()),
            (pattern::WITH_SYSTEM, ProbeOutcome::success()),
            (pattern::MULTI_SYSTEM, ProbeOutcome::success()),
            (pattern::CONSECUTIVE_USER, ProbeOutcome::success()),
            (pattern::ASSISTANT_LAST, ProbeOutcome::success()),
            (pattern::EMPTY_MESSAGE, ProbeOutcome::success()),
        ]);
        assert!(infer_restrictions(&r).is_empty());
    }

    #[test]
    fn test_multi_system_rejected_means_single_system() {
        let r = results(&[
            (pattern::WITH_SYSTEM, ProbeOutcome::success()),
            (
                pattern::MULTI_SYSTEM,
                ProbeOutcome::failure("System message must be at the beginning."),
            ),
        ]);
        let restrictions = infer_restrictions(&r);
        assert_eq!(restrictions.single_system_at_start, Some(true));
        assert_eq!(restrictions.max_system_messages, Some(1));
        assert_eq!(restrictions.defined_count(), 2);
    }

    #[test]
    fn test_multi_system_rejected_without_with_system_evidence() {
        let r = results(&[(pattern::MULTI_SYSTEM, ProbeOutcome::failure("boom"))]);
        assert!(infer_restrictions(&r).is_empty());
    }

    #[test]
    fn test_with_system_rejected_means_no_system_role() {
        let r = results(&[
            (pattern::WITH_SYSTEM, ProbeOutcome::failure("System role not supported")),
            (pattern::MULTI_SYSTEM, ProbeOutcome::failure("System role not supported")),
        ]);
        let restrictions = infer_restrictions(&r);
        assert_eq!(restrictions.max_system_messages, Some(0));
        assert_eq!(restrictions.single_system_at_start, None);
    }

    #[test]
    fn test_turn_rules() {
        let r = results(&[
            (
                pattern::CONSECUTIVE_USER,
                ProbeOutcome::failure("Conversation roles must alternate"),
            ),
            (pattern::ASSISTANT_LAST, ProbeOutcome::failure("must end with user")),
            (pattern::EMPTY_MESSAGE, ProbeOutcome::failure("empty")),
        ]);
        let restrictions = infer_restrictions(&r);
        assert_eq!(restrictions.alternating_turns, Some(true));
        assert_eq!(restrictions.requires_user_last, Some(true));
        assert_eq!(restrictions.allow_empty_messages, Some(false));
    }

    #[test]
    fn test_unsuccessful_without_error_counts_as_rejection() {
        let r = results(&[(
            pattern::ASSISTANT_LAST,
            ProbeOutcome {
                success: false,
                error: None,
            },
        )]);
        assert_eq!(infer_restrictions(&r).requires_user_last, Some(true));
    }
}

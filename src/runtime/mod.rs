//! `ModelRuntime` trait: the only thing this crate needs from a model
//! runtime.
//!
//! A runtime answers two questions: what can it do at all (baseline), and
//! would it accept a given message sequence (probe). Any transport that
//! can answer them works, whether in-process, over a socket, or through a
//! worker's stdio.

pub mod stdio;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::chat::Message;
use crate::model::TokenSpec;

pub use stdio::StdioRuntime;

/// Baseline feature flags reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaselineInfo {
    pub has_chat_template: bool,
    pub special_tokens: BTreeMap<String, TokenSpec>,
}

/// Options for a single probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOptions {
    /// Text the assistant turn is forced to start with.
    pub primer: Option<String>,
}

impl ProbeOptions {
    pub fn with_primer(primer: impl Into<String>) -> Self {
        Self {
            primer: Some(primer.into()),
        }
    }
}

/// How the runtime reacted to a probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    /// Whether a chat template was applied to the messages.
    pub applied: bool,
    /// Error reported by the runtime while formatting, if any.
    pub error: Option<String>,
    /// The prompt the runtime would have generated from.
    pub formatted_prompt: Option<String>,
}

/// Failure talking to a runtime.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("runtime transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("runtime rejected the request: {0}")]
    Rejected(String),

    #[error("malformed runtime response: {0}")]
    Malformed(String),
}

impl ProbeError {
    /// True when the runtime broke the response contract. Such errors are
    /// never read as evidence about the model.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, ProbeError::Malformed(_))
    }
}

/// Abstraction over model runtimes whose chat capabilities are unknown.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Queries chat-template availability and special tokens.
    async fn probe_baseline(&self) -> Result<BaselineInfo, ProbeError>;

    /// Asks the runtime to format `messages` the way it would for a real
    /// request, without generating anything.
    async fn probe(
        &self,
        messages: &[Message],
        options: &ProbeOptions,
    ) -> Result<ProbeResult, ProbeError>;

    /// Human-readable description of the runtime.
    fn description(&self) -> String;
}

/// Runtime with no connection. Every probe fails with a transport error,
/// so detection leaves capabilities unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disconnected;

impl Disconnected {
    fn not_connected() -> ProbeError {
        ProbeError::Transport(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "no runtime configured",
        ))
    }
}

#[async_trait]
impl ModelRuntime for Disconnected {
    async fn probe_baseline(&self) -> Result<BaselineInfo, ProbeError> {
        Err(Self::not_connected())
    }

    async fn probe(
        &self,
        _messages: &[Message],
        _options: &ProbeOptions,
    ) -> Result<ProbeResult, ProbeError> {
        Err(Self::not_connected())
    }

    fn description(&self) -> String {
        "disconnected".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time verification that `ModelRuntime` is object-safe.
    #[test]
    fn test_model_runtime_is_object_safe() {
        fn _assert_object_safe(_: &dyn ModelRuntime) {}
    }

    #[test]
    fn test_only_malformed_is_contract_violation() {
        assert!(ProbeError::Malformed("not json".into()).is_contract_violation());
        assert!(!ProbeError::Rejected("no".into()).is_contract_violation());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed");
        assert!(!ProbeError::from(io).is_contract_violation());
    }

    #[test]
    fn test_probe_options_with_primer() {
        assert_eq!(
            ProbeOptions::with_primer("Sure,").primer.as_deref(),
            Some("Sure,")
        );
        assert!(ProbeOptions::default().primer.is_none());
    }

    #[tokio::test]
    async fn test_disconnected_fails_with_transport() {
        let err = Disconnected.probe_baseline().await.unwrap_err();
        assert!(matches!(err, ProbeError::Transport(_)));
        let err = Disconnected
            .probe(&[Message::user("Hello")], &ProbeOptions::default())
            .await
            .unwrap_err();
        assert!(!err.is_contract_violation());
    }
}

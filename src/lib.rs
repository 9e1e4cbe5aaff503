//! Capability negotiation and invocation-mode selection for model runtimes
//! whose chat-template behavior is not known in advance.

pub mod chat;
pub mod config;
pub mod model;
pub mod runtime;

pub use chat::{validate, ChatRestrictions, Message, Role, ValidationResult};
pub use model::{
    ApiStrategy, CapabilityDetector, CustomProcessor, InvocationMode, ModelCapabilities,
    ModelConfig, ModelConfigManager, ModelOverride,
};
pub use runtime::{ModelRuntime, ProbeError};

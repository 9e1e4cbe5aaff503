use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mode_negotiator::config::Config;
use mode_negotiator::model::cache::CacheStats;
use mode_negotiator::runtime::{Disconnected, StdioRuntime};
use mode_negotiator::{InvocationMode, Message, ModelConfig, ModelConfigManager, ModelRuntime, ValidationResult};

fn print_help() {
    println!(
        "\
mode-negotiator v{}

Detects what a model runtime's chat template accepts and decides whether a
conversation should be sent as chat turns or as a raw completion prompt.

USAGE:
    mode-negotiator [OPTIONS] [CONFIG_PATH] [MESSAGES_PATH]

ARGUMENTS:
    CONFIG_PATH      Path to TOML configuration file [default: config/negotiator.toml]
    MESSAGES_PATH    JSON array of {{\"role\", \"content\"}} messages to evaluate

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG         Log level filter for tracing
                     (e.g. debug, mode_negotiator=debug,warn)

EXAMPLES:
    mode-negotiator                                   # uses config/negotiator.toml
    mode-negotiator model.toml conversation.json      # evaluate a conversation
    RUST_LOG=debug mode-negotiator model.toml         # with probe-level logging",
        env!("CARGO_PKG_VERSION"),
    );
}

/// What gets printed for one run.
#[derive(Serialize)]
struct Report {
    runtime: String,
    initialized: bool,
    config: ModelConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    evaluation: Option<Evaluation>,
}

#[derive(Serialize)]
struct Evaluation {
    validation: ValidationResult,
    mode: InvocationMode,
    /// What would actually be sent in chat mode
    prepared_messages: Vec<Message>,
    cache: CacheStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut positional = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("mode-negotiator v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => positional.push(arg),
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mode_negotiator=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut positional = positional.into_iter();
    let config_path = positional
        .next()
        .unwrap_or_else(|| "config/negotiator.toml".to_string());
    let messages_path = positional.next();

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load {config_path}"))?;

    let runtime = connect_runtime(&config).await;
    let manager = ModelConfigManager::new(
        &config.model.name,
        runtime,
        Some(config.model_override()),
        None,
    )
    .with_cache_capacity(config.validation.cache_capacity)
    .with_restriction_threshold(config.validation.restriction_threshold);

    manager.initialize().await?;

    let evaluation = match messages_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {path}"))?;
            let messages: Vec<Message> = serde_json::from_str(&content)
                .with_context(|| format!("{path} is not a JSON message array"))?;

            let validation = manager.validate_messages(&messages);
            let mode = manager.determine_api(&messages);
            let prepared_messages = manager.preprocess_messages(&messages);
            info!("{} message(s) from {path} go through {mode}", messages.len());

            Some(Evaluation {
                validation,
                mode,
                prepared_messages,
                cache: manager.cache_stats(),
            })
        }
        None => None,
    };

    let report = Report {
        runtime: manager.runtime_description(),
        initialized: manager.is_initialized(),
        config: manager.config(),
        evaluation,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

/// Connects to the runtime bridge if one is configured. A bridge that
/// cannot be reached leaves capabilities to presets and config.
async fn connect_runtime(config: &Config) -> Arc<dyn ModelRuntime> {
    let Some(ref address) = config.runtime.address else {
        info!("No runtime address configured, skipping detection probes");
        return Arc::new(Disconnected);
    };

    match TcpStream::connect(address.as_str()).await {
        Ok(stream) => {
            info!("Connected to runtime bridge at {address}");
            let (reader, writer) = stream.into_split();
            Arc::new(StdioRuntime::new(address.clone(), reader, writer))
        }
        Err(e) => {
            warn!("Cannot reach runtime bridge at {address}: {e}");
            Arc::new(Disconnected)
        }
    }
}

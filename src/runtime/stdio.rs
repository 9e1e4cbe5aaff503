//! Framed JSON runtime adapter.
//!
//! Talks to a model-runtime worker over any pair of async byte streams
//! (child stdio, a TCP bridge, an in-memory duplex in tests). Requests are
//! JSON objects tagged by `method` and terminated by a newline; every
//! response is one JSON document terminated by a single NUL byte.
//!
//! Supported methods:
//! - `capabilities` → `{methods, special_tokens, features}`
//! - `format_test` → `{formatted_prompt, template_applied, error}`
//!
//! The worker answers requests it cannot parse with a bare newline, which
//! this adapter reports as [`ProbeError::Malformed`], as is a response
//! frame longer than the configured limit.
//!
//! A worker whose `methods` list leaves out `format_test` cannot be probed,
//! so its baseline is reported as [`ProbeError::Rejected`] and detection
//! leaves capabilities unknown.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

use super::{BaselineInfo, ModelRuntime, ProbeError, ProbeOptions, ProbeResult};
use crate::chat::Message;
use crate::model::TokenSpec;

/// Response frame terminator.
const FRAME_END: u8 = 0;

/// Default cap on one response frame, terminator included.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Worker method used for probes.
const FORMAT_TEST_METHOD: &str = "format_test";

// ── Worker request types ─────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
enum WorkerRequest<'a> {
    Capabilities,
    FormatTest {
        messages: &'a [Message],
        options: FormatOptions<'a>,
    },
}

#[derive(Debug, Serialize)]
struct FormatOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    primer: Option<&'a str>,
}

// ── Worker response types ────────────────────────────────

/// `capabilities` response.
#[derive(Debug, Deserialize)]
struct CapabilitiesResponse {
    /// Absent when the worker does not list its methods.
    #[serde(default)]
    methods: Option<Vec<String>>,
    #[serde(default)]
    special_tokens: BTreeMap<String, TokenSpec>,
    #[serde(default)]
    features: Features,
}

#[derive(Debug, Default, Deserialize)]
struct Features {
    #[serde(default)]
    apply_chat_template: bool,
    #[serde(default)]
    chat_template: Option<ChatTemplateInfo>,
}

#[derive(Debug, Deserialize)]
struct ChatTemplateInfo {
    #[serde(default)]
    template_string: Option<String>,
    #[serde(default)]
    supported_roles: Vec<String>,
}

/// `format_test` response.
#[derive(Debug, Deserialize)]
struct FormatTestResponse {
    #[serde(default)]
    formatted_prompt: Option<String>,
    #[serde(default)]
    template_applied: bool,
    #[serde(default)]
    error: Option<String>,
}

impl CapabilitiesResponse {
    /// A chat template is usable only when the tokenizer can apply one and
    /// actually carries a template string.
    fn has_chat_template(&self) -> bool {
        self.features.apply_chat_template
            && self
                .features
                .chat_template
                .as_ref()
                .is_some_and(|t| t.template_string.is_some())
    }
}

// ── StdioRuntime ─────────────────────────────────────────

struct Channel<R, W> {
    reader: BufReader<R>,
    writer: W,
}

/// Runtime adapter over a framed JSON byte stream.
pub struct StdioRuntime<R, W> {
    name: String,
    channel: Mutex<Channel<R, W>>,
    max_frame: usize,
    /// Methods advertised by the last `capabilities` answer.
    methods: std::sync::Mutex<Option<Vec<String>>>,
}

impl<R, W> StdioRuntime<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(name: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            name: name.into(),
            channel: Mutex::new(Channel {
                reader: BufReader::new(reader),
                writer,
            }),
            methods: std::sync::Mutex::new(None),
            max_frame: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Caps the size of one response frame.
    pub fn with_max_frame(mut self, bytes: usize) -> Self {
        self.max_frame = bytes.max(1);
        self
    }

    /// Sends one request and reads back exactly one response frame.
    async fn call<T: DeserializeOwned>(&self, request: &WorkerRequest<'_>) -> Result<T, ProbeError> {
        let mut payload = serde_json::to_vec(request).map_err(std::io::Error::from)?;
        payload.push(b'\n');

        let mut channel = self.channel.lock().await;
        channel.writer.write_all(&payload).await?;
        channel.writer.flush().await?;

        let mut frame = Vec::new();
        let read = (&mut channel.reader)
            .take(self.max_frame as u64)
            .read_until(FRAME_END, &mut frame)
            .await?;
        if read == 0 {
            return Err(ProbeError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "runtime closed the stream",
            )));
        }
        if frame.last() == Some(&FRAME_END) {
            frame.pop();
        } else if read >= self.max_frame {
            return Err(ProbeError::Malformed(format!(
                "response frame from {} exceeds {} bytes",
                self.name, self.max_frame
            )));
        }

        serde_json::from_slice(&frame).map_err(|e| {
            ProbeError::Malformed(format!(
                "{e} (got {:?})",
                String::from_utf8_lossy(&frame).trim()
            ))
        })
    }

    fn advertises(&self, method: &str) -> Option<bool> {
        let methods = self
            .methods
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        methods.as_ref().map(|m| m.iter().any(|name| name == method))
    }
}

#[async_trait]
impl<R, W> ModelRuntime for StdioRuntime<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn probe_baseline(&self) -> Result<BaselineInfo, ProbeError> {
        let resp: CapabilitiesResponse = self.call(&WorkerRequest::Capabilities).await?;

        if let Some(ref template) = resp.features.chat_template {
            debug!(
                "Runtime {} chat template roles: {}",
                self.name,
                template.supported_roles.join(", ")
            );
        }

        let has_chat_template = resp.has_chat_template();
        let probeable = resp
            .methods
            .as_ref()
            .map_or(true, |m| m.iter().any(|name| name == FORMAT_TEST_METHOD));
        *self
            .methods
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = resp.methods;

        if !probeable {
            return Err(ProbeError::Rejected(format!(
                "runtime {} does not advertise {FORMAT_TEST_METHOD}",
                self.name
            )));
        }

        Ok(BaselineInfo {
            has_chat_template,
            special_tokens: resp.special_tokens,
        })
    }

    async fn probe(
        &self,
        messages: &[Message],
        options: &ProbeOptions,
    ) -> Result<ProbeResult, ProbeError> {
        if self.advertises(FORMAT_TEST_METHOD) == Some(false) {
            return Err(ProbeError::Rejected(format!(
                "runtime {} does not advertise {FORMAT_TEST_METHOD}",
                self.name
            )));
        }

        let request = WorkerRequest::FormatTest {
            messages,
            options: FormatOptions {
                primer: options.primer.as_deref(),
            },
        };
        let resp: FormatTestResponse = self.call(&request).await?;

        if let Some(ref error) = resp.error {
            debug!(
                "Runtime {} refused to format {} message(s): {error}",
                self.name,
                messages.len()
            );
        }

        Ok(ProbeResult {
            applied: resp.template_applied,
            error: resp.error,
            formatted_prompt: resp.formatted_prompt,
        })
    }

    fn description(&self) -> String {
        format!("stdio ({})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream, ReadHalf, WriteHalf};

    type TestRuntime = StdioRuntime<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    /// Spawns a fake worker that answers each request line with the next
    /// canned reply, and returns a runtime connected to it plus a handle
    /// yielding every request it received.
    fn fake_worker(replies: Vec<&'static str>) -> (TestRuntime, tokio::task::JoinHandle<Vec<serde_json::Value>>) {
        let (client, server) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, mut server_write) = tokio::io::split(server);

        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(server_read);
            let mut seen = Vec::new();
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                seen.push(serde_json::from_str(&line).unwrap());
                server_write.write_all(reply.as_bytes()).await.unwrap();
                server_write.write_all(&[FRAME_END]).await.unwrap();
                server_write.flush().await.unwrap();
            }
            seen
        });

        (StdioRuntime::new("fake", client_read, client_write), handle)
    }

    const CAPABILITIES_WITH_TEMPLATE: &str = r#"{
        "methods": ["capabilities", "completion", "format_test", "chat"],
        "special_tokens": {
            "eod": {"text": "</s>", "id": 2},
            "system": {
                "start": {"text": "<|system|>", "id": 151645},
                "end": {"text": "<|/system|>", "id": 151647}
            }
        },
        "features": {
            "apply_chat_template": true,
            "vocab_size": 151936,
            "model_max_length": 8192,
            "chat_template": {
                "template_string": "{% for m in messages %}{{ m.content }}{% endfor %}",
                "supported_roles": ["system", "user", "assistant"],
                "preview": "..."
            }
        }
    }"#;

    // ── probe_baseline ───────────────────────────────────

    #[tokio::test]
    async fn test_baseline_with_template() {
        let (runtime, worker) = fake_worker(vec![CAPABILITIES_WITH_TEMPLATE]);
        let info = runtime.probe_baseline().await.unwrap();
        assert!(info.has_chat_template);
        assert_eq!(info.special_tokens.len(), 2);
        assert!(matches!(
            info.special_tokens.get("eod"),
            Some(TokenSpec::Single { id: 2, .. })
        ));
        assert!(matches!(
            info.special_tokens.get("system"),
            Some(TokenSpec::Pair { .. })
        ));

        let seen = worker.await.unwrap();
        assert_eq!(seen[0], serde_json::json!({"method": "capabilities"}));
    }

    #[tokio::test]
    async fn test_baseline_without_template_string() {
        let (runtime, _worker) = fake_worker(vec![
            r#"{"methods": ["capabilities", "completion", "format_test", "chat"],
                "special_tokens": {},
                "features": {"apply_chat_template": true,
                             "chat_template": {"template_string": null, "supported_roles": []}}}"#,
        ]);
        let info = runtime.probe_baseline().await.unwrap();
        assert!(!info.has_chat_template);
    }

    #[tokio::test]
    async fn test_baseline_malformed_response() {
        let (runtime, _worker) = fake_worker(vec!["\n"]);
        let err = runtime.probe_baseline().await.unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[tokio::test]
    async fn test_closed_stream_is_transport_error() {
        let (client, server) = duplex(1024);
        drop(server);
        let (r, w) = tokio::io::split(client);
        let runtime = StdioRuntime::new("gone", r, w);
        let err = runtime.probe_baseline().await.unwrap_err();
        assert!(matches!(err, ProbeError::Transport(_)));
        assert!(!err.is_contract_violation());
    }

    // ── probe ────────────────────────────────────────────

    #[tokio::test]
    async fn test_probe_sends_messages_and_primer() {
        let (runtime, worker) = fake_worker(vec![
            r#"{"formatted_prompt": "<user>Hello</user><assistant>Sure,", "template_applied": true,
                "model_specific_processing": null, "error": null}"#,
        ]);
        let result = runtime
            .probe(&[Message::user("Hello")], &ProbeOptions::with_primer("Sure,"))
            .await
            .unwrap();
        assert!(result.applied);
        assert!(result.error.is_none());
        assert!(result.formatted_prompt.unwrap().ends_with("Sure,"));

        let seen = worker.await.unwrap();
        assert_eq!(seen[0]["method"], "format_test");
        assert_eq!(seen[0]["messages"][0]["role"], "user");
        assert_eq!(seen[0]["options"]["primer"], "Sure,");
    }

    #[tokio::test]
    async fn test_probe_reports_template_error() {
        let (runtime, _worker) = fake_worker(vec![
            r#"{"formatted_prompt": null, "template_applied": false,
                "error": "Conversation roles must alternate user/assistant/user/assistant/..."}"#,
        ]);
        let result = runtime
            .probe(
                &[Message::user("First"), Message::user("Second")],
                &ProbeOptions::default(),
            )
            .await
            .unwrap();
        assert!(!result.applied);
        assert!(result.error.unwrap().contains("alternate"));
    }

    #[tokio::test]
    async fn test_baseline_rejected_when_format_test_not_advertised() {
        let (runtime, _worker) = fake_worker(vec![
            r#"{"methods": ["capabilities", "completion"], "special_tokens": {},
                "features": {"apply_chat_template": true,
                             "chat_template": {"template_string": "{{ messages }}"}}}"#,
        ]);
        let err = runtime.probe_baseline().await.unwrap_err();
        assert!(matches!(err, ProbeError::Rejected(_)));
        assert!(!err.is_contract_violation());

        // Later probes are refused without touching the stream
        let err = runtime
            .probe(&[Message::user("Hello")], &ProbeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_request_is_newline_terminated() {
        let (client, mut server) = duplex(1024);
        let (r, w) = tokio::io::split(client);
        let runtime = StdioRuntime::new("raw", r, w);

        let call = tokio::spawn(async move { runtime.probe_baseline().await });

        let mut buf = vec![0u8; 1024];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"method\":\"capabilities\"}\n");

        server
            .write_all(b"{\"features\":{}}\0")
            .await
            .unwrap();
        let info = call.await.unwrap().unwrap();
        assert!(!info.has_chat_template);
    }

    #[test]
    fn test_description() {
        let (client, _server) = duplex(16);
        let (r, w) = tokio::io::split(client);
        let runtime = StdioRuntime::new("mlx-community/Qwen3-0.6B", r, w);
        assert_eq!(runtime.description(), "stdio (mlx-community/Qwen3-0.6B)");
    }

    #[tokio::test]
    async fn test_unterminated_oversized_frame_is_malformed() {
        let (client, mut server) = duplex(1024);
        let (r, w) = tokio::io::split(client);
        let runtime = StdioRuntime::new("runaway", r, w).with_max_frame(32);

        let call = tokio::spawn(async move { runtime.probe_baseline().await });

        let mut buf = vec![0u8; 1024];
        server.read(&mut buf).await.unwrap();
        server.write_all(&[b'x'; 64]).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_contract_violation());
        assert!(err.to_string().contains("exceeds 32 bytes"));
    }

    #[tokio::test]
    async fn test_frame_at_limit_is_accepted() {
        let reply = br#"{"features":{}}"#;
        let (client, mut server) = duplex(1024);
        let (r, w) = tokio::io::split(client);
        let runtime = StdioRuntime::new("tight", r, w).with_max_frame(reply.len() + 1);

        let call = tokio::spawn(async move { runtime.probe_baseline().await });

        let mut buf = vec![0u8; 1024];
        server.read(&mut buf).await.unwrap();
        server.write_all(reply).await.unwrap();
        server.write_all(&[FRAME_END]).await.unwrap();

        assert!(call.await.unwrap().is_ok());
    }
}

//! Engine-Adapter Registry: polymorphic dispatch over agent CLI variants.
//!
//! One adapter per CLI variant (`{Codex, ClaudeCode, OpenCode}`). Modeled as a
//! tagged variant plus a capability table rather than deep inheritance, the
//! way the teacher's `LLMProvider` trait + `LLMProviderFactory` dispatch over
//! provider types.

mod claude_code;
mod codex;
mod opencode;

use crate::model::{AdapterTag, TokenUsage};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub use claude_code::ClaudeCodeAdapter;
pub use codex::CodexAdapter;
pub use opencode::OpenCodeAdapter;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown adapter tag: {0}")]
    UnknownAdapter(String),
    #[error("adapter does not support streaming")]
    StreamingUnsupported,
    #[error("failed to parse adapter output: {0}")]
    ParseError(String),
}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// Everything a resolved Agent contributes to a single invocation, plus the
/// per-request overrides an ExecRequest may carry.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub base_url_override: Option<String>,
    pub system_prompt: Option<String>,
    pub approval_policy: Option<String>,
    pub sandbox_mode: Option<String>,
    pub full_auto: bool,
    pub skip_all: bool,
    pub thread_id: Option<String>,
    pub env: HashMap<String, String>,
}

/// The rendered argv/env/stdin an adapter produces for `ContainerDriver::exec`.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub stdin: Option<String>,
    pub working_dir: Option<String>,
}

/// What `ParseOutput` extracts from a completed, non-streaming Exec.
#[derive(Debug, Clone, Default)]
pub struct ParsedOutput {
    pub message: Option<String>,
    pub thread_id: Option<String>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

/// One event from a streaming Exec, as consumed by the Session Manager's
/// `ExecStream` and republished on the Event Bus.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Connected,
    Message(String),
    ToolCall { name: String, detail: String },
    Error(String),
    Done,
}

#[derive(Debug, Clone, Copy)]
pub enum StreamingFormat {
    None,
    NdjsonV1,
}

#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub supports_resume: bool,
    pub supports_streaming: bool,
    pub streaming_format: StreamingFormat,
}

/// One adapter per CLI variant.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn tag(&self) -> AdapterTag;
    fn capabilities(&self) -> Capabilities;

    /// Renders the prompt and all flags into an argv/env/stdin/working-dir.
    /// The system prompt is prepended to the user prompt unless the adapter
    /// supports a native system-prompt flag.
    fn build_invocation(&self, req: &ExecRequest) -> Invocation;

    /// Finds the final assistant message and, where the CLI emits structured
    /// metadata, extracts the thread ID and token usage.
    fn parse_output(&self, stdout: &str, stderr: &str, exit_code: Option<i64>) -> ParsedOutput;

    /// Parses one line of a streaming CLI's NDJSON-ish output into an event.
    /// Only meaningful when `capabilities().supports_streaming`.
    fn parse_event(&self, line: &str) -> Result<AdapterEvent>;
}

/// Startup-time registry mapping adapter tag to implementation. Refuses to
/// resolve an Agent whose adapter tag is unregistered.
pub struct AdapterRegistry {
    adapters: HashMap<AdapterTag, std::sync::Arc<dyn EngineAdapter>>,
}

impl AdapterRegistry {
    /// The default registry: Codex, ClaudeCode, OpenCode all registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };
        registry.register(std::sync::Arc::new(CodexAdapter));
        registry.register(std::sync::Arc::new(ClaudeCodeAdapter));
        registry.register(std::sync::Arc::new(OpenCodeAdapter));
        registry
    }

    pub fn register(&mut self, adapter: std::sync::Arc<dyn EngineAdapter>) {
        self.adapters.insert(adapter.tag(), adapter);
    }

    pub fn get(&self, tag: AdapterTag) -> Result<std::sync::Arc<dyn EngineAdapter>> {
        self.adapters
            .get(&tag)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownAdapter(tag.to_string()))
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_all_builtin_tags() {
        let registry = AdapterRegistry::with_defaults();
        assert!(registry.get(AdapterTag::Codex).is_ok());
        assert!(registry.get(AdapterTag::ClaudeCode).is_ok());
        assert!(registry.get(AdapterTag::OpenCode).is_ok());
    }
}

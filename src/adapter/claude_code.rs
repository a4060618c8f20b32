//! Adapter for the Claude Code headless CLI (`claude --print ...`).
//!
//! Invocation shape grounded in the teacher's `ClaudeCodeInterface`: it
//! shells out to `claude` with `--print --output-format json`, an
//! `--allowedTools` allowlist, `--permission-mode`, an optional
//! `--append-system-prompt`, model selection, and a trailing `--` prompt.

use super::{
    AdapterEvent, AdapterError, Capabilities, EngineAdapter, ExecRequest, Invocation,
    ParsedOutput, Result, StreamingFormat,
};
use crate::model::{AdapterTag, TokenUsage};
use serde::Deserialize;

const ALLOWED_TOOLS: &str = "Read,Write,Edit,Bash,Grep,Glob";

pub struct ClaudeCodeAdapter;

#[derive(Deserialize)]
struct ClaudeJsonResult {
    result: Option<String>,
    session_id: Option<String>,
    is_error: Option<bool>,
    #[serde(default)]
    usage: Option<ClaudeUsage>,
}

#[derive(Deserialize)]
struct ClaudeUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeStreamEvent {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "assistant")]
    Assistant { message: ClaudeAssistantMessage },
    #[serde(rename = "result")]
    Result { result: Option<String> },
}

#[derive(Deserialize)]
struct ClaudeAssistantMessage {
    content: Vec<ClaudeContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeContentBlock {
    Text { text: String },
    ToolUse { name: String, #[serde(default)] input: serde_json::Value },
    #[serde(other)]
    Other,
}

#[async_trait::async_trait]
impl EngineAdapter for ClaudeCodeAdapter {
    fn tag(&self) -> AdapterTag {
        AdapterTag::ClaudeCode
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_resume: true,
            supports_streaming: true,
            streaming_format: StreamingFormat::NdjsonV1,
        }
    }

    fn build_invocation(&self, req: &ExecRequest) -> Invocation {
        let mut argv = vec!["claude".to_string(), "--print".to_string()];
        argv.push("--output-format".to_string());
        argv.push("json".to_string());
        argv.push("--allowedTools".to_string());
        argv.push(ALLOWED_TOOLS.to_string());

        let permission_mode = if req.skip_all {
            "bypassPermissions"
        } else if req.full_auto {
            "acceptEdits"
        } else {
            req.approval_policy.as_deref().unwrap_or("default")
        };
        argv.push("--permission-mode".to_string());
        argv.push(permission_mode.to_string());

        // Claude Code has no native system-prompt flag for the print mode
        // other than --append-system-prompt, which is used here.
        if let Some(system_prompt) = &req.system_prompt {
            argv.push("--append-system-prompt".to_string());
            argv.push(system_prompt.clone());
        }

        if let Some(model) = &req.model {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }

        if let Some(thread_id) = &req.thread_id {
            argv.push("--resume".to_string());
            argv.push(thread_id.clone());
        }

        argv.push("--".to_string());
        argv.push(req.prompt.clone());

        let mut env = req.env.clone();
        if let Some(base_url) = &req.base_url_override {
            env.insert("ANTHROPIC_BASE_URL".to_string(), base_url.clone());
        }

        Invocation {
            argv,
            env,
            stdin: None,
            working_dir: Some("/workspace".to_string()),
        }
    }

    fn parse_output(&self, stdout: &str, _stderr: &str, exit_code: Option<i64>) -> ParsedOutput {
        match serde_json::from_str::<ClaudeJsonResult>(stdout.trim()) {
            Ok(parsed) => ParsedOutput {
                message: parsed.result,
                thread_id: parsed.session_id,
                usage: parsed.usage.map(|u| TokenUsage {
                    input_tokens: u.input_tokens.unwrap_or(0),
                    output_tokens: u.output_tokens.unwrap_or(0),
                }),
                error: if parsed.is_error.unwrap_or(false) {
                    Some("claude reported is_error=true".to_string())
                } else {
                    None
                },
            },
            Err(_) if exit_code == Some(0) => ParsedOutput {
                message: Some(stdout.trim().to_string()),
                ..Default::default()
            },
            Err(e) => ParsedOutput {
                error: Some(format!("failed to parse claude output: {e}")),
                ..Default::default()
            },
        }
    }

    fn parse_event(&self, line: &str) -> Result<AdapterEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(AdapterEvent::Connected);
        }
        let event: ClaudeStreamEvent = serde_json::from_str(line)
            .map_err(|e| AdapterError::ParseError(format!("{e}: {line}")))?;
        Ok(match event {
            ClaudeStreamEvent::System => AdapterEvent::Connected,
            ClaudeStreamEvent::Assistant { message } => {
                let mut text = String::new();
                let mut tool_call = None;
                for block in message.content {
                    match block {
                        ClaudeContentBlock::Text { text: t } => text.push_str(&t),
                        ClaudeContentBlock::ToolUse { name, input } => {
                            tool_call = Some((name, input));
                        }
                        ClaudeContentBlock::Other => {}
                    }
                }
                if let Some((name, input)) = tool_call {
                    AdapterEvent::ToolCall {
                        name,
                        detail: input.to_string(),
                    }
                } else {
                    AdapterEvent::Message(text)
                }
            }
            ClaudeStreamEvent::Result { .. } => AdapterEvent::Done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn req() -> ExecRequest {
        ExecRequest {
            prompt: "What is 2+3?".to_string(),
            model: Some("sonnet".to_string()),
            base_url_override: None,
            system_prompt: Some("Reply in English.".to_string()),
            approval_policy: None,
            sandbox_mode: None,
            full_auto: true,
            skip_all: false,
            thread_id: None,
            env: HashMap::new(),
        }
    }

    #[test]
    fn build_invocation_includes_model_and_system_prompt() {
        let adapter = ClaudeCodeAdapter;
        let invocation = adapter.build_invocation(&req());
        assert!(invocation.argv.contains(&"sonnet".to_string()));
        assert!(invocation.argv.contains(&"--append-system-prompt".to_string()));
        assert!(invocation.argv.contains(&"acceptEdits".to_string()));
        assert_eq!(invocation.argv.last(), Some(&"What is 2+3?".to_string()));
    }

    #[test]
    fn build_invocation_passes_resume_thread() {
        let adapter = ClaudeCodeAdapter;
        let mut r = req();
        r.thread_id = Some("thread-123".to_string());
        let invocation = adapter.build_invocation(&r);
        let idx = invocation.argv.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(invocation.argv[idx + 1], "thread-123");
    }

    #[test]
    fn parse_output_extracts_message_and_thread_id() {
        let adapter = ClaudeCodeAdapter;
        let stdout = r#"{"result":"5","session_id":"abc","usage":{"input_tokens":10,"output_tokens":2}}"#;
        let parsed = adapter.parse_output(stdout, "", Some(0));
        assert_eq!(parsed.message.as_deref(), Some("5"));
        assert_eq!(parsed.thread_id.as_deref(), Some("abc"));
        assert_eq!(parsed.usage.unwrap().input_tokens, 10);
    }

    #[test]
    fn parse_event_assistant_text() {
        let adapter = ClaudeCodeAdapter;
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#;
        match adapter.parse_event(line).unwrap() {
            AdapterEvent::Message(m) => assert_eq!(m, "hi"),
            other => panic!("expected Message, got {other:?}"),
        }
    }
}

//! Adapter for the OpenCode headless CLI (`opencode run ...`).
//!
//! No teacher precedent exists for this CLI's exact flags, so the shape
//! mirrors the other two adapters: non-interactive `run` subcommand, a
//! `--model provider/model` override, and permission flags expressed through
//! OpenCode's agent-permission config rather than a single approval policy.

use super::{
    AdapterEvent, AdapterError, Capabilities, EngineAdapter, ExecRequest, Invocation,
    ParsedOutput, Result, StreamingFormat,
};
use crate::model::AdapterTag;
use serde::Deserialize;

pub struct OpenCodeAdapter;

#[derive(Deserialize)]
struct OpenCodeResult {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenCodeEvent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool")]
    Tool { tool: String, #[serde(default)] args: serde_json::Value },
    #[serde(rename = "done")]
    Done,
    #[serde(other)]
    Other,
}

#[async_trait::async_trait]
impl EngineAdapter for OpenCodeAdapter {
    fn tag(&self) -> AdapterTag {
        AdapterTag::OpenCode
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_resume: true,
            supports_streaming: true,
            streaming_format: StreamingFormat::NdjsonV1,
        }
    }

    fn build_invocation(&self, req: &ExecRequest) -> Invocation {
        let mut argv = vec![
            "opencode".to_string(),
            "run".to_string(),
            "--format".to_string(),
            "json".to_string(),
        ];

        if req.skip_all || req.full_auto {
            argv.push("--permission".to_string());
            argv.push("allow-all".to_string());
        } else if let Some(policy) = &req.approval_policy {
            argv.push("--permission".to_string());
            argv.push(policy.clone());
        }

        if let Some(model) = &req.model {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }

        if let Some(thread_id) = &req.thread_id {
            argv.push("--session".to_string());
            argv.push(thread_id.clone());
        }

        let mut env = req.env.clone();
        if let Some(base_url) = &req.base_url_override {
            env.insert("OPENCODE_BASE_URL".to_string(), base_url.clone());
        }

        let prompt = match &req.system_prompt {
            Some(sys) => format!("{sys}\n\n{}", req.prompt),
            None => req.prompt.clone(),
        };
        argv.push(prompt);

        Invocation {
            argv,
            env,
            stdin: None,
            working_dir: Some("/workspace".to_string()),
        }
    }

    fn parse_output(&self, stdout: &str, _stderr: &str, exit_code: Option<i64>) -> ParsedOutput {
        match serde_json::from_str::<OpenCodeResult>(stdout.trim()) {
            Ok(parsed) => ParsedOutput {
                message: parsed.text,
                thread_id: parsed.session_id,
                usage: None,
                error: None,
            },
            Err(_) if exit_code == Some(0) => ParsedOutput {
                message: Some(stdout.trim().to_string()),
                ..Default::default()
            },
            Err(e) => ParsedOutput {
                error: Some(format!("failed to parse opencode output: {e}")),
                ..Default::default()
            },
        }
    }

    fn parse_event(&self, line: &str) -> Result<AdapterEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(AdapterEvent::Connected);
        }
        let event: OpenCodeEvent = serde_json::from_str(line)
            .map_err(|e| AdapterError::ParseError(format!("{e}: {line}")))?;
        Ok(match event {
            OpenCodeEvent::Text { text } => AdapterEvent::Message(text),
            OpenCodeEvent::Tool { tool, args } => AdapterEvent::ToolCall {
                name: tool,
                detail: args.to_string(),
            },
            OpenCodeEvent::Done => AdapterEvent::Done,
            OpenCodeEvent::Other => AdapterEvent::Connected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn req() -> ExecRequest {
        ExecRequest {
            prompt: "Summarize README".to_string(),
            model: Some("anthropic/claude-sonnet".to_string()),
            base_url_override: None,
            system_prompt: None,
            approval_policy: None,
            sandbox_mode: None,
            full_auto: false,
            skip_all: false,
            thread_id: Some("sess-1".to_string()),
            env: HashMap::new(),
        }
    }

    #[test]
    fn build_invocation_passes_model_and_session() {
        let adapter = OpenCodeAdapter;
        let invocation = adapter.build_invocation(&req());
        assert!(invocation.argv.contains(&"anthropic/claude-sonnet".to_string()));
        let idx = invocation.argv.iter().position(|a| a == "--session").unwrap();
        assert_eq!(invocation.argv[idx + 1], "sess-1");
    }

    #[test]
    fn full_auto_allows_all_permissions() {
        let adapter = OpenCodeAdapter;
        let mut r = req();
        r.full_auto = true;
        let invocation = adapter.build_invocation(&r);
        assert!(invocation.argv.contains(&"allow-all".to_string()));
    }

    #[test]
    fn parse_output_extracts_text_and_session() {
        let adapter = OpenCodeAdapter;
        let stdout = r#"{"text":"result text","session_id":"sess-2"}"#;
        let parsed = adapter.parse_output(stdout, "", Some(0));
        assert_eq!(parsed.message.as_deref(), Some("result text"));
        assert_eq!(parsed.thread_id.as_deref(), Some("sess-2"));
    }
}

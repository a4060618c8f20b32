//! Adapter for the Codex headless CLI (`codex exec ...`).
//!
//! Codex's non-interactive mode is `codex exec <prompt>` with
//! `--sandbox`/`--ask-for-approval` flags controlling how much it is allowed
//! to do unattended, `-c model="..."` for model overrides, and
//! `--last-message-file` style JSON-on-exit reporting approximated here via a
//! trailing `--json` flag consumed as NDJSON when streaming.

use super::{
    AdapterEvent, AdapterError, Capabilities, EngineAdapter, ExecRequest, Invocation,
    ParsedOutput, Result, StreamingFormat,
};
use crate::model::{AdapterTag, TokenUsage};
use serde::Deserialize;

pub struct CodexAdapter;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CodexEvent {
    #[serde(rename = "agent_message")]
    AgentMessage { message: String },
    #[serde(rename = "exec_command_begin")]
    ExecCommandBegin { command: Vec<String> },
    #[serde(rename = "task_complete")]
    TaskComplete {
        #[serde(default)]
        last_agent_message: Option<String>,
    },
    #[serde(rename = "token_count")]
    TokenCount {
        #[serde(default)]
        input_tokens: Option<u64>,
        #[serde(default)]
        output_tokens: Option<u64>,
    },
    #[serde(other)]
    Other,
}

fn sandbox_flag(mode: Option<&str>, skip_all: bool, full_auto: bool) -> &'static str {
    if skip_all {
        "danger-full-access"
    } else if full_auto {
        "workspace-write"
    } else {
        match mode {
            Some("read-only") => "read-only",
            Some("workspace-write") => "workspace-write",
            _ => "read-only",
        }
    }
}

fn approval_flag(policy: Option<&str>, skip_all: bool, full_auto: bool) -> &'static str {
    if skip_all {
        "never"
    } else if full_auto {
        "on-failure"
    } else {
        match policy {
            Some("never") => "never",
            Some("on-failure") => "on-failure",
            Some("unless-trusted") => "unless-trusted",
            _ => "untrusted",
        }
    }
}

#[async_trait::async_trait]
impl EngineAdapter for CodexAdapter {
    fn tag(&self) -> AdapterTag {
        AdapterTag::Codex
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_resume: true,
            supports_streaming: true,
            streaming_format: StreamingFormat::NdjsonV1,
        }
    }

    fn build_invocation(&self, req: &ExecRequest) -> Invocation {
        let mut argv = vec!["codex".to_string(), "exec".to_string(), "--json".to_string()];

        argv.push("--sandbox".to_string());
        argv.push(
            sandbox_flag(req.sandbox_mode.as_deref(), req.skip_all, req.full_auto).to_string(),
        );

        argv.push("--ask-for-approval".to_string());
        argv.push(
            approval_flag(req.approval_policy.as_deref(), req.skip_all, req.full_auto)
                .to_string(),
        );

        if let Some(model) = &req.model {
            argv.push("-c".to_string());
            argv.push(format!("model=\"{model}\""));
        }

        if let Some(thread_id) = &req.thread_id {
            argv.push("resume".to_string());
            argv.push(thread_id.clone());
        }

        // Codex has no distinct system-prompt flag in exec mode; fold it into
        // the prompt body the way the CLI's own interactive mode does.
        let prompt = match &req.system_prompt {
            Some(sys) => format!("{sys}\n\n{}", req.prompt),
            None => req.prompt.clone(),
        };
        argv.push(prompt);

        Invocation {
            argv,
            env: req.env.clone(),
            stdin: None,
            working_dir: Some("/workspace".to_string()),
        }
    }

    fn parse_output(&self, stdout: &str, _stderr: &str, exit_code: Option<i64>) -> ParsedOutput {
        let mut message = None;
        let mut usage = None;
        for line in stdout.lines() {
            let Ok(event) = serde_json::from_str::<CodexEvent>(line.trim()) else {
                continue;
            };
            match event {
                CodexEvent::TaskComplete { last_agent_message } => {
                    message = last_agent_message.or(message);
                }
                CodexEvent::AgentMessage { message: m } => message = Some(m),
                CodexEvent::TokenCount {
                    input_tokens,
                    output_tokens,
                } => {
                    usage = Some(TokenUsage {
                        input_tokens: input_tokens.unwrap_or(0),
                        output_tokens: output_tokens.unwrap_or(0),
                    });
                }
                _ => {}
            }
        }
        if message.is_none() && exit_code != Some(0) {
            return ParsedOutput {
                error: Some(format!("codex exited with {exit_code:?}")),
                ..Default::default()
            };
        }
        ParsedOutput {
            message,
            thread_id: None,
            usage,
            error: None,
        }
    }

    fn parse_event(&self, line: &str) -> Result<AdapterEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(AdapterEvent::Connected);
        }
        let event: CodexEvent = serde_json::from_str(line)
            .map_err(|e| AdapterError::ParseError(format!("{e}: {line}")))?;
        Ok(match event {
            CodexEvent::AgentMessage { message } => AdapterEvent::Message(message),
            CodexEvent::ExecCommandBegin { command } => AdapterEvent::ToolCall {
                name: "exec_command".to_string(),
                detail: command.join(" "),
            },
            CodexEvent::TaskComplete { .. } => AdapterEvent::Done,
            CodexEvent::TokenCount { .. } | CodexEvent::Other => AdapterEvent::Connected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn req() -> ExecRequest {
        ExecRequest {
            prompt: "List files".to_string(),
            model: Some("o4-mini".to_string()),
            base_url_override: None,
            system_prompt: None,
            approval_policy: None,
            sandbox_mode: None,
            full_auto: false,
            skip_all: false,
            thread_id: None,
            env: HashMap::new(),
        }
    }

    #[test]
    fn build_invocation_default_is_conservative() {
        let adapter = CodexAdapter;
        let invocation = adapter.build_invocation(&req());
        let sandbox_idx = invocation.argv.iter().position(|a| a == "--sandbox").unwrap();
        assert_eq!(invocation.argv[sandbox_idx + 1], "read-only");
        let approval_idx = invocation
            .argv
            .iter()
            .position(|a| a == "--ask-for-approval")
            .unwrap();
        assert_eq!(invocation.argv[approval_idx + 1], "untrusted");
    }

    #[test]
    fn skip_all_grants_full_access_and_never_asks() {
        let adapter = CodexAdapter;
        let mut r = req();
        r.skip_all = true;
        let invocation = adapter.build_invocation(&r);
        assert!(invocation.argv.contains(&"danger-full-access".to_string()));
        assert!(invocation.argv.contains(&"never".to_string()));
    }

    #[test]
    fn parse_output_picks_up_last_agent_message() {
        let adapter = CodexAdapter;
        let stdout = "{\"type\":\"agent_message\",\"message\":\"hi\"}\n{\"type\":\"task_complete\",\"last_agent_message\":\"done\"}\n";
        let parsed = adapter.parse_output(stdout, "", Some(0));
        assert_eq!(parsed.message.as_deref(), Some("done"));
    }

    #[test]
    fn parse_event_exec_command_begin_is_tool_call() {
        let adapter = CodexAdapter;
        let line = r#"{"type":"exec_command_begin","command":["ls","-la"]}"#;
        match adapter.parse_event(line).unwrap() {
            AdapterEvent::ToolCall { name, detail } => {
                assert_eq!(name, "exec_command");
                assert_eq!(detail, "ls -la");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }
}

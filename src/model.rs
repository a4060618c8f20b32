//! The data model: Agent, Provider, Runtime, Skill, Session, Execution, Task, Batch, BatchTask.
//!
//! These are plain serde-able records. Persistence (relational tables /
//! JSON-on-disk per the external layout) is outside the core; [`crate::store`]
//! holds them in memory behind the same repository traits a real persistence
//! layer would implement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type AgentId = Uuid;
pub type ProviderId = Uuid;
pub type RuntimeId = Uuid;
pub type SkillId = Uuid;
pub type McpServerId = Uuid;
pub type SessionId = Uuid;
pub type ExecutionId = Uuid;
pub type TaskId = Uuid;
pub type BatchId = Uuid;

/// Adapter tag, shared by Agent records and the Engine-Adapter Registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterTag {
    Codex,
    ClaudeCode,
    OpenCode,
}

impl std::fmt::Display for AdapterTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterTag::Codex => write!(f, "codex"),
            AdapterTag::ClaudeCode => write!(f, "claude-code"),
            AdapterTag::OpenCode => write!(f, "opencode"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionConfig {
    pub approval_policy: Option<String>,
    pub sandbox_mode: Option<String>,
    pub full_auto: bool,
    pub skip_all: bool,
}

/// Immutable-by-version template for an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub adapter: AdapterTag,
    pub provider_id: ProviderId,
    pub runtime_id: RuntimeId,
    pub model: Option<String>,
    pub base_url_override: Option<String>,
    pub skill_ids: Vec<SkillId>,
    pub mcp_server_ids: Vec<McpServerId>,
    pub system_prompt: Option<String>,
    pub permission: PermissionConfig,
    pub env: HashMap<String, String>,
    pub status: AgentStatus,
}

/// Credential + endpoint descriptor. The `api_key` field is the decrypted
/// value; encryption-at-rest is handled outside the core (see §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    pub category: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub is_configured: bool,
    pub default_models: Vec<String>,
    pub supported_adapters: Vec<AdapterTag>,
    pub is_builtin: bool,
}

/// Container image descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runtime {
    pub id: RuntimeId,
    pub image: String,
    pub cpu_cores: f64,
    pub memory_mb: i64,
    pub network_mode: String,
    pub default_command: Option<Vec<String>>,
    pub is_default: bool,
}

/// One file to inject verbatim as part of a skill payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillFile {
    pub relative_path: String,
    pub content: String,
}

/// Prompt fragment + optional filesystem payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: SkillId,
    pub name: String,
    pub command: String,
    pub description: String,
    pub prompt: String,
    pub category: String,
    pub enabled: bool,
    pub files: Vec<SkillFile>,
    pub source_dir: Option<String>,
    pub is_builtin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServer {
    pub id: McpServerId,
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

/// One container + one workspace directory + an ordered history of Executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub agent_id: AgentId,
    pub container_id: Option<String>,
    pub workspace: std::path::PathBuf,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_thread_id: Option<String>,
    pub executions: Vec<Execution>,
}

impl Session {
    /// Invariant: a Session has a containerID iff status ∈ {Running, Stopped}.
    pub fn container_invariant_holds(&self) -> bool {
        match self.status {
            SessionStatus::Running | SessionStatus::Stopped => self.container_id.is_some(),
            SessionStatus::Creating | SessionStatus::Error => true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One turn of agent activity inside a Session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub session_id: SessionId,
    pub prompt: String,
    pub thread_id: Option<String>,
    pub exit_code: Option<i64>,
    pub message: Option<String>,
    pub output: String,
    pub usage: Option<TokenUsage>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// One (prompt, result) pair in a multi-turn Task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub prompt: String,
    pub result: Option<TurnResult>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub message: Option<String>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

/// Async single-prompt job, possibly extended with more turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub agent_id: AgentId,
    pub turns: Vec<Turn>,
    pub status: TaskStatus,
    pub session_id: Option<SessionId>,
    pub attachments: Vec<String>,
    pub webhook_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Task {
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Templated fan-out of N BatchTasks over an Agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub agent_id: AgentId,
    pub name: String,
    pub prompt_template: String,
    pub inputs: Vec<HashMap<String, String>>,
    pub concurrency: usize,
    pub timeout_secs: Option<u64>,
    pub max_retries: u32,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchCounters {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
    pub pending: usize,
    pub running: usize,
    pub avg_duration_ms: Option<f64>,
    pub p50_duration_ms: Option<u64>,
    pub p95_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Dead,
}

/// One materialized row of a Batch's fan-out template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTask {
    pub batch_id: BatchId,
    pub index: usize,
    pub input: HashMap<String, String>,
    pub prompt: String,
    pub status: BatchTaskStatus,
    pub worker_id: Option<usize>,
    pub attempts: u32,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl BatchTask {
    /// Invariant: attempts ≤ maxRetries+1; Dead ⇒ attempts = maxRetries+1.
    pub fn respects_retry_invariant(&self, max_retries: u32) -> bool {
        if self.attempts > max_retries + 1 {
            return false;
        }
        if self.status == BatchTaskStatus::Dead && self.attempts != max_retries + 1 {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_container_invariant() {
        let mut session = Session {
            id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            container_id: None,
            workspace: "/tmp/ws".into(),
            status: SessionStatus::Creating,
            created_at: Utc::now(),
            last_thread_id: None,
            executions: Vec::new(),
        };
        assert!(session.container_invariant_holds());

        session.status = SessionStatus::Running;
        assert!(!session.container_invariant_holds());

        session.container_id = Some("abc".to_string());
        assert!(session.container_invariant_holds());
    }

    #[test]
    fn batch_task_retry_invariant() {
        let mut task = BatchTask {
            batch_id: Uuid::new_v4(),
            index: 0,
            input: HashMap::new(),
            prompt: String::new(),
            status: BatchTaskStatus::Failed,
            worker_id: None,
            attempts: 3,
            result: None,
            error: None,
            duration_ms: None,
            started_at: None,
            ended_at: None,
        };
        assert!(task.respects_retry_invariant(3));
        task.status = BatchTaskStatus::Dead;
        assert!(!task.respects_retry_invariant(3));
        task.attempts = 4;
        assert!(task.respects_retry_invariant(3));
    }
}

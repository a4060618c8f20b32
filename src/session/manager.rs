use crate::adapter::{AdapterRegistry, ExecRequest as AdapterExecRequest};
use crate::container::{
    ContainerDriver, ContainerSpec, LABEL_MANAGED, LABEL_SESSION_ID,
};
use crate::error::{CoreError, Result};
use crate::eventbus::{BusEvent, EventBus};
use crate::model::{AgentId, Execution, Session, SessionId, SessionStatus};
use crate::resolver::AgentResolver;
use crate::store::Store;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use uuid::Uuid;

pub struct CreateSessionRequest {
    pub agent_id: AgentId,
}

/// One turn submitted against a Running Session.
pub struct ExecRequest {
    pub prompt: String,
    /// Overrides the Session's remembered thread for this turn only.
    pub thread_id_override: Option<String>,
}

/// Owns the container-per-Session lifecycle and dispatches Exec/ExecStream
/// through the resolved Agent's adapter.
pub struct SessionManager {
    store: Store,
    driver: Arc<dyn ContainerDriver>,
    adapters: Arc<AdapterRegistry>,
    resolver: AgentResolver,
    bus: Arc<EventBus>,
    workspace_root: PathBuf,
    /// One lock per Session, serializing `exec`/`exec_stream` calls against
    /// it so concurrent callers cannot race the executions read-modify-write.
    exec_locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(
        store: Store,
        driver: Arc<dyn ContainerDriver>,
        adapters: Arc<AdapterRegistry>,
        bus: Arc<EventBus>,
        workspace_root: PathBuf,
    ) -> Self {
        let resolver = AgentResolver::new(store.clone());
        Self {
            store,
            driver,
            adapters,
            resolver,
            bus,
            workspace_root,
            exec_locks: DashMap::new(),
        }
    }

    fn exec_lock(&self, session_id: SessionId) -> Arc<Mutex<()>> {
        Arc::clone(
            &*self
                .exec_locks
                .entry(session_id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Creates a Session's container and starts it. If any step fails after
    /// the container is created, the container is torn down and no Session
    /// row is ever persisted — a caller retrying sees a clean slate, not a
    /// half-built Session stuck in `Creating`.
    pub async fn create(&self, req: CreateSessionRequest) -> Result<Session> {
        let resolved = self.resolver.resolve(req.agent_id).await?;
        let session_id: SessionId = Uuid::new_v4();
        let workspace = crate::env::session_workspace_path(&self.workspace_root, &session_id.to_string());
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| CoreError::Internal(format!("failed to create workspace dir: {e}")))?;

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_SESSION_ID.to_string(), session_id.to_string());

        let spec = ContainerSpec {
            image: resolved.runtime.image.clone(),
            command: resolved.runtime.default_command.clone(),
            env: resolved.env.clone(),
            mounts: Vec::new(),
            cpu_cores: Some(resolved.runtime.cpu_cores),
            memory_bytes: Some(resolved.runtime.memory_mb * 1024 * 1024),
            labels,
            network_mode: Some(resolved.runtime.network_mode.clone()),
            working_dir: Some("/workspace".to_string()),
        };

        let name = format!("agentbox-{session_id}");
        let container_id = self.driver.create(&spec, Some(&name)).await?;

        if let Err(e) = self.driver.start(&container_id).await {
            let _ = self.driver.remove(&container_id, true).await;
            return Err(e.into());
        }

        if let Err(e) = self.inject_skills(&container_id, &resolved.skills).await {
            let _ = self.driver.remove(&container_id, true).await;
            return Err(e);
        }

        let session = Session {
            id: session_id,
            agent_id: req.agent_id,
            container_id: Some(container_id),
            workspace,
            status: SessionStatus::Running,
            created_at: Utc::now(),
            last_thread_id: None,
            executions: Vec::new(),
        };
        self.store.sessions.insert(session.clone()).await?;
        Ok(session)
    }

    async fn inject_skills(
        &self,
        container_id: &str,
        skills: &[crate::model::Skill],
    ) -> Result<()> {
        for skill in skills {
            let staging = std::env::temp_dir().join(format!("agentbox-skill-{}", Uuid::new_v4()));
            tokio::fs::create_dir_all(&staging)
                .await
                .map_err(|e| CoreError::Internal(format!("failed to stage skill files: {e}")))?;

            let skill_md = format!(
                "# {}\n\n{}\n\n{}\n",
                skill.name, skill.description, skill.prompt
            );
            tokio::fs::write(staging.join("SKILL.md"), skill_md)
                .await
                .map_err(|e| CoreError::Internal(format!("failed to write SKILL.md: {e}")))?;
            for file in &skill.files {
                let dest = staging.join(&file.relative_path);
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await.ok();
                }
                tokio::fs::write(&dest, &file.content)
                    .await
                    .map_err(|e| CoreError::Internal(format!("failed to stage skill file: {e}")))?;
            }
            let container_path = format!(
                "/workspace/.agentbox/skills/{}",
                skill.command.trim_start_matches('/')
            );
            let result = self.driver.copy_to(container_id, &staging, &container_path).await;
            tokio::fs::remove_dir_all(&staging).await.ok();
            result?;
        }
        Ok(())
    }

    pub async fn get(&self, session_id: SessionId) -> Result<Session> {
        Ok(self.store.sessions.get(session_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Session>> {
        Ok(self.store.sessions.list().await?)
    }

    /// Stopping an already-stopped Session is a no-op, matching the
    /// container engine's own idempotent stop semantics.
    pub async fn stop(&self, session_id: SessionId) -> Result<Session> {
        let mut session = self.store.sessions.get(session_id).await?;
        if session.status == SessionStatus::Stopped {
            return Ok(session);
        }
        if session.status != SessionStatus::Running {
            return Err(CoreError::PreconditionFailed(format!(
                "session {session_id} is not running"
            )));
        }
        let container_id = session
            .container_id
            .clone()
            .ok_or_else(|| CoreError::Internal("running session missing container id".into()))?;
        self.driver.stop(&container_id).await?;
        session.status = SessionStatus::Stopped;
        self.store.sessions.update(session.clone()).await?;
        Ok(session)
    }

    pub async fn start(&self, session_id: SessionId) -> Result<Session> {
        let mut session = self.store.sessions.get(session_id).await?;
        if session.status != SessionStatus::Stopped {
            return Err(CoreError::PreconditionFailed(format!(
                "session {session_id} is not stopped"
            )));
        }
        let container_id = session
            .container_id
            .clone()
            .ok_or_else(|| CoreError::Internal("stopped session missing container id".into()))?;
        self.driver.start(&container_id).await?;
        session.status = SessionStatus::Running;
        self.store.sessions.update(session.clone()).await?;
        Ok(session)
    }

    pub async fn delete(&self, session_id: SessionId, force: bool) -> Result<()> {
        let session = self.store.sessions.get(session_id).await?;
        if let Some(container_id) = &session.container_id {
            self.driver.remove(container_id, force).await?;
        }
        tokio::fs::remove_dir_all(&session.workspace).await.ok();
        self.store.sessions.delete(session_id).await?;
        self.exec_locks.remove(&session_id);
        Ok(())
    }

    /// Returns the container's captured logs. `tail` limits to the last N
    /// lines the same way `docker logs --tail` does.
    pub async fn logs(&self, session_id: SessionId, tail: Option<&str>) -> Result<String> {
        let session = self.store.sessions.get(session_id).await?;
        let container_id = session
            .container_id
            .as_ref()
            .ok_or_else(|| CoreError::PreconditionFailed(format!(
                "session {session_id} has no container yet"
            )))?;
        Ok(self.driver.logs(container_id, tail).await?)
    }

    /// Re-attaches to an existing Session, validating the remembered status
    /// against the engine's actual state and flipping to `Error` on mismatch.
    pub async fn reconnect(&self, session_id: SessionId) -> Result<Session> {
        let mut session = self.store.sessions.get(session_id).await?;
        let Some(container_id) = session.container_id.clone() else {
            return Ok(session);
        };
        let inspected = self.driver.inspect(&container_id).await?;
        let expected_running = session.status == SessionStatus::Running;
        if inspected.exists && inspected.running != expected_running {
            session.status = if inspected.running {
                SessionStatus::Running
            } else {
                SessionStatus::Stopped
            };
            self.store.sessions.update(session.clone()).await?;
        } else if !inspected.exists {
            session.status = SessionStatus::Error;
            self.store.sessions.update(session.clone()).await?;
        }
        Ok(session)
    }

    /// Runs one non-streaming turn and appends its Execution to the Session.
    /// Executions against the same Session are strictly serialized: a second
    /// concurrent call blocks on the first's lock rather than racing its
    /// read-modify-write of `session.executions`.
    pub async fn exec(&self, session_id: SessionId, req: ExecRequest) -> Result<Execution> {
        let lock = self.exec_lock(session_id);
        let _guard = lock.lock().await;
        let mut session = self.store.sessions.get(session_id).await?;
        if session.status != SessionStatus::Running {
            return Err(CoreError::PreconditionFailed(format!(
                "session {session_id} is not running"
            )));
        }
        let container_id = session
            .container_id
            .clone()
            .ok_or_else(|| CoreError::Internal("running session missing container id".into()))?;

        let resolved = self.resolver.resolve(session.agent_id).await?;
        let adapter = self
            .adapters
            .get(resolved.agent.adapter)
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        let thread_id = req
            .thread_id_override
            .clone()
            .or_else(|| session.last_thread_id.clone());

        let adapter_req = AdapterExecRequest {
            prompt: req.prompt.clone(),
            model: resolved.agent.model.clone(),
            base_url_override: resolved.agent.base_url_override.clone(),
            system_prompt: resolved.agent.system_prompt.clone(),
            approval_policy: resolved.agent.permission.approval_policy.clone(),
            sandbox_mode: resolved.agent.permission.sandbox_mode.clone(),
            full_auto: resolved.agent.permission.full_auto,
            skip_all: resolved.agent.permission.skip_all,
            thread_id,
            env: resolved.env.clone(),
        };
        let invocation = adapter.build_invocation(&adapter_req);

        let execution_id = Uuid::new_v4();
        let started_at = Utc::now();
        let output = self.driver.exec(&container_id, &invocation.argv).await?;
        let parsed = adapter.parse_output(&output.stdout, &output.stderr, output.exit_code);

        let execution = Execution {
            id: execution_id,
            session_id,
            prompt: req.prompt,
            thread_id: parsed.thread_id.clone(),
            exit_code: output.exit_code,
            message: parsed.message.clone(),
            output: output.combined(),
            usage: parsed.usage.clone(),
            started_at,
            ended_at: Some(Utc::now()),
            error: parsed.error.clone(),
        };

        if let Some(thread_id) = &parsed.thread_id {
            session.last_thread_id = Some(thread_id.clone());
        }
        session.executions.push(execution.clone());
        self.store.sessions.update(session).await?;

        self.bus.publish(BusEvent::ExecDone {
            session_id: session_id.to_string(),
            execution_id: execution_id.to_string(),
            exit_code: output.exit_code,
        });

        Ok(execution)
    }

    /// Runs one streaming turn, republishing each adapter event on the bus
    /// as it arrives and returning the final Execution once the underlying
    /// exec exits.
    pub async fn exec_stream(&self, session_id: SessionId, req: ExecRequest) -> Result<Execution> {
        let lock = self.exec_lock(session_id);
        let _guard = lock.lock().await;
        let mut session = self.store.sessions.get(session_id).await?;
        if session.status != SessionStatus::Running {
            return Err(CoreError::PreconditionFailed(format!(
                "session {session_id} is not running"
            )));
        }
        let container_id = session
            .container_id
            .clone()
            .ok_or_else(|| CoreError::Internal("running session missing container id".into()))?;

        let resolved = self.resolver.resolve(session.agent_id).await?;
        let adapter = self
            .adapters
            .get(resolved.agent.adapter)
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        let thread_id = req
            .thread_id_override
            .clone()
            .or_else(|| session.last_thread_id.clone());

        let adapter_req = AdapterExecRequest {
            prompt: req.prompt.clone(),
            model: resolved.agent.model.clone(),
            base_url_override: resolved.agent.base_url_override.clone(),
            system_prompt: resolved.agent.system_prompt.clone(),
            approval_policy: resolved.agent.permission.approval_policy.clone(),
            sandbox_mode: resolved.agent.permission.sandbox_mode.clone(),
            full_auto: resolved.agent.permission.full_auto,
            skip_all: resolved.agent.permission.skip_all,
            thread_id,
            env: resolved.env.clone(),
        };
        let invocation = adapter.build_invocation(&adapter_req);

        let execution_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut stream = self.driver.exec_stream(&container_id, &invocation.argv).await?;

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        let mut pending_line = String::new();
        let mut exit_code = None;

        while let Some(event) = stream.next().await {
            match event? {
                crate::container::ExecEvent::Stdout(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    stdout_buf.push_str(&text);
                    pending_line.push_str(&text);
                    while let Some(pos) = pending_line.find('\n') {
                        let line: String = pending_line.drain(..=pos).collect();
                        self.emit_parsed_line(&*adapter, session_id, &execution_id, &line);
                    }
                    self.bus.publish(BusEvent::ExecOutput {
                        session_id: session_id.to_string(),
                        execution_id: execution_id.to_string(),
                        chunk: text.to_string(),
                        stream: "stdout",
                    });
                }
                crate::container::ExecEvent::Stderr(bytes) => {
                    let text = String::from_utf8_lossy(&bytes).to_string();
                    stderr_buf.push_str(&text);
                    self.bus.publish(BusEvent::ExecOutput {
                        session_id: session_id.to_string(),
                        execution_id: execution_id.to_string(),
                        chunk: text,
                        stream: "stderr",
                    });
                }
                crate::container::ExecEvent::Exit(code) => {
                    exit_code = code;
                }
            }
        }
        if !pending_line.trim().is_empty() {
            self.emit_parsed_line(&*adapter, session_id, &execution_id, &pending_line);
        }

        let parsed = adapter.parse_output(&stdout_buf, &stderr_buf, exit_code);
        let execution = Execution {
            id: execution_id,
            session_id,
            prompt: req.prompt,
            thread_id: parsed.thread_id.clone(),
            exit_code,
            message: parsed.message.clone(),
            output: format!("{stdout_buf}{stderr_buf}"),
            usage: parsed.usage.clone(),
            started_at,
            ended_at: Some(Utc::now()),
            error: parsed.error.clone(),
        };

        if let Some(thread_id) = &parsed.thread_id {
            session.last_thread_id = Some(thread_id.clone());
        }
        session.executions.push(execution.clone());
        self.store.sessions.update(session).await?;

        self.bus.publish(BusEvent::ExecDone {
            session_id: session_id.to_string(),
            execution_id: execution_id.to_string(),
            exit_code,
        });

        Ok(execution)
    }

    fn emit_parsed_line(
        &self,
        adapter: &dyn crate::adapter::EngineAdapter,
        session_id: SessionId,
        execution_id: &Uuid,
        line: &str,
    ) {
        if !adapter.capabilities().supports_streaming {
            return;
        }
        if let Ok(event) = adapter.parse_event(line) {
            if let crate::adapter::AdapterEvent::Message(text) = &event {
                self.bus.publish(BusEvent::ExecOutput {
                    session_id: session_id.to_string(),
                    execution_id: execution_id.to_string(),
                    chunk: text.clone(),
                    stream: "agent",
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterRegistry;
    use crate::container::MockContainerDriver;
    use crate::model::*;

    async fn seeded_manager() -> (SessionManager, AgentId) {
        let store = Store::in_memory();
        let provider = Provider {
            id: Uuid::new_v4(),
            name: "anthropic".to_string(),
            category: "llm".to_string(),
            base_url: None,
            api_key: Some("sk-test".to_string()),
            is_configured: true,
            default_models: vec![],
            supported_adapters: vec![AdapterTag::ClaudeCode],
            is_builtin: true,
        };
        let runtime = Runtime {
            id: Uuid::new_v4(),
            image: "agentbox/workspace:latest".to_string(),
            cpu_cores: 1.0,
            memory_mb: 512,
            network_mode: "bridge".to_string(),
            default_command: None,
            is_default: true,
        };
        let agent = Agent {
            id: Uuid::new_v4(),
            adapter: AdapterTag::ClaudeCode,
            provider_id: provider.id,
            runtime_id: runtime.id,
            model: Some("sonnet".to_string()),
            base_url_override: None,
            skill_ids: Vec::new(),
            mcp_server_ids: Vec::new(),
            system_prompt: None,
            permission: PermissionConfig {
                full_auto: true,
                ..Default::default()
            },
            env: HashMap::new(),
            status: AgentStatus::Active,
        };
        store.providers.insert(provider).await.unwrap();
        store.runtimes.insert(runtime).await.unwrap();
        store.agents.insert(agent.clone()).await.unwrap();

        let driver: Arc<dyn ContainerDriver> = Arc::new(MockContainerDriver::new());
        let adapters = Arc::new(AdapterRegistry::with_defaults());
        let bus = EventBus::new();
        let workspace_root = std::env::temp_dir().join(format!("agentbox-test-{}", Uuid::new_v4()));
        let manager = SessionManager::new(store, driver, adapters, bus, workspace_root);
        (manager, agent.id)
    }

    #[tokio::test]
    async fn create_then_stop_then_start() {
        let (manager, agent_id) = seeded_manager().await;
        let session = manager.create(CreateSessionRequest { agent_id }).await.unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert!(session.container_invariant_holds());

        let stopped = manager.stop(session.id).await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);

        let restarted = manager.start(session.id).await.unwrap();
        assert_eq!(restarted.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn exec_against_stopped_session_fails() {
        let (manager, agent_id) = seeded_manager().await;
        let session = manager.create(CreateSessionRequest { agent_id }).await.unwrap();
        manager.stop(session.id).await.unwrap();
        let err = manager
            .exec(
                session.id,
                ExecRequest {
                    prompt: "hi".to_string(),
                    thread_id_override: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 412);
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let (manager, agent_id) = seeded_manager().await;
        let session = manager.create(CreateSessionRequest { agent_id }).await.unwrap();
        manager.delete(session.id, true).await.unwrap();
        let err = manager.get(session.id).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}

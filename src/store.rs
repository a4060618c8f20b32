//! In-memory persistence facade.
//!
//! A real deployment would back these traits with a relational store; here
//! each repository is an `Arc<RwLock<HashMap<Id, T>>>`, giving the rest of
//! the core a stable interface to code and test against regardless of what
//! eventually sits behind it.

use crate::error::{CoreError, Result};
use crate::model::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn insert(&self, agent: Agent) -> Result<()>;
    async fn get(&self, id: AgentId) -> Result<Agent>;
    async fn list(&self) -> Result<Vec<Agent>>;
    async fn update(&self, agent: Agent) -> Result<()>;
    async fn delete(&self, id: AgentId) -> Result<()>;
}

#[async_trait]
pub trait ProviderRepository: Send + Sync {
    async fn insert(&self, provider: Provider) -> Result<()>;
    async fn get(&self, id: ProviderId) -> Result<Provider>;
    async fn list(&self) -> Result<Vec<Provider>>;
    async fn update(&self, provider: Provider) -> Result<()>;
    async fn delete(&self, id: ProviderId) -> Result<()>;
}

#[async_trait]
pub trait RuntimeRepository: Send + Sync {
    async fn insert(&self, runtime: Runtime) -> Result<()>;
    async fn get(&self, id: RuntimeId) -> Result<Runtime>;
    async fn list(&self) -> Result<Vec<Runtime>>;
    async fn delete(&self, id: RuntimeId) -> Result<()>;
}

#[async_trait]
pub trait SkillRepository: Send + Sync {
    async fn insert(&self, skill: Skill) -> Result<()>;
    async fn get(&self, id: SkillId) -> Result<Skill>;
    async fn list(&self) -> Result<Vec<Skill>>;
    async fn delete(&self, id: SkillId) -> Result<()>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert(&self, session: Session) -> Result<()>;
    async fn get(&self, id: SessionId) -> Result<Session>;
    async fn list(&self) -> Result<Vec<Session>>;
    async fn list_by_agent(&self, agent_id: AgentId) -> Result<Vec<Session>>;
    async fn update(&self, session: Session) -> Result<()>;
    async fn delete(&self, id: SessionId) -> Result<()>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert(&self, task: Task) -> Result<()>;
    async fn get(&self, id: TaskId) -> Result<Task>;
    async fn list(&self) -> Result<Vec<Task>>;
    async fn update(&self, task: Task) -> Result<()>;
    async fn delete(&self, id: TaskId) -> Result<()>;
}

#[async_trait]
pub trait McpServerRepository: Send + Sync {
    async fn insert(&self, server: McpServer) -> Result<()>;
    async fn get(&self, id: McpServerId) -> Result<McpServer>;
    async fn list(&self) -> Result<Vec<McpServer>>;
    async fn update(&self, server: McpServer) -> Result<()>;
    async fn delete(&self, id: McpServerId) -> Result<()>;
}

#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn insert(&self, batch: Batch) -> Result<()>;
    async fn get(&self, id: BatchId) -> Result<Batch>;
    async fn list(&self) -> Result<Vec<Batch>>;
    async fn update(&self, batch: Batch) -> Result<()>;
    async fn insert_tasks(&self, tasks: Vec<BatchTask>) -> Result<()>;
    async fn list_tasks(&self, batch_id: BatchId) -> Result<Vec<BatchTask>>;
    async fn update_task(&self, task: BatchTask) -> Result<()>;
}

macro_rules! in_memory_repo {
    ($name:ident, $id_ty:ty, $item:ty) => {
        #[derive(Default)]
        pub struct $name {
            rows: RwLock<HashMap<$id_ty, $item>>,
        }

        impl $name {
            pub fn new() -> Self {
                Self {
                    rows: RwLock::new(HashMap::new()),
                }
            }
        }
    };
}

in_memory_repo!(InMemoryAgentRepository, AgentId, Agent);
in_memory_repo!(InMemoryProviderRepository, ProviderId, Provider);
in_memory_repo!(InMemoryRuntimeRepository, RuntimeId, Runtime);
in_memory_repo!(InMemorySkillRepository, SkillId, Skill);
in_memory_repo!(InMemorySessionRepository, SessionId, Session);
in_memory_repo!(InMemoryTaskRepository, TaskId, Task);
in_memory_repo!(InMemoryMcpServerRepository, McpServerId, McpServer);

#[async_trait]
impl AgentRepository for InMemoryAgentRepository {
    async fn insert(&self, agent: Agent) -> Result<()> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&agent.id) {
            return Err(CoreError::Conflict(format!("agent {} already exists", agent.id)));
        }
        rows.insert(agent.id, agent);
        Ok(())
    }

    async fn get(&self, id: AgentId) -> Result<Agent> {
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))
    }

    async fn list(&self) -> Result<Vec<Agent>> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn update(&self, agent: Agent) -> Result<()> {
        let mut rows = self.rows.write().await;
        if !rows.contains_key(&agent.id) {
            return Err(CoreError::NotFound(format!("agent {}", agent.id)));
        }
        rows.insert(agent.id, agent);
        Ok(())
    }

    async fn delete(&self, id: AgentId) -> Result<()> {
        self.rows
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))
    }
}

#[async_trait]
impl ProviderRepository for InMemoryProviderRepository {
    async fn insert(&self, provider: Provider) -> Result<()> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&provider.id) {
            return Err(CoreError::Conflict(format!(
                "provider {} already exists",
                provider.id
            )));
        }
        rows.insert(provider.id, provider);
        Ok(())
    }

    async fn get(&self, id: ProviderId) -> Result<Provider> {
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("provider {id}")))
    }

    async fn list(&self) -> Result<Vec<Provider>> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn update(&self, provider: Provider) -> Result<()> {
        let mut rows = self.rows.write().await;
        if !rows.contains_key(&provider.id) {
            return Err(CoreError::NotFound(format!("provider {}", provider.id)));
        }
        rows.insert(provider.id, provider);
        Ok(())
    }

    async fn delete(&self, id: ProviderId) -> Result<()> {
        let mut rows = self.rows.write().await;
        match rows.get(&id) {
            Some(p) if p.is_builtin => {
                Err(CoreError::Forbidden(format!("provider {id} is built-in")))
            }
            Some(_) => {
                rows.remove(&id);
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("provider {id}"))),
        }
    }
}

#[async_trait]
impl RuntimeRepository for InMemoryRuntimeRepository {
    async fn insert(&self, runtime: Runtime) -> Result<()> {
        self.rows.write().await.insert(runtime.id, runtime);
        Ok(())
    }

    async fn get(&self, id: RuntimeId) -> Result<Runtime> {
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("runtime {id}")))
    }

    async fn list(&self) -> Result<Vec<Runtime>> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn delete(&self, id: RuntimeId) -> Result<()> {
        self.rows
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("runtime {id}")))
    }
}

#[async_trait]
impl SkillRepository for InMemorySkillRepository {
    async fn insert(&self, skill: Skill) -> Result<()> {
        self.rows.write().await.insert(skill.id, skill);
        Ok(())
    }

    async fn get(&self, id: SkillId) -> Result<Skill> {
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("skill {id}")))
    }

    async fn list(&self) -> Result<Vec<Skill>> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn delete(&self, id: SkillId) -> Result<()> {
        let mut rows = self.rows.write().await;
        match rows.get(&id) {
            Some(s) if s.is_builtin => Err(CoreError::Forbidden(format!("skill {id} is built-in"))),
            Some(_) => {
                rows.remove(&id);
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("skill {id}"))),
        }
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn insert(&self, session: Session) -> Result<()> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&session.id) {
            return Err(CoreError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }
        rows.insert(session.id, session);
        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<Session> {
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("session {id}")))
    }

    async fn list(&self) -> Result<Vec<Session>> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn list_by_agent(&self, agent_id: AgentId) -> Result<Vec<Session>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|s| s.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn update(&self, session: Session) -> Result<()> {
        let mut rows = self.rows.write().await;
        if !rows.contains_key(&session.id) {
            return Err(CoreError::NotFound(format!("session {}", session.id)));
        }
        rows.insert(session.id, session);
        Ok(())
    }

    async fn delete(&self, id: SessionId) -> Result<()> {
        self.rows
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("session {id}")))
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn insert(&self, task: Task) -> Result<()> {
        self.rows.write().await.insert(task.id, task);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Task> {
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("task {id}")))
    }

    async fn list(&self) -> Result<Vec<Task>> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn update(&self, task: Task) -> Result<()> {
        let mut rows = self.rows.write().await;
        if !rows.contains_key(&task.id) {
            return Err(CoreError::NotFound(format!("task {}", task.id)));
        }
        rows.insert(task.id, task);
        Ok(())
    }

    async fn delete(&self, id: TaskId) -> Result<()> {
        self.rows
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("task {id}")))
    }
}

#[async_trait]
impl McpServerRepository for InMemoryMcpServerRepository {
    async fn insert(&self, server: McpServer) -> Result<()> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&server.id) {
            return Err(CoreError::Conflict(format!(
                "mcp server {} already exists",
                server.id
            )));
        }
        rows.insert(server.id, server);
        Ok(())
    }

    async fn get(&self, id: McpServerId) -> Result<McpServer> {
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("mcp server {id}")))
    }

    async fn list(&self) -> Result<Vec<McpServer>> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn update(&self, server: McpServer) -> Result<()> {
        let mut rows = self.rows.write().await;
        if !rows.contains_key(&server.id) {
            return Err(CoreError::NotFound(format!("mcp server {}", server.id)));
        }
        rows.insert(server.id, server);
        Ok(())
    }

    async fn delete(&self, id: McpServerId) -> Result<()> {
        self.rows
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("mcp server {id}")))
    }
}

/// Batches need a second table for their materialized fan-out rows, so they
/// get a hand-written repository rather than the single-table macro.
#[derive(Default)]
pub struct InMemoryBatchRepository {
    batches: RwLock<HashMap<BatchId, Batch>>,
    tasks: RwLock<HashMap<BatchId, Vec<BatchTask>>>,
}

impl InMemoryBatchRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchRepository for InMemoryBatchRepository {
    async fn insert(&self, batch: Batch) -> Result<()> {
        self.batches.write().await.insert(batch.id, batch);
        Ok(())
    }

    async fn get(&self, id: BatchId) -> Result<Batch> {
        self.batches
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("batch {id}")))
    }

    async fn list(&self) -> Result<Vec<Batch>> {
        Ok(self.batches.read().await.values().cloned().collect())
    }

    async fn update(&self, batch: Batch) -> Result<()> {
        let mut rows = self.batches.write().await;
        if !rows.contains_key(&batch.id) {
            return Err(CoreError::NotFound(format!("batch {}", batch.id)));
        }
        rows.insert(batch.id, batch);
        Ok(())
    }

    async fn insert_tasks(&self, tasks: Vec<BatchTask>) -> Result<()> {
        if let Some(batch_id) = tasks.first().map(|t| t.batch_id) {
            self.tasks.write().await.insert(batch_id, tasks);
        }
        Ok(())
    }

    async fn list_tasks(&self, batch_id: BatchId) -> Result<Vec<BatchTask>> {
        Ok(self
            .tasks
            .read()
            .await
            .get(&batch_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_task(&self, task: BatchTask) -> Result<()> {
        let mut rows = self.tasks.write().await;
        let list = rows
            .get_mut(&task.batch_id)
            .ok_or_else(|| CoreError::NotFound(format!("batch {}", task.batch_id)))?;
        let slot = list
            .iter_mut()
            .find(|t| t.index == task.index)
            .ok_or_else(|| CoreError::NotFound(format!("batch task {}", task.index)))?;
        *slot = task;
        Ok(())
    }
}

/// Bundles one repository per entity type so callers can pass a single
/// handle through the Session/Task/Batch Schedulers.
#[derive(Clone)]
pub struct Store {
    pub agents: Arc<dyn AgentRepository>,
    pub providers: Arc<dyn ProviderRepository>,
    pub runtimes: Arc<dyn RuntimeRepository>,
    pub skills: Arc<dyn SkillRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub batches: Arc<dyn BatchRepository>,
    pub mcp_servers: Arc<dyn McpServerRepository>,
}

impl Store {
    pub fn in_memory() -> Self {
        Self {
            agents: Arc::new(InMemoryAgentRepository::new()),
            providers: Arc::new(InMemoryProviderRepository::new()),
            runtimes: Arc::new(InMemoryRuntimeRepository::new()),
            skills: Arc::new(InMemorySkillRepository::new()),
            sessions: Arc::new(InMemorySessionRepository::new()),
            tasks: Arc::new(InMemoryTaskRepository::new()),
            batches: Arc::new(InMemoryBatchRepository::new()),
            mcp_servers: Arc::new(InMemoryMcpServerRepository::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_agent() -> Agent {
        Agent {
            id: Uuid::new_v4(),
            adapter: AdapterTag::Codex,
            provider_id: Uuid::new_v4(),
            runtime_id: Uuid::new_v4(),
            model: None,
            base_url_override: None,
            skill_ids: Vec::new(),
            mcp_server_ids: Vec::new(),
            system_prompt: None,
            permission: PermissionConfig::default(),
            env: HashMap::new(),
            status: AgentStatus::Active,
        }
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let repo = InMemoryAgentRepository::new();
        let agent = sample_agent();
        repo.insert(agent.clone()).await.unwrap();
        let fetched = repo.get(agent.id).await.unwrap();
        assert_eq!(fetched.id, agent.id);
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let repo = InMemoryAgentRepository::new();
        let agent = sample_agent();
        repo.insert(agent.clone()).await.unwrap();
        let err = repo.insert(agent).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn deleting_builtin_provider_is_forbidden() {
        let repo = InMemoryProviderRepository::new();
        let provider = Provider {
            id: Uuid::new_v4(),
            name: "anthropic".to_string(),
            category: "llm".to_string(),
            base_url: None,
            api_key: None,
            is_configured: true,
            default_models: Vec::new(),
            supported_adapters: Vec::new(),
            is_builtin: true,
        };
        repo.insert(provider.clone()).await.unwrap();
        let err = repo.delete(provider.id).await.unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn batch_task_update_round_trips() {
        let repo = InMemoryBatchRepository::new();
        let batch_id = Uuid::new_v4();
        let batch = Batch {
            id: batch_id,
            agent_id: Uuid::new_v4(),
            name: "b".to_string(),
            prompt_template: "{{x}}".to_string(),
            inputs: Vec::new(),
            concurrency: 2,
            timeout_secs: None,
            max_retries: 1,
            status: BatchStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        repo.insert(batch).await.unwrap();
        let task = BatchTask {
            batch_id,
            index: 0,
            input: HashMap::new(),
            prompt: "x".to_string(),
            status: BatchTaskStatus::Pending,
            worker_id: None,
            attempts: 0,
            result: None,
            error: None,
            duration_ms: None,
            started_at: None,
            ended_at: None,
        };
        repo.insert_tasks(vec![task.clone()]).await.unwrap();
        let mut updated = task;
        updated.status = BatchTaskStatus::Completed;
        repo.update_task(updated).await.unwrap();
        let tasks = repo.list_tasks(batch_id).await.unwrap();
        assert_eq!(tasks[0].status, BatchTaskStatus::Completed);
    }
}

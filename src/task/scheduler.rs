use crate::error::{CoreError, Result};
use crate::eventbus::{BusEvent, EventBus};
use crate::model::{AgentId, Task, TaskId, TaskStatus, Turn, TurnResult};
use crate::resolver::AgentResolver;
use crate::session::{CreateSessionRequest, ExecRequest, SessionManager};
use crate::store::Store;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct CreateTaskRequest {
    pub agent_id: AgentId,
    pub prompt: String,
    pub attachments: Vec<String>,
    pub webhook_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Runs Tasks asynchronously against an ephemeral Session, bounded by a
/// global concurrency limit. Each accepted Task gets its own cancellation
/// token so `cancel` can stop an in-flight exec without tearing down every
/// other Task sharing the scheduler.
pub struct TaskScheduler {
    store: Store,
    sessions: Arc<SessionManager>,
    bus: Arc<EventBus>,
    resolver: AgentResolver,
    semaphore: Arc<Semaphore>,
    cancellations: DashMap<TaskId, CancellationToken>,
}

impl TaskScheduler {
    pub fn new(
        store: Store,
        sessions: Arc<SessionManager>,
        bus: Arc<EventBus>,
        max_concurrency: usize,
    ) -> Arc<Self> {
        let resolver = AgentResolver::new(store.clone());
        Arc::new(Self {
            store,
            sessions,
            bus,
            resolver,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            cancellations: DashMap::new(),
        })
    }

    /// Creates a Task as Queued. The Agent→Provider chain is validated here,
    /// at creation time, so a Task whose Agent references an unconfigured
    /// Provider fails immediately rather than surfacing the error only once
    /// the background scheduler loop gets around to starting a Session.
    pub async fn create_task(self: &Arc<Self>, req: CreateTaskRequest) -> Result<Task> {
        self.resolver.resolve(req.agent_id).await?;
        let task = Task {
            id: Uuid::new_v4(),
            agent_id: req.agent_id,
            turns: vec![Turn {
                prompt: req.prompt,
                result: None,
                started_at: None,
            }],
            status: TaskStatus::Queued,
            session_id: None,
            attachments: req.attachments,
            webhook_url: req.webhook_url,
            timeout_secs: req.timeout_secs,
            metadata: req.metadata,
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
        };
        self.store.tasks.insert(task.clone()).await?;
        self.cancellations
            .insert(task.id, CancellationToken::new());

        let scheduler = Arc::clone(self);
        let task_id = task.id;
        tokio::spawn(async move {
            scheduler.run(task_id).await;
        });

        Ok(task)
    }

    /// Appends a turn to a Task. Valid against {Running, Completed}: a
    /// Completed Task is reactivated to Running and a fresh run loop is
    /// spawned for it, since the original loop already exited and tore down
    /// its Session. Cancelled/Failed remain genuinely terminal for this.
    pub async fn append_turn(self: &Arc<Self>, task_id: TaskId, prompt: String) -> Result<Task> {
        let mut task = self.store.tasks.get(task_id).await?;
        if matches!(task.status, TaskStatus::Cancelled | TaskStatus::Failed) {
            return Err(CoreError::PreconditionFailed(format!(
                "task {task_id} is already {:?}",
                task.status
            )));
        }
        let reactivate = task.status == TaskStatus::Completed;
        task.turns.push(Turn {
            prompt,
            result: None,
            started_at: None,
        });
        if reactivate {
            task.status = TaskStatus::Running;
            task.completed_at = None;
        }
        self.store.tasks.update(task.clone()).await?;

        if reactivate {
            self.cancellations.insert(task_id, CancellationToken::new());
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.run(task_id).await;
            });
        }
        Ok(task)
    }

    pub async fn get(&self, task_id: TaskId) -> Result<Task> {
        Ok(self.store.tasks.get(task_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Task>> {
        Ok(self.store.tasks.list().await?)
    }

    pub fn cancel(&self, task_id: TaskId) {
        if let Some(token) = self.cancellations.get(&task_id) {
            token.cancel();
        }
    }

    pub async fn delete(&self, task_id: TaskId) -> Result<()> {
        let task = self.store.tasks.get(task_id).await?;
        if !task.status.is_terminal() {
            return Err(CoreError::PreconditionFailed(format!(
                "task {task_id} is still {:?}",
                task.status
            )));
        }
        self.store.tasks.delete(task_id).await?;
        Ok(())
    }

    /// Clones a Failed Task into a new Queued Task referencing the prior
    /// Task's ID in its metadata, re-submitting its latest prompt.
    pub async fn retry_task(self: &Arc<Self>, task_id: TaskId) -> Result<Task> {
        let original = self.store.tasks.get(task_id).await?;
        if original.status != TaskStatus::Failed {
            return Err(CoreError::PreconditionFailed(format!(
                "task {task_id} is not failed"
            )));
        }
        let mut metadata = original.metadata.clone();
        metadata.insert("retry_of".to_string(), task_id.to_string());
        let prompt = original
            .turns
            .last()
            .map(|turn| turn.prompt.clone())
            .unwrap_or_default();
        self.create_task(CreateTaskRequest {
            agent_id: original.agent_id,
            prompt,
            attachments: original.attachments.clone(),
            webhook_url: original.webhook_url.clone(),
            timeout_secs: original.timeout_secs,
            metadata,
        })
        .await
    }

    /// Combined output of every resolved turn, newest last.
    pub async fn output(&self, task_id: TaskId) -> Result<String> {
        let task = self.store.tasks.get(task_id).await?;
        let mut combined = String::new();
        for turn in &task.turns {
            if let Some(result) = &turn.result {
                if let Some(message) = &result.message {
                    combined.push_str(message);
                    combined.push('\n');
                }
            }
        }
        Ok(combined)
    }

    pub async fn stats(&self) -> Result<TaskStats> {
        let tasks = self.store.tasks.list().await?;
        let mut stats = TaskStats {
            total: tasks.len(),
            ..Default::default()
        };
        for task in &tasks {
            match task.status {
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    /// Deletes every terminal Task, returning how many were removed.
    pub async fn cleanup(&self) -> Result<usize> {
        let tasks = self.store.tasks.list().await?;
        let mut removed = 0;
        for task in tasks {
            if task.status.is_terminal() {
                self.store.tasks.delete(task.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn run(&self, task_id: TaskId) {
        let permit = self.semaphore.clone().acquire_owned().await;
        let Ok(_permit) = permit else { return };

        let token = self
            .cancellations
            .get(&task_id)
            .map(|t| t.clone())
            .unwrap_or_default();

        if let Err(e) = self.run_inner(task_id, &token).await {
            if let Ok(mut task) = self.store.tasks.get(task_id).await {
                task.status = TaskStatus::Failed;
                task.error_message = Some(e.to_string());
                task.completed_at = Some(Utc::now());
                let _ = self.store.tasks.update(task.clone()).await;
                self.bus.publish(BusEvent::TaskStatusChanged {
                    task_id: task_id.to_string(),
                    status: "failed".to_string(),
                });
            }
        }
        self.cancellations.remove(&task_id);
    }

    async fn run_inner(&self, task_id: TaskId, token: &CancellationToken) -> Result<()> {
        let mut task = self.store.tasks.get(task_id).await?;
        task.status = TaskStatus::Running;
        self.store.tasks.update(task.clone()).await?;
        self.bus.publish(BusEvent::TaskStatusChanged {
            task_id: task_id.to_string(),
            status: "running".to_string(),
        });

        let session = self
            .sessions
            .create(CreateSessionRequest {
                agent_id: task.agent_id,
            })
            .await?;
        task.session_id = Some(session.id);
        self.store.tasks.update(task.clone()).await?;

        // Loop until every turn the store knows about (including ones
        // appended mid-run) has a result.
        loop {
            let mut task = self.store.tasks.get(task_id).await?;
            let Some(next_index) = task.turns.iter().position(|t| t.result.is_none()) else {
                break;
            };

            if token.is_cancelled() {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                self.store.tasks.update(task).await?;
                self.bus.publish(BusEvent::TaskStatusChanged {
                    task_id: task_id.to_string(),
                    status: "cancelled".to_string(),
                });
                self.teardown_session(session.id).await;
                return Ok(());
            }

            let prompt = task.turns[next_index].prompt.clone();
            task.turns[next_index].started_at = Some(Utc::now());
            self.store.tasks.update(task.clone()).await?;

            let exec_result = tokio::select! {
                result = self.sessions.exec(session.id, ExecRequest { prompt, thread_id_override: None }) => result,
                _ = token.cancelled() => {
                    task.status = TaskStatus::Cancelled;
                    task.completed_at = Some(Utc::now());
                    self.store.tasks.update(task).await?;
                    self.teardown_session(session.id).await;
                    return Ok(());
                }
            };

            let mut task = self.store.tasks.get(task_id).await?;
            match exec_result {
                Ok(execution) => {
                    task.turns[next_index].result = Some(TurnResult {
                        message: execution.message,
                        usage: execution.usage,
                        error: execution.error,
                    });
                    self.store.tasks.update(task).await?;
                }
                Err(e) => {
                    task.turns[next_index].result = Some(TurnResult {
                        message: None,
                        usage: None,
                        error: Some(e.to_string()),
                    });
                    task.status = TaskStatus::Failed;
                    task.error_message = Some(e.to_string());
                    task.completed_at = Some(Utc::now());
                    self.store.tasks.update(task).await?;
                    self.bus.publish(BusEvent::TaskStatusChanged {
                        task_id: task_id.to_string(),
                        status: "failed".to_string(),
                    });
                    self.teardown_session(session.id).await;
                    return Ok(());
                }
            }
        }

        let mut task = self.store.tasks.get(task_id).await?;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        self.store.tasks.update(task).await?;
        self.bus.publish(BusEvent::TaskStatusChanged {
            task_id: task_id.to_string(),
            status: "completed".to_string(),
        });
        self.teardown_session(session.id).await;
        Ok(())
    }

    async fn teardown_session(&self, session_id: crate::model::SessionId) {
        let _ = self.sessions.delete(session_id, true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterRegistry;
    use crate::container::{ContainerDriver, MockContainerDriver};
    use crate::model::*;
    use std::time::Duration;

    async fn seeded_scheduler() -> (Arc<TaskScheduler>, AgentId) {
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
        let workspace_root = std::env::temp_dir().join(format!("agentbox-task-test-{}", Uuid::new_v4()));
        let sessions = Arc::new(SessionManager::new(store.clone(), driver, adapters, bus.clone(), workspace_root));
        let scheduler = TaskScheduler::new(store, sessions, bus, 4);
        (scheduler, agent.id)
    }

    #[tokio::test]
    async fn create_task_fails_closed_on_unconfigured_provider() {
        let (scheduler, agent_id) = seeded_scheduler().await;
        let store = scheduler.store.clone();
        let agent = store.agents.get(agent_id).await.unwrap();
        let mut provider = store.providers.get(agent.provider_id).await.unwrap();
        provider.is_configured = false;
        store.providers.update(provider).await.unwrap();

        let err = scheduler
            .create_task(CreateTaskRequest {
                agent_id,
                prompt: "hello".to_string(),
                attachments: Vec::new(),
                webhook_url: None,
                timeout_secs: None,
                metadata: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 412);
        assert!(scheduler.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn task_runs_to_completion() {
        let (scheduler, agent_id) = seeded_scheduler().await;
        let task = scheduler
            .create_task(CreateTaskRequest {
                agent_id,
                prompt: "hello".to_string(),
                attachments: Vec::new(),
                webhook_url: None,
                timeout_secs: None,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();

        for _ in 0..50 {
            let refetched = scheduler.get(task.id).await.unwrap();
            if refetched.status.is_terminal() {
                assert_eq!(refetched.status, TaskStatus::Completed);
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task did not reach a terminal state in time");
    }

    async fn wait_for_terminal(scheduler: &Arc<TaskScheduler>, task_id: TaskId) -> Task {
        for _ in 0..50 {
            let refetched = scheduler.get(task_id).await.unwrap();
            if refetched.status.is_terminal() {
                return refetched;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task did not reach a terminal state in time");
    }

    #[tokio::test]
    async fn append_turn_reactivates_completed_task() {
        let (scheduler, agent_id) = seeded_scheduler().await;
        let task = scheduler
            .create_task(CreateTaskRequest {
                agent_id,
                prompt: "hello".to_string(),
                attachments: Vec::new(),
                webhook_url: None,
                timeout_secs: None,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();

        let completed = wait_for_terminal(&scheduler, task.id).await;
        assert_eq!(completed.status, TaskStatus::Completed);

        let appended = scheduler.append_turn(task.id, "more".to_string()).await.unwrap();
        assert_eq!(appended.turn_count(), 2);

        let refreshed = wait_for_terminal(&scheduler, task.id).await;
        assert_eq!(refreshed.status, TaskStatus::Completed);
        assert_eq!(refreshed.turn_count(), 2);
        assert!(refreshed.turns.iter().all(|t| t.result.is_some()));
    }

    #[tokio::test]
    async fn append_turn_rejected_once_cancelled_or_failed() {
        let (scheduler, agent_id) = seeded_scheduler().await;
        let task = scheduler
            .create_task(CreateTaskRequest {
                agent_id,
                prompt: "hello".to_string(),
                attachments: Vec::new(),
                webhook_url: None,
                timeout_secs: None,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        wait_for_terminal(&scheduler, task.id).await;

        let mut cancelled = scheduler.get(task.id).await.unwrap();
        cancelled.status = TaskStatus::Cancelled;
        scheduler.store.tasks.update(cancelled).await.unwrap();

        let err = scheduler
            .append_turn(task.id, "more".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 412);
    }

    #[tokio::test]
    async fn retry_task_clones_failed_task() {
        let (scheduler, agent_id) = seeded_scheduler().await;
        let task = scheduler
            .create_task(CreateTaskRequest {
                agent_id,
                prompt: "hello".to_string(),
                attachments: Vec::new(),
                webhook_url: None,
                timeout_secs: None,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        wait_for_terminal(&scheduler, task.id).await;

        let mut failed = scheduler.get(task.id).await.unwrap();
        failed.status = TaskStatus::Failed;
        scheduler.store.tasks.update(failed).await.unwrap();

        let retried = scheduler.retry_task(task.id).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Queued);
        assert_eq!(
            retried.metadata.get("retry_of").map(String::as_str),
            Some(task.id.to_string().as_str())
        );
    }
}

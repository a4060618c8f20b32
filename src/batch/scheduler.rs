use crate::error::{CoreError, Result};
use crate::eventbus::{BusEvent, EventBus};
use crate::model::{
    AgentId, Batch, BatchCounters, BatchId, BatchStatus, BatchTask, BatchTaskStatus,
};
use crate::session::{CreateSessionRequest, ExecRequest, SessionManager};
use crate::store::Store;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct CreateBatchRequest {
    pub agent_id: AgentId,
    pub name: String,
    pub prompt_template: String,
    pub inputs: Vec<HashMap<String, String>>,
    pub concurrency: usize,
    pub timeout_secs: Option<u64>,
    pub max_retries: u32,
    /// When false, the Batch is created Pending and must be explicitly
    /// started via [`BatchScheduler::start`].
    pub auto_start: bool,
}

pub type BatchStats = BatchCounters;

fn render_template(template: &str, input: &HashMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in input {
        rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
    }
    rendered
}

struct BatchControl {
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Runs one Batch's fan-out across a bounded worker pool, retrying each task
/// up to `max_retries` times before marking it Dead.
pub struct BatchScheduler {
    store: Store,
    sessions: Arc<SessionManager>,
    bus: Arc<EventBus>,
    controls: DashMap<BatchId, BatchControl>,
}

impl BatchScheduler {
    pub fn new(store: Store, sessions: Arc<SessionManager>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            store,
            sessions,
            bus,
            controls: DashMap::new(),
        })
    }

    pub async fn create_batch(self: &Arc<Self>, req: CreateBatchRequest) -> Result<Batch> {
        if req.inputs.is_empty() {
            return Err(CoreError::Validation("batch requires at least one input".into()));
        }
        let batch = Batch {
            id: Uuid::new_v4(),
            agent_id: req.agent_id,
            name: req.name,
            prompt_template: req.prompt_template.clone(),
            inputs: req.inputs.clone(),
            concurrency: req.concurrency.max(1),
            timeout_secs: req.timeout_secs,
            max_retries: req.max_retries,
            status: BatchStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.store.batches.insert(batch.clone()).await?;

        let tasks: Vec<BatchTask> = req
            .inputs
            .iter()
            .enumerate()
            .map(|(index, input)| BatchTask {
                batch_id: batch.id,
                index,
                input: input.clone(),
                prompt: render_template(&req.prompt_template, input),
                status: BatchTaskStatus::Pending,
                worker_id: None,
                attempts: 0,
                result: None,
                error: None,
                duration_ms: None,
                started_at: None,
                ended_at: None,
            })
            .collect();
        self.store.batches.insert_tasks(tasks).await?;

        self.controls.insert(
            batch.id,
            BatchControl {
                paused: Arc::new(AtomicBool::new(false)),
                cancel: CancellationToken::new(),
            },
        );

        if req.auto_start {
            let scheduler = Arc::clone(self);
            let batch_id = batch.id;
            tokio::spawn(async move {
                scheduler.run(batch_id).await;
            });
        }

        Ok(batch)
    }

    /// Starts a Pending or Paused Batch. For Paused, this delegates to
    /// [`Self::resume`] (the worker pool is already running, just idling);
    /// for Pending, it spawns the worker pool for the first time.
    pub async fn start(self: &Arc<Self>, batch_id: BatchId) -> Result<()> {
        let batch = self.store.batches.get(batch_id).await?;
        match batch.status {
            BatchStatus::Paused => self.resume(batch_id).await,
            BatchStatus::Pending => {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move {
                    scheduler.run(batch_id).await;
                });
                Ok(())
            }
            _ => Err(CoreError::PreconditionFailed(format!(
                "batch {batch_id} is not pending or paused"
            ))),
        }
    }

    pub async fn get(&self, batch_id: BatchId) -> Result<Batch> {
        Ok(self.store.batches.get(batch_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Batch>> {
        Ok(self.store.batches.list().await?)
    }

    pub async fn list_tasks(&self, batch_id: BatchId) -> Result<Vec<BatchTask>> {
        Ok(self.store.batches.list_tasks(batch_id).await?)
    }

    pub async fn stats(&self, batch_id: BatchId) -> Result<BatchStats> {
        let tasks = self.store.batches.list_tasks(batch_id).await?;
        let mut counters = BatchCounters {
            total: tasks.len(),
            ..Default::default()
        };
        for task in &tasks {
            match task.status {
                BatchTaskStatus::Completed => counters.completed += 1,
                BatchTaskStatus::Failed => counters.failed += 1,
                BatchTaskStatus::Dead => counters.dead += 1,
                BatchTaskStatus::Pending => counters.pending += 1,
                BatchTaskStatus::Running => counters.running += 1,
            }
        }

        let mut durations: Vec<u64> = tasks.iter().filter_map(|t| t.duration_ms).collect();
        if !durations.is_empty() {
            durations.sort_unstable();
            let sum: u64 = durations.iter().sum();
            counters.avg_duration_ms = Some(sum as f64 / durations.len() as f64);
            counters.p50_duration_ms = Some(percentile(&durations, 50));
            counters.p95_duration_ms = Some(percentile(&durations, 95));
        }

        Ok(counters)
    }

    /// Re-queues every Failed task in a Batch that isn't mid-retry (a Batch
    /// settles with no Failed tasks in steady state, but this covers a
    /// Batch that was cancelled mid-retry loop).
    pub async fn retry_failed(self: &Arc<Self>, batch_id: BatchId) -> Result<usize> {
        self.retry_tasks_with_status(batch_id, BatchTaskStatus::Failed).await
    }

    /// Re-queues every Dead (retries-exhausted) task in a Batch, resetting
    /// its attempt counter so it gets `max_retries` fresh attempts.
    pub async fn retry_dead_tasks(self: &Arc<Self>, batch_id: BatchId) -> Result<usize> {
        self.retry_tasks_with_status(batch_id, BatchTaskStatus::Dead).await
    }

    async fn retry_tasks_with_status(
        self: &Arc<Self>,
        batch_id: BatchId,
        status: BatchTaskStatus,
    ) -> Result<usize> {
        let batch = self.store.batches.get(batch_id).await?;
        let tasks = self.store.batches.list_tasks(batch_id).await?;
        let mut retried = 0;
        for mut task in tasks.into_iter().filter(|t| t.status == status) {
            task.status = BatchTaskStatus::Pending;
            task.attempts = 0;
            task.error = None;
            task.result = None;
            task.duration_ms = None;
            task.started_at = None;
            task.ended_at = None;
            self.store.batches.update_task(task).await?;
            retried += 1;
        }
        if retried == 0 {
            return Ok(0);
        }

        if !matches!(batch.status, BatchStatus::Running) {
            let mut batch = batch;
            batch.status = BatchStatus::Running;
            batch.completed_at = None;
            self.store.batches.update(batch).await?;
        }
        self.controls.insert(
            batch_id,
            BatchControl {
                paused: Arc::new(AtomicBool::new(false)),
                cancel: CancellationToken::new(),
            },
        );
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_retry(batch_id).await;
        });
        Ok(retried)
    }

    /// Like `run` but only picks up tasks left Pending by a retry pass,
    /// rather than re-running the whole fan-out from scratch.
    async fn run_retry(&self, batch_id: BatchId) {
        let Ok(mut batch) = self.store.batches.get(batch_id).await else {
            return;
        };
        batch.started_at.get_or_insert(Utc::now());
        let _ = self.store.batches.update(batch.clone()).await;
        self.bus.publish(BusEvent::BatchStatusChanged {
            batch_id: batch_id.to_string(),
            status: "running".to_string(),
        });

        let Some(control) = self
            .controls
            .get(&batch_id)
            .map(|c| (Arc::clone(&c.paused), c.cancel.clone()))
        else {
            return;
        };
        let (paused, cancel_token) = control;

        let Ok(tasks) = self.store.batches.list_tasks(batch_id).await else {
            return;
        };
        let pending: Vec<BatchTask> = tasks
            .into_iter()
            .filter(|t| t.status == BatchTaskStatus::Pending)
            .collect();

        let semaphore = Arc::new(Semaphore::new(batch.concurrency));
        let mut handles = Vec::new();
        for task in pending {
            let semaphore = Arc::clone(&semaphore);
            let paused = Arc::clone(&paused);
            let cancel_token = cancel_token.clone();
            let sessions = Arc::clone(&self.sessions);
            let store = self.store.clone();
            let bus = Arc::clone(&self.bus);
            let agent_id = batch.agent_id;
            let max_retries = batch.max_retries;
            handles.push(tokio::spawn(async move {
                while paused.load(Ordering::SeqCst) && !cancel_token.is_cancelled() {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                if cancel_token.is_cancelled() {
                    return;
                }
                let Ok(permit) = semaphore.acquire_owned().await else {
                    return;
                };
                run_one_task(&store, &sessions, &bus, agent_id, task, max_retries, &cancel_token)
                    .await;
                drop(permit);
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        self.finish_run(batch_id).await;
    }

    /// Writes every BatchTask row out as CSV. No header quoting beyond the
    /// minimal comma/quote/newline escaping CSV requires.
    pub async fn export_csv(&self, batch_id: BatchId) -> Result<String> {
        let tasks = self.store.batches.list_tasks(batch_id).await?;
        let mut out = String::from("index,status,attempts,duration_ms,result,error\n");
        for task in &tasks {
            out.push_str(&format!(
                "{},{},{},{},{},{}\n",
                task.index,
                csv_escape(&format!("{:?}", task.status)),
                task.attempts,
                task.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
                csv_escape(task.result.as_deref().unwrap_or("")),
                csv_escape(task.error.as_deref().unwrap_or("")),
            ));
        }
        Ok(out)
    }

    pub async fn export_json(&self, batch_id: BatchId) -> Result<Vec<BatchTask>> {
        Ok(self.store.batches.list_tasks(batch_id).await?)
    }

    pub async fn list_dead_tasks(&self, batch_id: BatchId) -> Result<Vec<BatchTask>> {
        Ok(self
            .store
            .batches
            .list_tasks(batch_id)
            .await?
            .into_iter()
            .filter(|t| t.status == BatchTaskStatus::Dead)
            .collect())
    }

    /// Called once at server startup: any Batch left `Running` from a prior
    /// process (its worker pool died with the process, so nothing will ever
    /// move its tasks forward again) is marked `Failed` rather than left to
    /// look alive forever.
    pub async fn recover_stale_running(&self) -> Result<usize> {
        let batches = self.store.batches.list().await?;
        let mut recovered = 0;
        for mut batch in batches.into_iter().filter(|b| b.status == BatchStatus::Running) {
            batch.status = BatchStatus::Failed;
            batch.completed_at = Some(Utc::now());
            self.store.batches.update(batch.clone()).await?;
            self.bus.publish(BusEvent::BatchStatusChanged {
                batch_id: batch.id.to_string(),
                status: "failed".to_string(),
            });
            recovered += 1;
        }
        Ok(recovered)
    }

    pub async fn pause(&self, batch_id: BatchId) -> Result<()> {
        let mut batch = self.store.batches.get(batch_id).await?;
        if batch.status != BatchStatus::Running {
            return Err(CoreError::PreconditionFailed(format!(
                "batch {batch_id} is not running"
            )));
        }
        if let Some(control) = self.controls.get(&batch_id) {
            control.paused.store(true, Ordering::SeqCst);
        }
        batch.status = BatchStatus::Paused;
        self.store.batches.update(batch).await?;
        Ok(())
    }

    pub async fn resume(self: &Arc<Self>, batch_id: BatchId) -> Result<()> {
        let mut batch = self.store.batches.get(batch_id).await?;
        if batch.status != BatchStatus::Paused {
            return Err(CoreError::PreconditionFailed(format!(
                "batch {batch_id} is not paused"
            )));
        }
        if let Some(control) = self.controls.get(&batch_id) {
            control.paused.store(false, Ordering::SeqCst);
        }
        batch.status = BatchStatus::Running;
        self.store.batches.update(batch).await?;
        Ok(())
    }

    pub async fn cancel(&self, batch_id: BatchId) -> Result<()> {
        let mut batch = self.store.batches.get(batch_id).await?;
        if let Some(control) = self.controls.get(&batch_id) {
            control.cancel.cancel();
        }
        batch.status = BatchStatus::Cancelled;
        batch.completed_at = Some(Utc::now());
        self.store.batches.update(batch).await?;
        self.bus.publish(BusEvent::BatchStatusChanged {
            batch_id: batch_id.to_string(),
            status: "cancelled".to_string(),
        });
        Ok(())
    }

    async fn run(&self, batch_id: BatchId) {
        let Ok(mut batch) = self.store.batches.get(batch_id).await else {
            return;
        };
        batch.status = BatchStatus::Running;
        batch.started_at = Some(Utc::now());
        if self.store.batches.update(batch.clone()).await.is_err() {
            return;
        }
        self.bus.publish(BusEvent::BatchStatusChanged {
            batch_id: batch_id.to_string(),
            status: "running".to_string(),
        });

        let Some(control) = self.controls.get(&batch_id).map(|c| {
            (Arc::clone(&c.paused), c.cancel.clone())
        }) else {
            return;
        };
        let (paused, cancel_token) = control;

        let Ok(tasks) = self.store.batches.list_tasks(batch_id).await else {
            return;
        };
        let semaphore = Arc::new(Semaphore::new(batch.concurrency));
        let mut handles = Vec::new();

        for task in tasks {
            let semaphore = Arc::clone(&semaphore);
            let paused = Arc::clone(&paused);
            let cancel_token = cancel_token.clone();
            let sessions = Arc::clone(&self.sessions);
            let store = self.store.clone();
            let bus = Arc::clone(&self.bus);
            let agent_id = batch.agent_id;
            let max_retries = batch.max_retries;

            handles.push(tokio::spawn(async move {
                while paused.load(Ordering::SeqCst) && !cancel_token.is_cancelled() {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                if cancel_token.is_cancelled() {
                    return;
                }
                let Ok(permit) = semaphore.acquire_owned().await else {
                    return;
                };
                run_one_task(&store, &sessions, &bus, agent_id, task, max_retries, &cancel_token)
                    .await;
                drop(permit);
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        self.finish_run(batch_id).await;
    }

    /// A Batch is Completed iff every BatchTask ended in {Completed, Dead} —
    /// dead-letter tasks do not count as a batch failure, since exhausting
    /// retries is a terminal-but-successful outcome for that task. Only a
    /// task left Pending/Running/Failed after every worker handle has
    /// joined (which shouldn't happen outside cancellation) marks the Batch
    /// Failed instead.
    async fn finish_run(&self, batch_id: BatchId) {
        let mut batch = match self.store.batches.get(batch_id).await {
            Ok(b) => b,
            Err(_) => return,
        };
        if batch.status == BatchStatus::Cancelled {
            return;
        }
        let stats = self.stats(batch_id).await.unwrap_or_default();
        batch.status = if stats.pending == 0 && stats.running == 0 && stats.failed == 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::Failed
        };
        batch.completed_at = Some(Utc::now());
        let _ = self.store.batches.update(batch.clone()).await;
        self.bus.publish(BusEvent::BatchStatusChanged {
            batch_id: batch_id.to_string(),
            status: format!("{:?}", batch.status).to_lowercase(),
        });
    }
}

fn percentile(sorted: &[u64], pct: u64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct as usize * (sorted.len() - 1)) / 100;
    sorted[rank]
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

async fn run_one_task(
    store: &Store,
    sessions: &Arc<SessionManager>,
    bus: &Arc<EventBus>,
    agent_id: AgentId,
    mut task: BatchTask,
    max_retries: u32,
    cancel_token: &CancellationToken,
) {
    loop {
        if cancel_token.is_cancelled() {
            return;
        }
        task.status = BatchTaskStatus::Running;
        task.attempts += 1;
        task.started_at = Some(Utc::now());
        let _ = store.batches.update_task(task.clone()).await;
        bus.publish(BusEvent::BatchTaskStatusChanged {
            batch_id: task.batch_id.to_string(),
            index: task.index,
            status: "running".to_string(),
        });

        let outcome = run_single_attempt(sessions, agent_id, &task.prompt).await;
        task.ended_at = Some(Utc::now());
        if let (Some(started), Some(ended)) = (task.started_at, task.ended_at) {
            task.duration_ms = Some((ended - started).num_milliseconds().max(0) as u64);
        }

        match outcome {
            Ok(message) => {
                task.status = BatchTaskStatus::Completed;
                task.result = Some(message);
                task.error = None;
                let _ = store.batches.update_task(task.clone()).await;
                bus.publish(BusEvent::BatchTaskStatusChanged {
                    batch_id: task.batch_id.to_string(),
                    index: task.index,
                    status: "completed".to_string(),
                });
                return;
            }
            Err(e) => {
                task.error = Some(e.to_string());
                if task.attempts > max_retries {
                    task.status = BatchTaskStatus::Dead;
                    let _ = store.batches.update_task(task.clone()).await;
                    bus.publish(BusEvent::BatchTaskStatusChanged {
                        batch_id: task.batch_id.to_string(),
                        index: task.index,
                        status: "dead".to_string(),
                    });
                    return;
                }
                task.status = BatchTaskStatus::Failed;
                let _ = store.batches.update_task(task.clone()).await;
                bus.publish(BusEvent::BatchTaskStatusChanged {
                    batch_id: task.batch_id.to_string(),
                    index: task.index,
                    status: "failed".to_string(),
                });
            }
        }
    }
}

async fn run_single_attempt(
    sessions: &Arc<SessionManager>,
    agent_id: AgentId,
    prompt: &str,
) -> Result<String> {
    let session = sessions
        .create(CreateSessionRequest { agent_id })
        .await?;
    let exec_result = sessions
        .exec(
            session.id,
            ExecRequest {
                prompt: prompt.to_string(),
                thread_id_override: None,
            },
        )
        .await;
    let _ = sessions.delete(session.id, true).await;

    let execution = exec_result?;
    if let Some(error) = execution.error {
        return Err(CoreError::Internal(error));
    }
    Ok(execution.message.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterRegistry;
    use crate::container::{ContainerDriver, MockContainerDriver};
    use crate::model::*;
    use std::time::Duration;

    async fn seeded_scheduler() -> (Arc<BatchScheduler>, AgentId) {
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
        let workspace_root = std::env::temp_dir().join(format!("agentbox-batch-test-{}", Uuid::new_v4()));
        let sessions = Arc::new(SessionManager::new(store.clone(), driver, adapters, bus.clone(), workspace_root));
        let scheduler = BatchScheduler::new(store, sessions, bus);
        (scheduler, agent.id)
    }

    fn input(value: &str) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("x".to_string(), value.to_string());
        map
    }

    #[tokio::test]
    async fn batch_runs_all_tasks_to_completion() {
        let (scheduler, agent_id) = seeded_scheduler().await;
        let batch = scheduler
            .create_batch(CreateBatchRequest {
                agent_id,
                name: "b1".to_string(),
                prompt_template: "say {{x}}".to_string(),
                inputs: vec![input("a"), input("b"), input("c")],
                concurrency: 2,
                timeout_secs: None,
                max_retries: 1,
                auto_start: true,
            })
            .await
            .unwrap();

        for _ in 0..100 {
            let refetched = scheduler.get(batch.id).await.unwrap();
            if matches!(
                refetched.status,
                BatchStatus::Completed | BatchStatus::Failed
            ) {
                assert_eq!(refetched.status, BatchStatus::Completed);
                let stats = scheduler.stats(batch.id).await.unwrap();
                assert_eq!(stats.completed, 3);
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("batch did not complete in time");
    }

    #[tokio::test]
    async fn empty_inputs_rejected() {
        let (scheduler, agent_id) = seeded_scheduler().await;
        let err = scheduler
            .create_batch(CreateBatchRequest {
                agent_id,
                name: "empty".to_string(),
                prompt_template: "x".to_string(),
                inputs: Vec::new(),
                concurrency: 1,
                timeout_secs: None,
                max_retries: 0,
                auto_start: true,
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn batch_with_dead_letter_tasks_still_completes() {
        let (scheduler, agent_id) = seeded_scheduler().await;
        let batch = scheduler
            .create_batch(CreateBatchRequest {
                agent_id,
                name: "b-dead".to_string(),
                prompt_template: "say {{x}}".to_string(),
                inputs: vec![input("a")],
                concurrency: 1,
                timeout_secs: None,
                max_retries: 0,
                auto_start: false,
            })
            .await
            .unwrap();

        // simulate the one task exhausting its retries without waiting on a
        // real failing exec.
        let mut task = scheduler.list_tasks(batch.id).await.unwrap().remove(0);
        task.status = BatchTaskStatus::Dead;
        task.attempts = 1;
        scheduler.store.batches.update_task(task).await.unwrap();

        scheduler.finish_run(batch.id).await;
        let refetched = scheduler.get(batch.id).await.unwrap();
        assert_eq!(refetched.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn create_batch_without_auto_start_stays_pending() {
        let (scheduler, agent_id) = seeded_scheduler().await;
        let batch = scheduler
            .create_batch(CreateBatchRequest {
                agent_id,
                name: "pending".to_string(),
                prompt_template: "say {{x}}".to_string(),
                inputs: vec![input("a")],
                concurrency: 1,
                timeout_secs: None,
                max_retries: 0,
                auto_start: false,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let refetched = scheduler.get(batch.id).await.unwrap();
        assert_eq!(refetched.status, BatchStatus::Pending);

        scheduler.start(batch.id).await.unwrap();
        for _ in 0..100 {
            let refetched = scheduler.get(batch.id).await.unwrap();
            if matches!(refetched.status, BatchStatus::Completed | BatchStatus::Failed) {
                assert_eq!(refetched.status, BatchStatus::Completed);
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("batch did not complete after start()");
    }

    #[tokio::test]
    async fn export_csv_includes_every_task() {
        let (scheduler, agent_id) = seeded_scheduler().await;
        let batch = scheduler
            .create_batch(CreateBatchRequest {
                agent_id,
                name: "export".to_string(),
                prompt_template: "say {{x}}".to_string(),
                inputs: vec![input("a"), input("b")],
                concurrency: 2,
                timeout_secs: None,
                max_retries: 1,
                auto_start: true,
            })
            .await
            .unwrap();

        for _ in 0..100 {
            let refetched = scheduler.get(batch.id).await.unwrap();
            if matches!(refetched.status, BatchStatus::Completed | BatchStatus::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let csv = scheduler.export_csv(batch.id).await.unwrap();
        assert!(csv.starts_with("index,status,attempts,duration_ms,result,error\n"));
        assert_eq!(csv.lines().count(), 3); // header + 2 tasks

        let json = scheduler.export_json(batch.id).await.unwrap();
        assert_eq!(json.len(), 2);
    }

    #[tokio::test]
    async fn recover_stale_running_marks_orphaned_batches_failed() {
        let (scheduler, agent_id) = seeded_scheduler().await;
        let batch = scheduler
            .create_batch(CreateBatchRequest {
                agent_id,
                name: "orphan".to_string(),
                prompt_template: "say {{x}}".to_string(),
                inputs: vec![input("a")],
                concurrency: 1,
                timeout_secs: None,
                max_retries: 0,
                auto_start: false,
            })
            .await
            .unwrap();
        let mut stuck = scheduler.get(batch.id).await.unwrap();
        stuck.status = BatchStatus::Running;
        scheduler.store.batches.update(stuck).await.unwrap();

        let recovered = scheduler.recover_stale_running().await.unwrap();
        assert_eq!(recovered, 1);
        let refetched = scheduler.get(batch.id).await.unwrap();
        assert_eq!(refetched.status, BatchStatus::Failed);
    }
}

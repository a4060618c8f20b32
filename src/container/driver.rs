//! The capability interface the rest of the core depends on.
//!
//! [`ContainerDriver`] is deliberately narrow: Create/Start/Stop/Remove/Exec/
//! ExecStream/CopyTo/Inspect/ListContainers/ListImages/PullImage/RemoveImage/
//! Logs/Ping. [`RealContainerDriver`] backs it with [`ContainerOrchestrator`]
//! (bollard); [`MockContainerDriver`] backs it with an in-memory map so the
//! Session Manager, Task Scheduler, and Batch Scheduler can be exercised in
//! tests without a running Docker/Podman daemon.

use super::{
    ContainerConfig, ContainerError, ContainerOrchestrator, ContainerOrchestratorConfig,
    ContainerSummary, ExecConfig, ExecEvent, ExecOutput, ImageInfo, Result,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_stream::wrappers::ReceiverStream;

/// Everything needed to create a container, mirroring §4.1's `Create(spec)`.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Option<Vec<String>>,
    pub env: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub cpu_cores: Option<f64>,
    pub memory_bytes: Option<i64>,
    pub labels: HashMap<String, String>,
    pub network_mode: Option<String>,
    pub working_dir: Option<String>,
}

/// One bind mount: host path -> container path.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// Result of [`ContainerDriver::inspect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InspectResult {
    pub exists: bool,
    pub running: bool,
}

/// Capability interface over a container engine. Implementations are
/// interchangeable at construction time: a real bollard-backed client in
/// production, an in-memory mock in tests.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn create(&self, spec: &ContainerSpec, name: Option<&str>) -> Result<String>;
    async fn start(&self, container_id: &str) -> Result<()>;
    /// Idempotent: stopping an already-stopped container succeeds.
    async fn stop(&self, container_id: &str) -> Result<()>;
    async fn remove(&self, container_id: &str, force: bool) -> Result<()>;
    async fn exec(&self, container_id: &str, argv: &[String]) -> Result<ExecOutput>;
    async fn exec_stream(
        &self,
        container_id: &str,
        argv: &[String],
    ) -> Result<ReceiverStream<Result<ExecEvent>>>;
    async fn copy_to(&self, container_id: &str, host_path: &Path, container_path: &str)
        -> Result<()>;
    async fn inspect(&self, container_id: &str) -> Result<InspectResult>;
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>>;
    async fn list_images(&self) -> Result<Vec<ImageInfo>>;
    async fn pull_image(&self, image: &str) -> Result<()>;
    async fn remove_image(&self, image: &str, force: bool) -> Result<()>;
    async fn logs(&self, container_id: &str, tail: Option<&str>) -> Result<String>;
    /// Probes engine availability. The only retriable-without-action failure.
    async fn ping(&self) -> Result<()>;
}

fn to_container_config(spec: &ContainerSpec) -> std::result::Result<ContainerConfig, ContainerError> {
    let mut builder = ContainerConfig::builder().image(&spec.image);
    if let Some(cmd) = &spec.command {
        builder = builder.cmd(cmd.clone());
    }
    if let Some(dir) = &spec.working_dir {
        builder = builder.working_dir(dir);
    }
    for (k, v) in &spec.env {
        builder = builder.env(k, v);
    }
    for (k, v) in &spec.labels {
        builder = builder.label(k, v);
    }
    for mount in &spec.mounts {
        let mode = if mount.read_only { "ro" } else { "rw" };
        builder = builder.bind(format!(
            "{}:{}:{}",
            mount.host.display(),
            mount.container,
            mode
        ));
    }
    if let Some(mem) = spec.memory_bytes {
        builder = builder.memory_limit(mem);
    }
    if let Some(cores) = spec.cpu_cores {
        // bollard's CpuQuota is in microseconds per 100ms period.
        builder = builder.cpu_quota((cores * 100_000.0) as i64);
    }
    if let Some(mode) = &spec.network_mode {
        builder = builder.network_mode(mode.clone());
    }
    builder.build()
}

/// Real, bollard-backed implementation of [`ContainerDriver`].
pub struct RealContainerDriver {
    orchestrator: ContainerOrchestrator,
}

impl RealContainerDriver {
    pub async fn new() -> Result<Self> {
        Ok(Self {
            orchestrator: ContainerOrchestrator::with_config(ContainerOrchestratorConfig::default())
                .await?,
        })
    }
}

#[async_trait]
impl ContainerDriver for RealContainerDriver {
    async fn create(&self, spec: &ContainerSpec, name: Option<&str>) -> Result<String> {
        let config = to_container_config(spec)?;
        self.orchestrator.create_container(&config, name).await
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.orchestrator.start_container(container_id).await
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        match self.orchestrator.stop_container(container_id).await {
            Ok(()) => Ok(()),
            // Stopping an already-stopped container must be idempotent.
            Err(ContainerError::ApiError(bollard::errors::Error::DockerResponseServerError {
                status_code: 304,
                ..
            })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        self.orchestrator.remove_container(container_id, force).await
    }

    async fn exec(&self, container_id: &str, argv: &[String]) -> Result<ExecOutput> {
        let config = ExecConfig::builder()
            .cmd(argv.to_vec())
            .attach_stdout(true)
            .attach_stderr(true)
            .build();
        self.orchestrator.exec_with_config(container_id, &config).await
    }

    async fn exec_stream(
        &self,
        container_id: &str,
        argv: &[String],
    ) -> Result<ReceiverStream<Result<ExecEvent>>> {
        let config = ExecConfig::builder()
            .cmd(argv.to_vec())
            .attach_stdout(true)
            .attach_stderr(true)
            .build();
        self.orchestrator.exec_stream(container_id, &config).await
    }

    async fn copy_to(
        &self,
        container_id: &str,
        host_path: &Path,
        container_path: &str,
    ) -> Result<()> {
        self.orchestrator
            .copy_to(container_id, host_path, container_path)
            .await
    }

    async fn inspect(&self, container_id: &str) -> Result<InspectResult> {
        self.orchestrator.inspect(container_id).await
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        self.orchestrator.list_containers(all).await
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        self.orchestrator.list_images().await
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.orchestrator.ensure_image(image).await
    }

    async fn remove_image(&self, image: &str, force: bool) -> Result<()> {
        self.orchestrator.remove_image(image, force).await
    }

    async fn logs(&self, container_id: &str, tail: Option<&str>) -> Result<String> {
        self.orchestrator.logs(container_id, tail).await
    }

    async fn ping(&self) -> Result<()> {
        self.orchestrator.client().ping().await
    }
}

#[derive(Debug, Clone)]
struct MockContainer {
    spec: ContainerSpec,
    running: bool,
}

/// In-memory [`ContainerDriver`] used by unit and integration tests. Exec
/// always succeeds with empty output unless a canned response is installed
/// via [`MockContainerDriver::set_exec_response`].
pub struct MockContainerDriver {
    containers: Arc<RwLock<HashMap<String, MockContainer>>>,
    exec_responses: Arc<RwLock<HashMap<String, ExecOutput>>>,
    fail_pull: Arc<RwLock<bool>>,
}

impl Default for MockContainerDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockContainerDriver {
    pub fn new() -> Self {
        Self {
            containers: Arc::new(RwLock::new(HashMap::new())),
            exec_responses: Arc::new(RwLock::new(HashMap::new())),
            fail_pull: Arc::new(RwLock::new(false)),
        }
    }

    /// Install a canned response for the next `exec` calls against any container.
    pub async fn set_exec_response(&self, argv_key: &str, output: ExecOutput) {
        self.exec_responses
            .write()
            .await
            .insert(argv_key.to_string(), output);
    }

    /// Make the next `pull_image` call fail with `ImageNotFound`.
    pub async fn set_fail_pull(&self, fail: bool) {
        *self.fail_pull.write().await = fail;
    }

    pub async fn container_count(&self) -> usize {
        self.containers.read().await.len()
    }
}

#[async_trait]
impl ContainerDriver for MockContainerDriver {
    async fn create(&self, spec: &ContainerSpec, name: Option<&str>) -> Result<String> {
        let id = name
            .map(String::from)
            .unwrap_or_else(|| format!("mock-{}", uuid::Uuid::new_v4()));
        self.containers.write().await.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        let mut guard = self.containers.write().await;
        let c = guard
            .get_mut(container_id)
            .ok_or_else(|| ContainerError::NotFound(container_id.to_string()))?;
        c.running = true;
        Ok(())
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        if let Some(c) = self.containers.write().await.get_mut(container_id) {
            c.running = false;
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str, _force: bool) -> Result<()> {
        self.containers.write().await.remove(container_id);
        Ok(())
    }

    async fn exec(&self, container_id: &str, argv: &[String]) -> Result<ExecOutput> {
        if !self
            .containers
            .read()
            .await
            .get(container_id)
            .map(|c| c.running)
            .unwrap_or(false)
        {
            return Err(ContainerError::NotFound(container_id.to_string()));
        }
        let key = argv.join(" ");
        if let Some(output) = self.exec_responses.read().await.get(&key) {
            return Ok(output.clone());
        }
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    async fn exec_stream(
        &self,
        container_id: &str,
        argv: &[String],
    ) -> Result<ReceiverStream<Result<ExecEvent>>> {
        let output = self.exec(container_id, argv).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        if !output.stdout.is_empty() {
            let _ = tx.send(Ok(ExecEvent::Stdout(output.stdout.into_bytes()))).await;
        }
        if !output.stderr.is_empty() {
            let _ = tx.send(Ok(ExecEvent::Stderr(output.stderr.into_bytes()))).await;
        }
        let _ = tx.send(Ok(ExecEvent::Exit(output.exit_code))).await;
        Ok(ReceiverStream::new(rx))
    }

    async fn copy_to(&self, container_id: &str, _host_path: &Path, _container_path: &str) -> Result<()> {
        if !self.containers.read().await.contains_key(container_id) {
            return Err(ContainerError::NotFound(container_id.to_string()));
        }
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<InspectResult> {
        let guard = self.containers.read().await;
        Ok(match guard.get(container_id) {
            Some(c) => InspectResult {
                exists: true,
                running: c.running,
            },
            None => InspectResult {
                exists: false,
                running: false,
            },
        })
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let guard = self.containers.read().await;
        Ok(guard
            .iter()
            .filter(|(_, c)| all || c.running)
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                names: vec![id.clone()],
                image: c.spec.image.clone(),
                state: if c.running { "running" } else { "exited" }.to_string(),
                status: if c.running { "running" } else { "exited" }.to_string(),
            })
            .collect())
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        Ok(Vec::new())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if *self.fail_pull.read().await {
            return Err(ContainerError::ImageNotFound(image.to_string()));
        }
        Ok(())
    }

    async fn remove_image(&self, _image: &str, _force: bool) -> Result<()> {
        Ok(())
    }

    async fn logs(&self, container_id: &str, _tail: Option<&str>) -> Result<String> {
        if !self.containers.read().await.contains_key(container_id) {
            return Err(ContainerError::NotFound(container_id.to_string()));
        }
        Ok(String::new())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            image: "alpine:latest".to_string(),
            command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: HashMap::new(),
            mounts: Vec::new(),
            cpu_cores: None,
            memory_bytes: None,
            labels: HashMap::new(),
            network_mode: None,
            working_dir: Some("/workspace".to_string()),
        }
    }

    #[tokio::test]
    async fn mock_lifecycle() {
        let driver = MockContainerDriver::new();
        let id = driver.create(&spec(), Some("test-1")).await.unwrap();
        assert_eq!(driver.inspect(&id).await.unwrap().running, false);

        driver.start(&id).await.unwrap();
        assert!(driver.inspect(&id).await.unwrap().running);

        // Stop is idempotent.
        driver.stop(&id).await.unwrap();
        driver.stop(&id).await.unwrap();
        assert!(!driver.inspect(&id).await.unwrap().running);

        driver.remove(&id, true).await.unwrap();
        assert!(!driver.inspect(&id).await.unwrap().exists);
    }

    #[tokio::test]
    async fn exec_against_stopped_container_fails() {
        let driver = MockContainerDriver::new();
        let id = driver.create(&spec(), None).await.unwrap();
        let err = driver.exec(&id, &["echo".to_string()]).await.unwrap_err();
        assert!(matches!(err, ContainerError::NotFound(_)));
    }

    #[tokio::test]
    async fn pull_image_can_be_made_to_fail() {
        let driver = MockContainerDriver::new();
        driver.set_fail_pull(true).await;
        let err = driver.pull_image("whatever:latest").await.unwrap_err();
        assert!(matches!(err, ContainerError::ImageNotFound(_)));
    }
}

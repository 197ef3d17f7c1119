use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use log::{info, warn};
use tokio::sync::Semaphore;

pub mod model;
pub mod port;
pub mod status;
pub mod workspace;

use crate::errors::DeployError;
use model::{DeploymentOutcome, DeploymentRequest, DeploymentStatus, ResourceLimits};
use port::{ContainerRuntime, ImageBuilder};
use status::StatusStore;
use workspace::WorkspaceManager;

/// Receives build-log lines as the daemon emits them. The pipeline never
/// buffers the full build output.
pub trait BuildObserver: Send + Sync {
    fn build_log(&self, line: &str);
}

/// Default observer: forward build output to the process log.
pub struct LogObserver;

impl BuildObserver for LogObserver {
    fn build_log(&self, line: &str) {
        info!("build => {}", line);
    }
}

pub struct PipelineOptions {
    pub build_timeout: Duration,
    pub start_timeout: Duration,
    pub max_concurrent_deployments: usize,
    pub keep_workspace_after_success: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            build_timeout: Duration::from_secs(600),
            start_timeout: Duration::from_secs(30),
            max_concurrent_deployments: 2,
            keep_workspace_after_success: true,
        }
    }
}

/// One async mutex per bot id. Two deployments for the same bot share a
/// workspace directory and a retirement name, so they must not interleave.
#[derive(Default)]
struct BotLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BotLocks {
    async fn acquire(&self, bot_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("bot lock map poisoned");
            locks.entry(bot_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Sequences one deployment: workspace, image build, container replacement,
/// container start. Owns the status transitions and the failure cleanup.
pub struct DeploymentService {
    pub workspace: WorkspaceManager,
    pub builder: Box<dyn ImageBuilder + Send + Sync>,
    pub runtime: Box<dyn ContainerRuntime + Send + Sync>,
    pub status: Arc<StatusStore>,
    pub observer: Box<dyn BuildObserver>,
    limits: ResourceLimits,
    options: PipelineOptions,
    deploy_slots: Semaphore,
    bot_locks: BotLocks,
}

impl DeploymentService {
    pub fn new(
        workspace: WorkspaceManager,
        builder: Box<dyn ImageBuilder + Send + Sync>,
        runtime: Box<dyn ContainerRuntime + Send + Sync>,
        status: Arc<StatusStore>,
        observer: Box<dyn BuildObserver>,
        options: PipelineOptions,
    ) -> Self {
        let deploy_slots = Semaphore::new(options.max_concurrent_deployments);
        Self {
            workspace,
            builder,
            runtime,
            status,
            observer,
            limits: ResourceLimits::default(),
            options,
            deploy_slots,
            bot_locks: BotLocks::default(),
        }
    }

    /// Run the full pipeline for one request. Returns only once the
    /// deployment has reached a terminal status.
    pub async fn deploy(
        &self,
        request: DeploymentRequest,
    ) -> Result<DeploymentOutcome, DeployError> {
        // Rejected before any record exists.
        request.validate()?;
        self.status
            .set(&request.deployment_id, DeploymentStatus::Started);

        let _slot = self
            .deploy_slots
            .acquire()
            .await
            .expect("deployment semaphore closed");
        let _bot = self.bot_locks.acquire(&request.bot_id).await;

        match self.run_stages(&request).await {
            Ok(outcome) => {
                self.status.set(
                    &request.deployment_id,
                    DeploymentStatus::Completed(outcome.clone()),
                );
                if !self.options.keep_workspace_after_success {
                    self.workspace.release(&request.bot_id).await;
                }
                info!(
                    "Deployment {} completed, container {}",
                    request.deployment_id, outcome.container_id
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!("Deployment {} failed: {}", request.deployment_id, err);
                self.status
                    .set(&request.deployment_id, DeploymentStatus::Failed(err.to_string()));
                // The workspace purge runs unconditionally at the head of
                // acquire, so any stage failure may leave a directory behind.
                self.workspace.release(&request.bot_id).await;
                Err(err)
            }
        }
    }

    async fn run_stages(
        &self,
        request: &DeploymentRequest,
    ) -> Result<DeploymentOutcome, DeployError> {
        let context = self
            .workspace
            .acquire(&request.bot_id, &request.repository, &request.branch)
            .await?;

        let image_tag = request.image_tag();
        info!("Building image {}", image_tag);
        let build = async {
            let mut lines = self.builder.build(&context, &image_tag).await?;
            while let Some(line) = lines.next().await {
                self.observer.build_log(&line?);
            }
            Ok::<(), DeployError>(())
        };
        tokio::time::timeout(self.options.build_timeout, build)
            .await
            .map_err(|_| {
                DeployError::Build(format!(
                    "timed out after {}s",
                    self.options.build_timeout.as_secs()
                ))
            })??;

        if let Err(err) = self.runtime.replace_previous(&request.bot_id).await {
            warn!(
                "Could not retire previous container for bot {}: {}",
                request.bot_id, err
            );
        }

        info!("Starting container for bot {}", request.bot_id);
        let container = tokio::time::timeout(
            self.options.start_timeout,
            self.runtime.create_and_start(
                &image_tag,
                &request.bot_id,
                &request.deployment_id,
                &self.limits,
            ),
        )
        .await
        .map_err(|_| {
            DeployError::Startup(format!(
                "timed out after {}s",
                self.options.start_timeout.as_secs()
            ))
        })??;

        Ok(DeploymentOutcome {
            deployment_id: request.deployment_id.clone(),
            image_tag,
            container_id: container.id,
            started_at: container.started_at,
        })
    }

    pub async fn container_logs(
        &self,
        container_id: &str,
        tail: usize,
    ) -> Result<Vec<String>, anyhow::Error> {
        self.runtime.tail_logs(container_id, tail).await
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::stream;
    use tokio::fs;

    use super::model::Container;
    use super::port::{BuildLogStream, SourceControl};
    use super::*;

    /// Tracks how many pipelines are inside an external stage at once.
    #[derive(Default)]
    struct OverlapGauge {
        active: AtomicUsize,
        max: AtomicUsize,
    }

    impl OverlapGauge {
        async fn enter(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct FakeSource {
        with_descriptor: bool,
        fail_with: Option<String>,
        status: Option<Arc<StatusStore>>,
        seen_status: Arc<Mutex<Option<String>>>,
    }

    impl FakeSource {
        fn ok() -> Self {
            Self {
                with_descriptor: true,
                fail_with: None,
                status: None,
                seen_status: Arc::new(Mutex::new(None)),
            }
        }
    }

    #[async_trait]
    impl SourceControl for FakeSource {
        async fn fetch(
            &self,
            _repository: &str,
            _branch: &str,
            dest: &Path,
        ) -> Result<(), DeployError> {
            if let Some(store) = &self.status {
                let label = store.get("d1").map(|s| s.label().to_string());
                *self.seen_status.lock().unwrap() = label;
            }
            if let Some(msg) = &self.fail_with {
                return Err(DeployError::Clone(msg.clone()));
            }
            fs::create_dir_all(dest).await.unwrap();
            if self.with_descriptor {
                fs::write(dest.join("Dockerfile"), b"FROM alpine").await.unwrap();
            }
            Ok(())
        }
    }

    struct StubBuilder {
        lines: Vec<&'static str>,
        fail_with: Option<String>,
        delay: Option<Duration>,
        calls: Arc<AtomicUsize>,
        gauge: Option<Arc<OverlapGauge>>,
    }

    impl StubBuilder {
        fn ok() -> Self {
            Self {
                lines: vec!["Step 1/2 : FROM alpine", "Successfully built 1a2b3c"],
                fail_with: None,
                delay: None,
                calls: Arc::new(AtomicUsize::new(0)),
                gauge: None,
            }
        }
    }

    #[async_trait]
    impl ImageBuilder for StubBuilder {
        async fn build(
            &self,
            _context: &Path,
            _image_tag: &str,
        ) -> Result<BuildLogStream, DeployError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gauge) = &self.gauge {
                gauge.enter().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut items: Vec<Result<String, DeployError>> =
                self.lines.iter().map(|l| Ok(l.to_string())).collect();
            if let Some(msg) = &self.fail_with {
                items.push(Err(DeployError::Build(msg.clone())));
            }
            Ok(stream::iter(items).boxed())
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    struct CreateCall {
        image_tag: String,
        bot_id: String,
        deployment_id: String,
        limits: ResourceLimits,
    }

    struct StubRuntime {
        replace_fails: bool,
        startup_fails: bool,
        replaced: Arc<Mutex<Vec<String>>>,
        created: Arc<Mutex<Vec<CreateCall>>>,
        gauge: Option<Arc<OverlapGauge>>,
    }

    impl StubRuntime {
        fn ok() -> Self {
            Self {
                replace_fails: false,
                startup_fails: false,
                replaced: Arc::new(Mutex::new(vec![])),
                created: Arc::new(Mutex::new(vec![])),
                gauge: None,
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for StubRuntime {
        async fn replace_previous(&self, bot_id: &str) -> Result<(), anyhow::Error> {
            self.replaced.lock().unwrap().push(bot_id.to_string());
            if self.replace_fails {
                return Err(anyhow::anyhow!("daemon unavailable"));
            }
            Ok(())
        }

        async fn create_and_start(
            &self,
            image_tag: &str,
            bot_id: &str,
            deployment_id: &str,
            limits: &ResourceLimits,
        ) -> Result<Container, DeployError> {
            if let Some(gauge) = &self.gauge {
                gauge.enter().await;
            }
            if self.startup_fails {
                return Err(DeployError::Startup("daemon reports not running".to_string()));
            }
            self.created.lock().unwrap().push(CreateCall {
                image_tag: image_tag.to_string(),
                bot_id: bot_id.to_string(),
                deployment_id: deployment_id.to_string(),
                limits: limits.clone(),
            });
            Ok(Container {
                id: format!("container-{}", deployment_id),
                started_at: "2026-01-01T00:00:00Z".to_string(),
            })
        }

        async fn tail_logs(
            &self,
            _container_id: &str,
            _tail: usize,
        ) -> Result<Vec<String>, anyhow::Error> {
            Ok(vec![])
        }
    }

    struct CollectingObserver(Arc<Mutex<Vec<String>>>);

    impl BuildObserver for CollectingObserver {
        fn build_log(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    struct Harness {
        service: DeploymentService,
        status: Arc<StatusStore>,
        root: PathBuf,
        build_lines: Arc<Mutex<Vec<String>>>,
        _tmp: tempfile::TempDir,
    }

    fn harness_with(
        source: FakeSource,
        builder: StubBuilder,
        runtime: StubRuntime,
        options: PipelineOptions,
    ) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let status = Arc::new(StatusStore::new());
        let build_lines = Arc::new(Mutex::new(vec![]));
        let service = DeploymentService::new(
            WorkspaceManager::new(&root, Box::new(source)),
            Box::new(builder),
            Box::new(runtime),
            status.clone(),
            Box::new(CollectingObserver(build_lines.clone())),
            options,
        );
        Harness {
            service,
            status,
            root,
            build_lines,
            _tmp: tmp,
        }
    }

    fn harness() -> Harness {
        harness_with(
            FakeSource::ok(),
            StubBuilder::ok(),
            StubRuntime::ok(),
            PipelineOptions::default(),
        )
    }

    fn request(deployment_id: &str) -> DeploymentRequest {
        DeploymentRequest {
            repository: "https://example.com/ok.git".to_string(),
            branch: "main".to_string(),
            bot_id: "bot1".to_string(),
            deployment_id: deployment_id.to_string(),
        }
    }

    #[tokio::test]
    async fn successful_pipeline_completes_with_running_container() {
        let h = harness();
        let outcome = h.service.deploy(request("d1")).await.unwrap();

        assert_eq!(outcome.image_tag, "botdeploy-bot1:latest");
        assert_eq!(outcome.container_id, "container-d1");
        assert_eq!(outcome.started_at, "2026-01-01T00:00:00Z");
        assert_eq!(h.status.get("d1").unwrap().label(), "COMPLETED");
        assert_eq!(
            *h.build_lines.lock().unwrap(),
            vec!["Step 1/2 : FROM alpine", "Successfully built 1a2b3c"]
        );
        // Success path keeps the build context around by default.
        assert!(h.root.join("bot1").exists());
    }

    #[tokio::test]
    async fn created_container_carries_fixed_limits_and_identity() {
        let runtime = StubRuntime::ok();
        let created = runtime.created.clone();
        let h = harness_with(
            FakeSource::ok(),
            StubBuilder::ok(),
            runtime,
            PipelineOptions::default(),
        );
        h.service.deploy(request("d1")).await.unwrap();

        assert_eq!(
            *created.lock().unwrap(),
            vec![CreateCall {
                image_tag: "botdeploy-bot1:latest".to_string(),
                bot_id: "bot1".to_string(),
                deployment_id: "d1".to_string(),
                limits: ResourceLimits::default(),
            }]
        );
    }

    #[tokio::test]
    async fn incomplete_request_is_rejected_without_a_record() {
        let h = harness();
        let mut req = request("d1");
        req.branch.clear();

        let err = h.service.deploy(req).await.unwrap_err();
        assert!(matches!(err, DeployError::Validation(_)));
        assert!(h.status.get("d1").is_none());
    }

    #[tokio::test]
    async fn started_is_recorded_before_the_fetch_runs() {
        let mut source = FakeSource::ok();
        let seen = source.seen_status.clone();
        let status = Arc::new(StatusStore::new());
        source.status = Some(status.clone());

        let tmp = tempfile::tempdir().unwrap();
        let service = DeploymentService::new(
            WorkspaceManager::new(tmp.path(), Box::new(source)),
            Box::new(StubBuilder::ok()),
            Box::new(StubRuntime::ok()),
            status,
            Box::new(LogObserver),
            PipelineOptions::default(),
        );
        service.deploy(request("d1")).await.unwrap();

        assert_eq!(seen.lock().unwrap().as_deref(), Some("STARTED"));
    }

    #[tokio::test]
    async fn unreachable_repository_fails_and_removes_workspace() {
        let h = harness_with(
            FakeSource {
                fail_with: Some("could not resolve host".to_string()),
                ..FakeSource::ok()
            },
            StubBuilder::ok(),
            StubRuntime::ok(),
            PipelineOptions::default(),
        );
        let err = h.service.deploy(request("d1")).await.unwrap_err();

        assert!(err.to_string().contains("failed to clone repository"));
        match h.status.get("d1").unwrap() {
            DeploymentStatus::Failed(msg) => assert!(msg.contains("could not resolve host")),
            other => panic!("unexpected status {:?}", other),
        }
        assert!(!h.root.join("bot1").exists());
    }

    #[tokio::test]
    async fn missing_descriptor_stops_before_build_or_create() {
        let builder = StubBuilder::ok();
        let build_calls = builder.calls.clone();
        let runtime = StubRuntime::ok();
        let created = runtime.created.clone();
        let replaced = runtime.replaced.clone();
        let h = harness_with(
            FakeSource {
                with_descriptor: false,
                ..FakeSource::ok()
            },
            builder,
            runtime,
            PipelineOptions::default(),
        );
        let err = h.service.deploy(request("d1")).await.unwrap_err();

        assert!(err.to_string().contains("Dockerfile not found"));
        assert_eq!(h.status.get("d1").unwrap().label(), "FAILED");
        assert_eq!(build_calls.load(Ordering::SeqCst), 0);
        assert!(created.lock().unwrap().is_empty());
        assert!(replaced.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn build_failure_surfaces_daemon_detail_and_creates_no_container() {
        let runtime = StubRuntime::ok();
        let created = runtime.created.clone();
        let h = harness_with(
            FakeSource::ok(),
            StubBuilder {
                fail_with: Some("unknown instruction: FORM".to_string()),
                ..StubBuilder::ok()
            },
            runtime,
            PipelineOptions::default(),
        );
        let err = h.service.deploy(request("d1")).await.unwrap_err();

        assert!(err.to_string().contains("unknown instruction: FORM"));
        assert_eq!(h.status.get("d1").unwrap().label(), "FAILED");
        assert!(created.lock().unwrap().is_empty());
        // Failure path releases the build context.
        assert!(!h.root.join("bot1").exists());
    }

    #[tokio::test]
    async fn retire_failure_does_not_block_the_new_container() {
        let h = harness_with(
            FakeSource::ok(),
            StubBuilder::ok(),
            StubRuntime {
                replace_fails: true,
                ..StubRuntime::ok()
            },
            PipelineOptions::default(),
        );
        let outcome = h.service.deploy(request("d1")).await.unwrap();
        assert_eq!(outcome.container_id, "container-d1");
        assert_eq!(h.status.get("d1").unwrap().label(), "COMPLETED");
    }

    #[tokio::test]
    async fn startup_failure_is_terminal() {
        let h = harness_with(
            FakeSource::ok(),
            StubBuilder::ok(),
            StubRuntime {
                startup_fails: true,
                ..StubRuntime::ok()
            },
            PipelineOptions::default(),
        );
        let err = h.service.deploy(request("d1")).await.unwrap_err();
        assert!(err.to_string().contains("container failed to start"));
        assert_eq!(h.status.get("d1").unwrap().label(), "FAILED");
    }

    #[tokio::test]
    async fn slow_build_hits_the_deadline() {
        let h = harness_with(
            FakeSource::ok(),
            StubBuilder {
                delay: Some(Duration::from_millis(100)),
                ..StubBuilder::ok()
            },
            StubRuntime::ok(),
            PipelineOptions {
                build_timeout: Duration::from_millis(10),
                ..PipelineOptions::default()
            },
        );
        let err = h.service.deploy(request("d1")).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(h.status.get("d1").unwrap().label(), "FAILED");
    }

    #[tokio::test]
    async fn success_can_release_the_workspace_when_configured() {
        let h = harness_with(
            FakeSource::ok(),
            StubBuilder::ok(),
            StubRuntime::ok(),
            PipelineOptions {
                keep_workspace_after_success: false,
                ..PipelineOptions::default()
            },
        );
        h.service.deploy(request("d1")).await.unwrap();
        assert_eq!(h.status.get("d1").unwrap().label(), "COMPLETED");
        assert!(!h.root.join("bot1").exists());
    }

    #[tokio::test]
    async fn same_bot_deployments_never_interleave() {
        let gauge = Arc::new(OverlapGauge::default());
        let h = harness_with(
            FakeSource::ok(),
            StubBuilder {
                gauge: Some(gauge.clone()),
                ..StubBuilder::ok()
            },
            StubRuntime {
                gauge: Some(gauge.clone()),
                ..StubRuntime::ok()
            },
            PipelineOptions::default(),
        );

        let (a, b) = tokio::join!(
            h.service.deploy(request("d1")),
            h.service.deploy(request("d2")),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(gauge.max.load(Ordering::SeqCst), 1);
        assert_eq!(h.status.get("d1").unwrap().label(), "COMPLETED");
        assert_eq!(h.status.get("d2").unwrap().label(), "COMPLETED");
    }

    #[tokio::test]
    async fn admission_cap_bounds_concurrent_pipelines() {
        let gauge = Arc::new(OverlapGauge::default());
        let h = harness_with(
            FakeSource::ok(),
            StubBuilder {
                gauge: Some(gauge.clone()),
                ..StubBuilder::ok()
            },
            StubRuntime::ok(),
            PipelineOptions {
                max_concurrent_deployments: 1,
                ..PipelineOptions::default()
            },
        );

        let mut req_a = request("d1");
        req_a.bot_id = "bot-a".to_string();
        let mut req_b = request("d2");
        req_b.bot_id = "bot-b".to_string();

        let (a, b) = tokio::join!(h.service.deploy(req_a), h.service.deploy(req_b));
        a.unwrap();
        b.unwrap();

        assert_eq!(gauge.max.load(Ordering::SeqCst), 1);
    }
}

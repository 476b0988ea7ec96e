//! Per-tier storage event workers.
//!
//! Each [`StorageEventWorker`] owns one pull loop against its tier's durable
//! consumer and processes the fetched batch strictly in order. A message is
//! acknowledged only after its side effects are persisted; on failure it is
//! left unacknowledged and the broker redelivers it after the ack wait until
//! `max_deliver` is used up.
//!
//! ```text
//!  storage.events.<tier> ──► Worker ──┬── create/update ─► ContentProcessor ─► Repository::upsert_file
//!                                     ├── delete ────────────────────────────► Repository::delete_file
//!                                     └── rename/other ──► ack, no side effect
//! ```

use crate::config::{DatabaseConfig, S3Config};
use crate::processor::{
    ContentProcessor, ObjectContentProcessor, ProcessedFile, ProcessingError,
};
use crate::repository::{
    FileRecord, PostgresRepository, Repository, RepositoryError, ResourceRecord,
};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tierflow_pipeline::router::backoff_delay;
use tierflow_pipeline::{
    continue_trace, Classify, ConsumerManager, ErrorClass, IncomingMessage, PullTarget,
    RoutingTable, StorageEvent, StorageEventType, Tier, Transport, TransportError,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that fail the processing of one message
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("{0} worker is not set up")]
    NotInitialized(Tier),

    #[error("Dependency setup failed: {0}")]
    Setup(String),

    #[error("Content processing failed: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl Classify for WorkerError {
    fn class(&self) -> ErrorClass {
        match self {
            WorkerError::NotInitialized(_) | WorkerError::Setup(_) => ErrorClass::TransientInfra,
            WorkerError::Processing(e) => e.class(),
            WorkerError::Repository(e) => e.class(),
            WorkerError::Transport(e) => e.class(),
        }
    }
}

/// Tenant a worker deployment is dedicated to. Tier queues are shared work
/// queues, so the scope never filters them: an event of another tenant is
/// still processed and only counted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TenantScope {
    #[default]
    All,
    Tenant(String),
}

impl TenantScope {
    pub fn from_option(tenant_id: Option<String>) -> Self {
        tenant_id.map(TenantScope::Tenant).unwrap_or_default()
    }

    pub fn allows(&self, tenant_id: &str) -> bool {
        match self {
            TenantScope::All => true,
            TenantScope::Tenant(scoped) => scoped == tenant_id,
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            TenantScope::All => None,
            TenantScope::Tenant(scoped) => Some(scoped),
        }
    }
}

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Cumulative counters of one worker
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerMetrics {
    pub messages_processed: u64,
    /// Messages whose deliveries were exhausted without success
    pub messages_failed: u64,
    pub files_processed: u64,
    pub resources_created: u64,
    /// Seconds
    pub processing_time_total: f64,
    pub last_activity: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
}

impl WorkerMetrics {
    pub fn average_processing_time(&self) -> f64 {
        if self.messages_processed == 0 {
            return 0.0;
        }
        self.processing_time_total / self.messages_processed as f64
    }

    pub fn success_rate(&self) -> f64 {
        if self.messages_processed == 0 {
            return 0.0;
        }
        if self.messages_failed == 0 {
            return 100.0;
        }
        let total = self.messages_processed + self.messages_failed;
        self.messages_processed as f64 / total as f64 * 100.0
    }
}

/// Metrics plus their derived values
#[derive(Debug, Clone, Serialize)]
pub struct WorkerMetricsReport {
    #[serde(flatten)]
    pub metrics: WorkerMetrics,
    pub average_processing_time: f64,
    pub success_rate: f64,
}

/// Point-in-time view of a worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatusReport {
    pub tier: Tier,
    pub status: WorkerStatus,
    pub running: bool,
    pub tenant_id: Option<String>,
    pub consumer: String,
    pub uptime_seconds: f64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metrics: WorkerMetricsReport,
}

/// Result of [`StorageEventWorker::health_check`]
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub checks: BTreeMap<&'static str, bool>,
}

/// What happened to one tier message
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Indexed { file_id: uuid::Uuid, resources: usize },
    Deleted { file_id: uuid::Uuid, existed: bool },
    /// Acknowledged without side effect
    Ignored { event_type: String },
    /// Acknowledged without processing
    Skipped { reason: &'static str },
}

/// Loop timing shared by all workers of a process
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub fetch_timeout: Duration,
    pub max_backoff: Duration,
    pub liveness_window: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(5),
            max_backoff: Duration::from_secs(30),
            liveness_window: Duration::from_secs(300),
        }
    }
}

/// Capabilities owned exclusively by one worker
pub struct Dependencies {
    pub processor: Box<dyn ContentProcessor>,
    pub repository: Box<dyn Repository>,
}

/// Creates a fresh [`Dependencies`] pair for each worker
#[async_trait::async_trait]
pub trait DependencyFactory: Send + Sync {
    async fn create(&self, tier: Tier) -> Result<Dependencies, WorkerError>;
}

/// S3 content processor plus a PostgreSQL repository with its own pool
pub struct PostgresS3Factory {
    s3: S3Config,
    database: DatabaseConfig,
}

impl PostgresS3Factory {
    pub fn new(s3: S3Config, database: DatabaseConfig) -> Self {
        Self { s3, database }
    }
}

#[async_trait::async_trait]
impl DependencyFactory for PostgresS3Factory {
    async fn create(&self, tier: Tier) -> Result<Dependencies, WorkerError> {
        let repository = PostgresRepository::new(&self.database)
            .await
            .map_err(|e| WorkerError::Setup(e.to_string()))?;
        let processor = ObjectContentProcessor::new(&self.s3).await;
        debug!(%tier, "Worker dependencies created");
        Ok(Dependencies {
            processor: Box::new(processor),
            repository: Box::new(repository),
        })
    }
}

#[derive(Debug)]
struct WorkerState {
    status: WorkerStatus,
    metrics: WorkerMetrics,
    heartbeat: Option<DateTime<Utc>>,
}

/// Processes storage events from one tier's durable consumer
pub struct StorageEventWorker {
    tier: Tier,
    routing: Arc<RoutingTable>,
    transport: Arc<dyn Transport>,
    consumers: ConsumerManager,
    factory: Arc<dyn DependencyFactory>,
    scope: TenantScope,
    settings: WorkerSettings,
    dependencies: RwLock<Option<Dependencies>>,
    state: Mutex<WorkerState>,
    running: AtomicBool,
    consecutive_errors: AtomicU64,
}

impl StorageEventWorker {
    pub fn new(
        tier: Tier,
        transport: Arc<dyn Transport>,
        routing: Arc<RoutingTable>,
        factory: Arc<dyn DependencyFactory>,
        scope: TenantScope,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            tier,
            consumers: ConsumerManager::new(transport.clone(), routing.clone()),
            routing,
            transport,
            factory,
            scope,
            settings,
            dependencies: RwLock::new(None),
            state: Mutex::new(WorkerState {
                status: WorkerStatus::Stopped,
                metrics: WorkerMetrics::default(),
                heartbeat: None,
            }),
            running: AtomicBool::new(false),
            consecutive_errors: AtomicU64::new(0),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    fn state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.state().heartbeat = Some(Utc::now());
    }

    /// Drive `fut` while refreshing the heartbeat, so one slow object does
    /// not outlast the liveness window
    async fn with_heartbeat<F: Future>(&self, fut: F) -> F::Output {
        let period = (self.settings.liveness_window / 4).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return output,
                _ = ticker.tick() => self.touch(),
            }
        }
    }

    fn max_deliver(&self) -> i64 {
        self.routing.worker_config(self.tier).max_deliver
    }

    /// Create the worker's own processor and repository and make sure its
    /// consumer exists
    #[instrument(skip(self), fields(tier = %self.tier))]
    pub async fn setup(&self) -> Result<(), WorkerError> {
        let dependencies = self.factory.create(self.tier).await?;
        *self.dependencies.write().await = Some(dependencies);

        self.consumers.ensure_consumer(self.tier).await?;

        let mut state = self.state();
        state.status = WorkerStatus::Starting;
        state.metrics.start_time = Some(Utc::now());
        drop(state);

        info!(
            consumer = %self.routing.consumer(self.tier),
            tenant_id = ?self.scope.tenant_id(),
            "Worker setup complete"
        );
        Ok(())
    }

    /// Pull and process until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!(tier = %self.tier, "Worker is already running");
            return;
        }
        self.state().status = WorkerStatus::Running;
        gauge!("worker.running", "queue" => self.tier.as_str()).set(1.0);
        info!(tier = %self.tier, "Starting worker loop");

        loop {
            self.touch();

            let pulled = tokio::select! {
                _ = shutdown.cancelled() => break,
                pulled = self.pull() => pulled,
            };

            match pulled {
                Ok(messages) => {
                    self.consecutive_errors.store(0, Ordering::Release);
                    for message in &messages {
                        if shutdown.is_cancelled() {
                            break;
                        }
                        self.handle_message(message).await;
                    }
                }
                Err(e) => {
                    let consecutive = self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
                    let delay = backoff_delay(consecutive, self.settings.max_backoff);
                    warn!(
                        tier = %self.tier,
                        error = %e,
                        consecutive_errors = consecutive,
                        delay_secs = delay.as_secs(),
                        "Pull failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.running.store(false, Ordering::Release);
        gauge!("worker.running", "queue" => self.tier.as_str()).set(0.0);
        info!(tier = %self.tier, "Worker loop stopped");
    }

    async fn pull(&self) -> Result<Vec<IncomingMessage>, TransportError> {
        self.consumers
            .pull(PullTarget::Tier(self.tier), self.settings.fetch_timeout)
            .await
    }

    /// One pull plus sequential processing of the batch. Returns the number
    /// of messages fetched.
    pub async fn process_batch(&self) -> Result<usize, TransportError> {
        self.touch();
        let messages = self.pull().await?;
        for message in &messages {
            self.handle_message(message).await;
        }
        Ok(messages.len())
    }

    /// Process one message and fold the result into the metrics. Failures
    /// never escape: the message stays unacknowledged for redelivery.
    pub async fn handle_message(&self, message: &IncomingMessage) {
        let Err(e) = self.with_heartbeat(self.process_message(message)).await else {
            return;
        };

        counter!(
            "worker.processing.errors",
            "queue" => self.tier.as_str(),
            "error_type" => e.class().as_str()
        )
        .increment(1);

        if message.is_last_delivery(self.max_deliver()) {
            self.state().metrics.messages_failed += 1;
            counter!("worker.dead_letter", "queue" => self.tier.as_str()).increment(1);
            error!(
                tier = %self.tier,
                sequence = message.stream_sequence,
                delivered = message.delivered,
                error = %e,
                class = %e.class(),
                "Message exhausted its deliveries"
            );
        } else {
            warn!(
                tier = %self.tier,
                sequence = message.stream_sequence,
                delivered = message.delivered,
                error = %e,
                "Message processing failed, awaiting redelivery"
            );
        }
    }

    /// Dispatch one message on its event type, then acknowledge it
    pub async fn process_message(
        &self,
        message: &IncomingMessage,
    ) -> Result<MessageOutcome, WorkerError> {
        let attributes = [
            ("queue", self.tier.as_str().to_string()),
            ("delivered", message.delivered.to_string()),
        ];
        continue_trace(
            &message.headers,
            "worker.process_event",
            &attributes,
            self.process(message),
        )
        .await
    }

    async fn process(&self, message: &IncomingMessage) -> Result<MessageOutcome, WorkerError> {
        let start = Instant::now();

        let event = match StorageEvent::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(tier = %self.tier, error = %e, "Skipping invalid event");
                return self.skip(message, e.reason()).await;
            }
        };

        if !self.scope.allows(&event.tenant_id) {
            debug!(
                tier = %self.tier,
                tenant_id = %event.tenant_id,
                scope = ?self.scope.tenant_id(),
                "Processing event outside tenant scope"
            );
            counter!("worker.events.foreign_tenant", "queue" => self.tier.as_str()).increment(1);
        }

        let guard = self.dependencies.read().await;
        let dependencies = guard
            .as_ref()
            .ok_or(WorkerError::NotInitialized(self.tier))?;

        let outcome = match &event.event_type {
            StorageEventType::Create | StorageEventType::Update => {
                let processed = dependencies.processor.process(&event).await?;
                let (file, resources) = self.records(&event, processed);
                let written = dependencies.repository.upsert_file(&file, &resources).await?;
                MessageOutcome::Indexed {
                    file_id: file.id,
                    resources: written,
                }
            }
            StorageEventType::Delete => {
                let file_id = FileRecord::id_for(&event.tenant_id, &event.relative_path);
                let existed = dependencies
                    .repository
                    .delete_file(&event.tenant_id, file_id)
                    .await?;
                MessageOutcome::Deleted { file_id, existed }
            }
            StorageEventType::Rename | StorageEventType::Other(_) => {
                debug!(tier = %self.tier, event_type = %event.event_type, "No action for event type");
                MessageOutcome::Ignored {
                    event_type: event.event_type.to_string(),
                }
            }
        };
        drop(guard);

        message.ack().await?;
        self.record_success(&event, &outcome, start.elapsed());
        Ok(outcome)
    }

    async fn skip(
        &self,
        message: &IncomingMessage,
        reason: &'static str,
    ) -> Result<MessageOutcome, WorkerError> {
        message.ack().await?;
        counter!("worker.events.skipped", "queue" => self.tier.as_str(), "reason" => reason)
            .increment(1);
        Ok(MessageOutcome::Skipped { reason })
    }

    fn records(
        &self,
        event: &StorageEvent,
        processed: ProcessedFile,
    ) -> (FileRecord, Vec<ResourceRecord>) {
        let legacy = event.to_legacy_format();
        let file_id = FileRecord::id_for(&legacy.tenant_id, &legacy.file_path);

        let resources = processed
            .resources
            .into_iter()
            .enumerate()
            .map(|(i, resource)| {
                let ordinal = i32::try_from(i).unwrap_or(i32::MAX);
                ResourceRecord {
                    id: ResourceRecord::id_for(file_id, ordinal),
                    file_id,
                    tenant_id: legacy.tenant_id.clone(),
                    ordinal,
                    name: resource.name,
                    content: resource.content,
                    metadata: resource.metadata,
                }
            })
            .collect();

        let file = FileRecord {
            id: file_id,
            tenant_id: legacy.tenant_id,
            path: legacy.file_path,
            s3_key: legacy.s3_key.trim_start_matches('/').to_string(),
            size_bytes: i64::try_from(legacy.size).unwrap_or(i64::MAX),
            content_type: processed.content_type.or(legacy.mime_type),
            tier: self.tier.as_str().to_string(),
            metadata: json!({
                "etag": event.metadata.etag,
                "last_modified": event.metadata.last_modified,
                "source": event.metadata.source,
                "bytes_read": processed.bytes_read,
                "event_timestamp": event.timestamp,
            }),
        };

        (file, resources)
    }

    fn record_success(&self, event: &StorageEvent, outcome: &MessageOutcome, elapsed: Duration) {
        let mut state = self.state();
        let metrics = &mut state.metrics;
        metrics.messages_processed += 1;
        metrics.processing_time_total += elapsed.as_secs_f64();
        metrics.last_activity = Some(Utc::now());
        if let MessageOutcome::Indexed { resources, .. } = outcome {
            metrics.files_processed += 1;
            metrics.resources_created += *resources as u64;
        }
        drop(state);

        counter!(
            "worker.files.processed",
            "queue" => self.tier.as_str(),
            "event_type" => event.event_type.to_string()
        )
        .increment(1);
        histogram!("worker.processing.duration", "queue" => self.tier.as_str())
            .record(elapsed.as_secs_f64());
        histogram!("worker.file_size.processed", "queue" => self.tier.as_str())
            .record(event.metadata.file_size as f64);

        info!(
            tier = %self.tier,
            tenant_id = %event.tenant_id,
            path = %event.relative_path,
            event_type = %event.event_type,
            duration_ms = elapsed.as_millis() as u64,
            outcome = ?outcome,
            "Processed storage event"
        );
    }

    /// Healthy when connected, the repository answers, and the worker has
    /// either handled a message or completed a loop iteration within the
    /// liveness window
    pub async fn health_check(&self) -> HealthReport {
        let transport_connected = self.transport.is_connected();

        let repository_connected = match self.dependencies.read().await.as_ref() {
            Some(dependencies) => match dependencies.repository.ping().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(tier = %self.tier, error = %e, "Repository liveness probe failed");
                    false
                }
            },
            None => false,
        };

        let recently_active = {
            let state = self.state();
            let window = chrono::Duration::from_std(self.settings.liveness_window)
                .unwrap_or_else(|_| chrono::Duration::days(365));
            let cutoff = Utc::now() - window;
            [state.metrics.last_activity, state.heartbeat]
                .into_iter()
                .flatten()
                .any(|seen| seen >= cutoff)
        };

        let checks = BTreeMap::from([
            ("transport_connected", transport_connected),
            ("repository_connected", repository_connected),
            ("recently_active", recently_active),
        ]);
        HealthReport {
            healthy: checks.values().all(|ok| *ok),
            checks,
        }
    }

    pub fn get_status(&self) -> WorkerStatusReport {
        let state = self.state();
        let uptime_seconds = state
            .metrics
            .start_time
            .map(|start| (Utc::now() - start).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        WorkerStatusReport {
            tier: self.tier,
            status: state.status,
            running: self.running.load(Ordering::Acquire),
            tenant_id: self.scope.tenant_id().map(str::to_string),
            consumer: self.routing.consumer(self.tier).to_string(),
            uptime_seconds,
            last_heartbeat: state.heartbeat,
            metrics: WorkerMetricsReport {
                average_processing_time: state.metrics.average_processing_time(),
                success_rate: state.metrics.success_rate(),
                metrics: state.metrics.clone(),
            },
        }
    }

    pub fn metrics(&self) -> WorkerMetrics {
        self.state().metrics.clone()
    }

    /// Release the processor and repository. The loop must have stopped.
    pub async fn stop(&self) {
        self.state().status = WorkerStatus::Stopping;

        if let Some(dependencies) = self.dependencies.write().await.take() {
            dependencies.repository.close().await;
        }

        self.state().status = WorkerStatus::Stopped;
        info!(tier = %self.tier, "Worker stopped");
    }
}

/// Aggregate over every worker of a process
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerTotals {
    pub workers: usize,
    pub workers_running: usize,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub files_processed: u64,
    pub resources_created: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub totals: ManagerTotals,
    pub workers: BTreeMap<Tier, WorkerStatusReport>,
}

/// Owns the workers of one process and their loop tasks
pub struct WorkerManager {
    transport: Arc<dyn Transport>,
    routing: Arc<RoutingTable>,
    factory: Arc<dyn DependencyFactory>,
    scope: TenantScope,
    settings: WorkerSettings,
    workers: tokio::sync::Mutex<BTreeMap<Tier, Arc<StorageEventWorker>>>,
    tasks: tokio::sync::Mutex<Vec<(Tier, JoinHandle<()>)>>,
    shutdown: CancellationToken,
}

impl WorkerManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        routing: Arc<RoutingTable>,
        factory: Arc<dyn DependencyFactory>,
        scope: TenantScope,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            transport,
            routing,
            factory,
            scope,
            settings,
            workers: tokio::sync::Mutex::new(BTreeMap::new()),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create and set up the worker for `tier`, or return the existing one
    pub async fn setup_worker(&self, tier: Tier) -> Result<Arc<StorageEventWorker>, WorkerError> {
        let mut workers = self.workers.lock().await;
        if let Some(existing) = workers.get(&tier) {
            return Ok(existing.clone());
        }

        let worker = Arc::new(StorageEventWorker::new(
            tier,
            self.transport.clone(),
            self.routing.clone(),
            self.factory.clone(),
            self.scope.clone(),
            self.settings.clone(),
        ));
        worker.setup().await?;
        workers.insert(tier, worker.clone());
        Ok(worker)
    }

    pub async fn worker(&self, tier: Tier) -> Option<Arc<StorageEventWorker>> {
        self.workers.lock().await.get(&tier).cloned()
    }

    /// Spawn a loop for every set-up worker that has none yet
    pub async fn start_all(&self) {
        let workers = self.workers.lock().await;
        let mut tasks = self.tasks.lock().await;
        for (tier, worker) in workers.iter() {
            if tasks.iter().any(|(t, _)| t == tier) {
                continue;
            }
            let worker = worker.clone();
            let shutdown = self.shutdown.child_token();
            tasks.push((*tier, tokio::spawn(async move { worker.run(shutdown).await })));
        }
        info!(workers = tasks.len(), "Worker loops started");
    }

    /// Stop pulling, let in-flight messages finish, then release every
    /// worker's dependencies
    pub async fn stop_all(&self) {
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for (tier, handle) in tasks {
            if let Err(e) = handle.await {
                error!(%tier, error = %e, "Worker task terminated abnormally");
            }
        }

        let workers: Vec<_> = self.workers.lock().await.values().cloned().collect();
        for worker in workers {
            worker.stop().await;
        }
        info!("All workers stopped");
    }

    pub async fn get_status(&self) -> ManagerStatus {
        let workers = self.workers.lock().await;
        let mut totals = ManagerTotals {
            workers: workers.len(),
            ..Default::default()
        };
        let mut reports = BTreeMap::new();

        for (tier, worker) in workers.iter() {
            let report = worker.get_status();
            let metrics = &report.metrics.metrics;
            if report.running {
                totals.workers_running += 1;
            }
            totals.messages_processed += metrics.messages_processed;
            totals.messages_failed += metrics.messages_failed;
            totals.files_processed += metrics.files_processed;
            totals.resources_created += metrics.resources_created;
            reports.insert(*tier, report);
        }

        ManagerStatus {
            totals,
            workers: reports,
        }
    }

    pub async fn health(&self) -> BTreeMap<Tier, HealthReport> {
        let workers: Vec<_> = self.workers.lock().await.values().cloned().collect();
        let mut reports = BTreeMap::new();
        for worker in workers {
            reports.insert(worker.tier(), worker.health_check().await);
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{ExtractedResource, MockContentProcessor};
    use crate::repository::MockRepository;
    use serde_json::Value;
    use tierflow_pipeline::{MemoryTransport, OutgoingMessage, RoutingConfig, StreamManager};

    /// Hands out one prepared dependency pair
    struct StaticFactory(std::sync::Mutex<Option<Dependencies>>);

    impl StaticFactory {
        fn new(
            processor: impl ContentProcessor + 'static,
            repository: MockRepository,
        ) -> Arc<Self> {
            Arc::new(Self(std::sync::Mutex::new(Some(Dependencies {
                processor: Box::new(processor),
                repository: Box::new(repository),
            }))))
        }
    }

    #[async_trait::async_trait]
    impl DependencyFactory for StaticFactory {
        async fn create(&self, _tier: Tier) -> Result<Dependencies, WorkerError> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| WorkerError::Setup("dependencies already taken".to_string()))
        }
    }

    fn routing() -> Arc<RoutingTable> {
        let mut config = RoutingConfig::default();
        config.tiers.small.worker.ack_wait_secs = 1;
        config.tiers.small.worker.max_deliver = 3;
        Arc::new(RoutingTable::from_config(&config).unwrap())
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            fetch_timeout: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn worker(
        transport: &MemoryTransport,
        processor: MockContentProcessor,
        repository: MockRepository,
        scope: TenantScope,
    ) -> StorageEventWorker {
        worker_with(transport, processor, repository, scope, settings()).await
    }

    async fn worker_with(
        transport: &MemoryTransport,
        processor: impl ContentProcessor + 'static,
        repository: MockRepository,
        scope: TenantScope,
        settings: WorkerSettings,
    ) -> StorageEventWorker {
        let routing = routing();
        StreamManager::new(Arc::new(transport.clone()), routing.clone())
            .ensure_stream(Tier::Small)
            .await
            .unwrap();
        let worker = StorageEventWorker::new(
            Tier::Small,
            Arc::new(transport.clone()),
            routing,
            StaticFactory::new(processor, repository),
            scope,
            settings,
        );
        worker.setup().await.unwrap();
        worker
    }

    /// Takes its time over every object
    struct SlowProcessor(Duration);

    #[async_trait::async_trait]
    impl ContentProcessor for SlowProcessor {
        async fn process(&self, _event: &StorageEvent) -> Result<ProcessedFile, ProcessingError> {
            tokio::time::sleep(self.0).await;
            Ok(text_file(1))
        }
    }

    async fn publish(transport: &MemoryTransport, event: Value) {
        transport
            .publish(OutgoingMessage::new_json("storage.events.small", &event).unwrap())
            .await
            .unwrap();
    }

    fn text_file(chunks: usize) -> ProcessedFile {
        ProcessedFile {
            content_type: Some("text/plain".to_string()),
            bytes_read: 12,
            resources: (0..chunks)
                .map(|i| ExtractedResource {
                    name: format!("a.txt#{}", i),
                    content: "hello".to_string(),
                    metadata: Value::Null,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_create_event_is_indexed_and_acked() {
        let transport = MemoryTransport::new();
        let mut processor = MockContentProcessor::new();
        processor
            .expect_process()
            .times(1)
            .returning(|_| Ok(text_file(2)));
        let mut repository = MockRepository::new();
        repository
            .expect_upsert_file()
            .withf(|file, resources| {
                file.id == FileRecord::id_for("tenant-1", "docs/a.txt")
                    && file.tier == "small"
                    && resources.len() == 2
                    && resources[1].ordinal == 1
            })
            .times(1)
            .returning(|_, resources| Ok(resources.len()));

        let worker = worker(&transport, processor, repository, TenantScope::All).await;
        publish(
            &transport,
            serde_json::json!({ "type": "create", "path": "buckets/tenant-1/docs/a.txt", "file_size": 12 }),
        )
        .await;

        assert_eq!(worker.process_batch().await.unwrap(), 1);
        assert_eq!(transport.message_count("STORAGE_EVENTS_SMALL"), 0);

        let metrics = worker.metrics();
        assert_eq!(metrics.messages_processed, 1);
        assert_eq!(metrics.files_processed, 1);
        assert_eq!(metrics.resources_created, 2);
        assert!(metrics.last_activity.is_some());
    }

    #[tokio::test]
    async fn test_exhausted_deliveries_count_one_failure() {
        let transport = MemoryTransport::new();
        let mut processor = MockContentProcessor::new();
        processor.expect_process().times(3).returning(|_| {
            Err(ProcessingError::Fetch {
                bucket: "tenant-1".into(),
                key: "docs/a.txt".into(),
                message: "connection reset".into(),
            })
        });
        let repository = MockRepository::new();

        let worker = worker(&transport, processor, repository, TenantScope::All).await;
        publish(
            &transport,
            serde_json::json!({ "type": "create", "path": "buckets/tenant-1/docs/a.txt", "file_size": 12 }),
        )
        .await;

        for attempt in 1..=3 {
            if attempt > 1 {
                // Unacknowledged: hidden until the one second ack wait lapses
                assert_eq!(worker.process_batch().await.unwrap(), 0);
                tokio::time::sleep(Duration::from_millis(1100)).await;
            }
            assert_eq!(worker.process_batch().await.unwrap(), 1, "attempt {}", attempt);
            let expected_failed = if attempt < 3 { 0 } else { 1 };
            assert_eq!(worker.metrics().messages_failed, expected_failed);
        }

        // Deliveries are used up; nothing is handed out any more
        assert_eq!(worker.process_batch().await.unwrap(), 0);
        let metrics = worker.metrics();
        assert_eq!(metrics.messages_failed, 1);
        assert_eq!(metrics.messages_processed, 0);
    }

    #[tokio::test]
    async fn test_delete_never_reaches_processor() {
        let transport = MemoryTransport::new();
        let mut processor = MockContentProcessor::new();
        processor.expect_process().never();
        let mut repository = MockRepository::new();
        let expected = FileRecord::id_for("tenant-1", "docs/a.txt");
        repository
            .expect_delete_file()
            .withf(move |tenant, id| tenant == "tenant-1" && *id == expected)
            .times(1)
            .returning(|_, _| Ok(true));

        let worker = worker(&transport, processor, repository, TenantScope::All).await;
        publish(
            &transport,
            serde_json::json!({ "type": "delete", "path": "buckets/tenant-1/docs/a.txt" }),
        )
        .await;

        let messages = transport
            .pull("STORAGE_EVENTS_SMALL", "small-workers", 1, Duration::from_millis(20))
            .await
            .unwrap();
        let outcome = worker.process_message(&messages[0]).await.unwrap();
        assert_eq!(
            outcome,
            MessageOutcome::Deleted {
                file_id: expected,
                existed: true
            }
        );
        assert_eq!(worker.metrics().files_processed, 0);
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_acked_without_side_effect() {
        let transport = MemoryTransport::new();
        let mut processor = MockContentProcessor::new();
        processor.expect_process().never();
        let repository = MockRepository::new();

        let worker = worker(&transport, processor, repository, TenantScope::All).await;
        publish(
            &transport,
            serde_json::json!({ "type": "chmod", "path": "buckets/tenant-1/docs/a.txt" }),
        )
        .await;

        assert_eq!(worker.process_batch().await.unwrap(), 1);
        assert_eq!(transport.message_count("STORAGE_EVENTS_SMALL"), 0);
        assert_eq!(worker.metrics().messages_processed, 1);
    }

    #[tokio::test]
    async fn test_invalid_event_is_skipped() {
        let transport = MemoryTransport::new();
        let mut processor = MockContentProcessor::new();
        processor.expect_process().never();
        let repository = MockRepository::new();

        let worker = worker(&transport, processor, repository, TenantScope::All).await;
        publish(&transport, serde_json::json!({ "type": "create", "path": "tmp/a.txt" })).await;

        let messages = transport
            .pull("STORAGE_EVENTS_SMALL", "small-workers", 1, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(
            worker.process_message(&messages[0]).await.unwrap(),
            MessageOutcome::Skipped { reason: "non_tenant_path" }
        );
        assert_eq!(transport.message_count("STORAGE_EVENTS_SMALL"), 0);
    }

    #[tokio::test]
    async fn test_scoped_worker_still_processes_other_tenants() {
        let transport = MemoryTransport::new();
        let mut processor = MockContentProcessor::new();
        processor
            .expect_process()
            .times(1)
            .returning(|_| Ok(text_file(1)));
        let mut repository = MockRepository::new();
        repository
            .expect_upsert_file()
            .withf(|file, _| file.tenant_id == "tenant-2")
            .times(1)
            .returning(|_, resources| Ok(resources.len()));

        let worker = worker(
            &transport,
            processor,
            repository,
            TenantScope::Tenant("tenant-1".to_string()),
        )
        .await;
        publish(
            &transport,
            serde_json::json!({ "type": "create", "path": "buckets/tenant-2/docs/a.txt" }),
        )
        .await;

        assert_eq!(worker.process_batch().await.unwrap(), 1);
        assert_eq!(worker.metrics().files_processed, 1);
        assert_eq!(worker.get_status().tenant_id.as_deref(), Some("tenant-1"));
    }

    #[tokio::test]
    async fn test_health_check() {
        let transport = MemoryTransport::new();
        let mut repository = MockRepository::new();
        repository.expect_ping().returning(|| Ok(()));

        let worker = worker(
            &transport,
            MockContentProcessor::new(),
            repository,
            TenantScope::All,
        )
        .await;

        // Set up but never looped: no activity yet
        let report = worker.health_check().await;
        assert!(!report.healthy);
        assert!(!report.checks["recently_active"]);

        // An idle loop iteration counts as liveness
        assert_eq!(worker.process_batch().await.unwrap(), 0);
        assert!(worker.health_check().await.healthy);

        transport.set_connected(false);
        let report = worker.health_check().await;
        assert!(!report.healthy);
        assert!(!report.checks["transport_connected"]);
    }

    #[tokio::test]
    async fn test_slow_object_keeps_worker_live() {
        let transport = MemoryTransport::new();
        let mut repository = MockRepository::new();
        repository.expect_ping().returning(|| Ok(()));
        repository
            .expect_upsert_file()
            .times(1)
            .returning(|_, resources| Ok(resources.len()));

        let window = Duration::from_millis(100);
        let worker = Arc::new(
            worker_with(
                &transport,
                SlowProcessor(window * 4),
                repository,
                TenantScope::All,
                WorkerSettings {
                    liveness_window: window,
                    ..settings()
                },
            )
            .await,
        );
        publish(
            &transport,
            serde_json::json!({ "type": "create", "path": "buckets/tenant-1/big.txt" }),
        )
        .await;

        let batch = tokio::spawn({
            let worker = worker.clone();
            async move { worker.process_batch().await }
        });

        // Well past the window since the pull started, object still in flight
        tokio::time::sleep(window * 2).await;
        let report = worker.health_check().await;
        assert!(report.checks["recently_active"]);
        assert!(report.healthy);

        assert_eq!(batch.await.unwrap().unwrap(), 1);
        assert_eq!(worker.metrics().files_processed, 1);
    }

    #[test]
    fn test_success_rate() {
        let mut metrics = WorkerMetrics::default();
        assert_eq!(metrics.success_rate(), 0.0);
        assert_eq!(metrics.average_processing_time(), 0.0);

        metrics.messages_processed = 4;
        metrics.processing_time_total = 2.0;
        assert_eq!(metrics.success_rate(), 100.0);
        assert_eq!(metrics.average_processing_time(), 0.5);

        metrics.messages_failed = 1;
        assert_eq!(metrics.success_rate(), 80.0);
    }

    #[test]
    fn test_tenant_scope() {
        assert!(TenantScope::All.allows("anyone"));
        let scope = TenantScope::from_option(Some("tenant-1".to_string()));
        assert!(scope.allows("tenant-1"));
        assert!(!scope.allows("tenant-2"));
        assert_eq!(TenantScope::from_option(None), TenantScope::All);
    }

    #[tokio::test]
    async fn test_manager_setup_is_idempotent() {
        let transport = MemoryTransport::new();
        let routing = routing();
        StreamManager::new(Arc::new(transport.clone()), routing.clone())
            .ensure_all()
            .await
            .unwrap();
        let mut repository = MockRepository::new();
        repository.expect_close().times(1).returning(|| ());

        let manager = WorkerManager::new(
            Arc::new(transport.clone()),
            routing,
            StaticFactory::new(MockContentProcessor::new(), repository),
            TenantScope::All,
            settings(),
        );

        let first = manager.setup_worker(Tier::Small).await.unwrap();
        let second = manager.setup_worker(Tier::Small).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.get_status().status, WorkerStatus::Starting);

        manager.start_all().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = manager.get_status().await;
        assert_eq!(status.totals.workers, 1);
        assert_eq!(status.totals.workers_running, 1);
        assert_eq!(status.workers[&Tier::Small].status, WorkerStatus::Running);

        manager.stop_all().await;
        let status = manager.get_status().await;
        assert_eq!(status.totals.workers_running, 0);
        assert_eq!(status.workers[&Tier::Small].status, WorkerStatus::Stopped);
    }
}

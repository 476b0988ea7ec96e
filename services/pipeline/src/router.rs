//! Tiered storage event router.
//!
//! Pulls raw notifications from the shared ingestion consumer, validates
//! them, classifies them by size and republishes an enriched copy on the
//! tier subject. The source message is acknowledged only after the tier
//! publish succeeded. Rejected events are acknowledged immediately and never
//! retried.
//!
//! ```text
//!  storage.events ──► Router ──┬──► storage.events.small
//!   (STORAGE_EVENTS)           ├──► storage.events.medium
//!                              └──► storage.events.large
//! ```

use crate::config::RouterSettings;
use crate::error::{Classify, ErrorClass};
use crate::event::{EventError, StorageEvent};
use crate::streams::{CleanupReport, ConsumerManager, PullTarget, StreamManager};
use crate::telemetry::{continue_trace, inject_trace_context};
use crate::tier::{RoutingTable, Tier};
use crate::transport::{Headers, IncomingMessage, OutgoingMessage, Transport, TransportError};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur while routing
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid event: {0}")]
    Event(#[from] EventError),

    #[error("Failed to build routed payload: {0}")]
    Payload(String),
}

impl Classify for RouterError {
    fn class(&self) -> ErrorClass {
        match self {
            RouterError::Transport(e) => e.class(),
            RouterError::Event(e) => e.class(),
            RouterError::Payload(_) => ErrorClass::Processing,
        }
    }
}

/// What happened to one ingestion message
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Routed { tier: Tier, subject: String, sequence: u64 },
    Rejected { reason: &'static str },
}

/// Point-in-time view of the router
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub running: bool,
    pub instance_id: String,
    pub consumer: String,
    pub started_at: DateTime<Utc>,
    pub messages_processed: u64,
    pub messages_routed: u64,
    pub messages_rejected: u64,
    pub errors: u64,
    pub consecutive_errors: u64,
    pub routed_by_tier: BTreeMap<Tier, u64>,
}

/// Aggregated stream and consumer health
#[derive(Debug, Clone, Serialize)]
pub struct SetupValidation {
    pub streams: BTreeMap<String, bool>,
    pub consumers: BTreeMap<String, bool>,
    pub all_healthy: bool,
}

#[derive(Debug, Default)]
struct RouterCounters {
    processed: AtomicU64,
    routed: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
    consecutive_errors: AtomicU64,
    routed_small: AtomicU64,
    routed_medium: AtomicU64,
    routed_large: AtomicU64,
}

impl RouterCounters {
    fn tier(&self, tier: Tier) -> &AtomicU64 {
        match tier {
            Tier::Small => &self.routed_small,
            Tier::Medium => &self.routed_medium,
            Tier::Large => &self.routed_large,
        }
    }
}

/// Delay before the next pull after `consecutive_errors` failures
pub fn backoff_delay(consecutive_errors: u64, max: Duration) -> Duration {
    let secs = 2u64.saturating_mul(consecutive_errors);
    Duration::from_secs(secs).min(max)
}

fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

pub struct Router {
    routing: Arc<RoutingTable>,
    settings: RouterSettings,
    transport: Arc<dyn Transport>,
    streams: StreamManager,
    consumers: ConsumerManager,
    counters: RouterCounters,
    running: AtomicBool,
    instance_id: String,
    started_at: DateTime<Utc>,
}

impl Router {
    pub fn new(
        transport: Arc<dyn Transport>,
        routing: Arc<RoutingTable>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            streams: StreamManager::new(transport.clone(), routing.clone()),
            consumers: ConsumerManager::new(transport.clone(), routing.clone()),
            routing,
            settings,
            transport,
            counters: RouterCounters::default(),
            running: AtomicBool::new(false),
            instance_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Ensure every stream and consumer, then reap stale consumers.
    /// Safe to call on every process start.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn setup(&self) -> Result<(), RouterError> {
        self.streams.ensure_all().await?;
        self.consumers.ensure_all().await?;

        match self.consumers.cleanup_stale_consumers().await {
            Ok(report) if report != CleanupReport::default() => {
                info!(deleted = ?report.deleted, recreated = ?report.recreated, "Stale consumers cleaned up");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Stale consumer cleanup failed"),
        }

        info!(
            consumer = %self.routing.ingestion().consumer,
            subject = %self.routing.ingestion().subject,
            "Router setup complete"
        );
        Ok(())
    }

    pub async fn cleanup_stale_consumers(&self) -> Result<CleanupReport, RouterError> {
        Ok(self.consumers.cleanup_stale_consumers().await?)
    }

    /// Route until `shutdown` is cancelled. Never stops on its own.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.running.store(true, Ordering::Release);
        info!(instance_id = %self.instance_id, "Starting routing loop");

        loop {
            let pulled = tokio::select! {
                _ = shutdown.cancelled() => break,
                pulled = self.consumers.pull(PullTarget::Ingestion, self.settings.fetch_timeout()) => pulled,
            };

            match pulled {
                Ok(messages) => {
                    for message in &messages {
                        self.handle_message(message).await;
                        if shutdown.is_cancelled() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let consecutive = self.record_error(&RouterError::Transport(e));
                    let delay = backoff_delay(consecutive, self.settings.max_backoff());
                    warn!(consecutive_errors = consecutive, delay_secs = delay.as_secs(), "Backing off after pull failure");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.running.store(false, Ordering::Release);
        info!(instance_id = %self.instance_id, "Routing loop stopped");
    }

    /// Process one message and fold the result into the counters
    pub async fn handle_message(&self, message: &IncomingMessage) {
        match self.process_message(message).await {
            Ok(_) => {
                self.counters.consecutive_errors.store(0, Ordering::Release);
                gauge!("router.consecutive_errors").set(0.0);
            }
            Err(e) => {
                self.record_error(&e);
            }
        }
    }

    fn record_error(&self, e: &RouterError) -> u64 {
        self.counters.errors.fetch_add(1, Ordering::AcqRel);
        let consecutive = self.counters.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
        counter!("router.errors", "error_type" => e.class().as_str()).increment(1);
        gauge!("router.consecutive_errors").set(consecutive as f64);
        error!(error = %e, class = %e.class(), consecutive_errors = consecutive, "Routing failure");
        consecutive
    }

    /// Parse, classify, republish and acknowledge one ingestion message.
    ///
    /// On error the source message is left unacknowledged so the broker
    /// redelivers it after the ack wait.
    pub async fn process_message(
        &self,
        message: &IncomingMessage,
    ) -> Result<RouteOutcome, RouterError> {
        self.counters.processed.fetch_add(1, Ordering::AcqRel);
        let attributes = [
            ("subject", message.subject.clone()),
            ("delivered", message.delivered.to_string()),
        ];

        continue_trace(
            &message.headers,
            "router.route_event",
            &attributes,
            self.route(message),
        )
        .await
    }

    async fn route(&self, message: &IncomingMessage) -> Result<RouteOutcome, RouterError> {
        let start = Instant::now();

        let parsed = serde_json::from_slice::<Value>(&message.payload)
            .map_err(|e| EventError::InvalidPayload(e.to_string()))
            .and_then(|raw| StorageEvent::from_raw_event(&raw).map(|event| (raw, event)));

        let (raw, event) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "Rejecting invalid event");
                return self.reject(message, e.reason()).await;
            }
        };

        if let Some(reason) = event.rejection_reason() {
            debug!(path = %event.path, reason, "Event not routed");
            return self.reject(message, reason).await;
        }

        let tier = self.routing.classify(event.metadata.file_size);
        let subject = self.routing.subject(tier).to_string();
        let payload = self.build_routed_payload(raw, &event, tier)?;

        let mut headers = Headers::new();
        inject_trace_context(&mut headers);
        let outgoing = OutgoingMessage::new_json(subject.clone(), &payload)?.with_headers(headers);

        let ack = self.transport.publish(outgoing).await?;
        message.ack().await?;

        self.counters.routed.fetch_add(1, Ordering::AcqRel);
        self.counters.tier(tier).fetch_add(1, Ordering::AcqRel);
        counter!("router.messages.routed", "queue_tier" => tier.as_str()).increment(1);
        histogram!("router.routing.duration").record(start.elapsed().as_secs_f64());

        info!(
            tenant_id = %event.tenant_id,
            path = %event.relative_path,
            file_size = event.metadata.file_size,
            tier = %tier,
            sequence = ack.sequence,
            "Routed storage event"
        );

        Ok(RouteOutcome::Routed {
            tier,
            subject,
            sequence: ack.sequence,
        })
    }

    async fn reject(
        &self,
        message: &IncomingMessage,
        reason: &'static str,
    ) -> Result<RouteOutcome, RouterError> {
        message.ack().await?;
        self.counters.rejected.fetch_add(1, Ordering::AcqRel);
        counter!("router.messages.rejected", "reason" => reason).increment(1);
        Ok(RouteOutcome::Rejected { reason })
    }

    /// Original fields plus `tenant_id` and the `routing` block
    pub fn build_routed_payload(
        &self,
        raw: Value,
        event: &StorageEvent,
        tier: Tier,
    ) -> Result<Value, RouterError> {
        let Value::Object(mut fields) = raw else {
            return Err(RouterError::Payload("event is not a JSON object".to_string()));
        };

        fields
            .entry("tenant_id")
            .or_insert_with(|| Value::String(event.tenant_id.clone()));
        fields.insert(
            "routing".to_string(),
            json!({
                "target_subject": self.routing.subject(tier),
                "queue_size": tier.as_str(),
                "routed_by": self.settings.routed_by,
                "router_timestamp": unix_now(),
            }),
        );
        Ok(Value::Object(fields))
    }

    pub fn status(&self) -> RouterStatus {
        let load = |c: &AtomicU64| c.load(Ordering::Acquire);
        RouterStatus {
            running: self.running.load(Ordering::Acquire),
            instance_id: self.instance_id.clone(),
            consumer: self.routing.ingestion().consumer.clone(),
            started_at: self.started_at,
            messages_processed: load(&self.counters.processed),
            messages_routed: load(&self.counters.routed),
            messages_rejected: load(&self.counters.rejected),
            errors: load(&self.counters.errors),
            consecutive_errors: load(&self.counters.consecutive_errors),
            routed_by_tier: Tier::ALL
                .into_iter()
                .map(|t| (t, load(self.counters.tier(t))))
                .collect(),
        }
    }

    pub async fn validate_setup(&self) -> SetupValidation {
        let streams = self.streams.validate().await;
        let consumers = self.consumers.validate().await;
        let all_healthy = self.transport.is_connected()
            && streams.values().all(|ok| *ok)
            && consumers.values().all(|ok| *ok);
        SetupValidation {
            streams,
            consumers,
            all_healthy,
        }
    }
}

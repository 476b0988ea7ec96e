//! Declarative lifecycle of the durable streams and pull consumers.
//!
//! [`StreamManager`] owns the ingestion stream and one stream per tier;
//! [`ConsumerManager`] owns the shared router consumer and one durable
//! consumer per tier. Both are idempotent: calling `ensure_*` on every
//! process start is safe.

use crate::tier::{RoutingTable, Tier};
use crate::transport::{
    ConsumerInfo, ConsumerSpec, IncomingMessage, StreamInfo, StreamSpec, Transport,
    TransportError,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

fn hours(h: u64) -> Duration {
    Duration::from_secs(h * 3600)
}

/// Which consumer a pull is made against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullTarget {
    /// The router's shared consumer on the ingestion stream
    Ingestion,
    Tier(Tier),
}

impl fmt::Display for PullTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullTarget::Ingestion => f.write_str("ingestion"),
            PullTarget::Tier(tier) => write!(f, "{}", tier),
        }
    }
}

/// Ensures and validates the durable streams
#[derive(Clone)]
pub struct StreamManager {
    transport: Arc<dyn Transport>,
    routing: Arc<RoutingTable>,
}

impl StreamManager {
    pub fn new(transport: Arc<dyn Transport>, routing: Arc<RoutingTable>) -> Self {
        Self { transport, routing }
    }

    pub fn ingestion_spec(&self) -> StreamSpec {
        let ingestion = self.routing.ingestion();
        StreamSpec {
            name: ingestion.stream.clone(),
            subjects: vec![ingestion.subject.clone()],
            max_age: hours(ingestion.retention_hours),
            max_consumers: ingestion.max_consumers,
            description: Some("Raw storage change notifications".to_string()),
        }
    }

    pub fn tier_spec(&self, tier: Tier) -> StreamSpec {
        let entry = self.routing.tier(tier);
        StreamSpec {
            name: entry.stream.clone(),
            subjects: vec![entry.subject.clone()],
            max_age: hours(entry.retention_hours),
            max_consumers: entry.max_consumers,
            description: Some(format!("Storage events for {} files", tier)),
        }
    }

    fn all_specs(&self) -> Vec<StreamSpec> {
        std::iter::once(self.ingestion_spec())
            .chain(Tier::ALL.into_iter().map(|t| self.tier_spec(t)))
            .collect()
    }

    pub async fn ensure_ingestion_stream(&self) -> Result<StreamInfo, TransportError> {
        self.transport.ensure_stream(&self.ingestion_spec()).await
    }

    pub async fn ensure_stream(&self, tier: Tier) -> Result<StreamInfo, TransportError> {
        self.transport.ensure_stream(&self.tier_spec(tier)).await
    }

    /// Ensure the ingestion stream and every tier stream
    #[instrument(skip(self))]
    pub async fn ensure_all(&self) -> Result<(), TransportError> {
        for spec in self.all_specs() {
            let info = self.transport.ensure_stream(&spec).await?;
            info!(stream = %info.name, messages = info.messages, "Stream ensured");
        }
        Ok(())
    }

    /// Per stream: exists and is bound to its configured subject
    pub async fn validate(&self) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for spec in self.all_specs() {
            let healthy = match self.transport.stream_info(&spec.name).await {
                Ok(info) => spec.subjects.iter().all(|s| info.subjects.contains(s)),
                Err(e) => {
                    warn!(stream = %spec.name, error = %e, "Stream validation failed");
                    false
                }
            };
            results.insert(spec.name, healthy);
        }
        results
    }
}

/// Outcome of a stale consumer sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub recreated: Vec<String>,
}

/// Ensures, validates and pulls from the durable consumers
#[derive(Clone)]
pub struct ConsumerManager {
    transport: Arc<dyn Transport>,
    routing: Arc<RoutingTable>,
}

impl ConsumerManager {
    pub fn new(transport: Arc<dyn Transport>, routing: Arc<RoutingTable>) -> Self {
        Self { transport, routing }
    }

    pub fn router_spec(&self) -> ConsumerSpec {
        let ingestion = self.routing.ingestion();
        ConsumerSpec::from_tuning(&ingestion.consumer, &ingestion.subject, &ingestion.tuning)
    }

    pub fn tier_spec(&self, tier: Tier) -> ConsumerSpec {
        let entry = self.routing.tier(tier);
        ConsumerSpec::from_tuning(&entry.consumer, &entry.subject, &entry.worker)
    }

    /// Stream name and consumer spec behind a pull target
    fn resolve(&self, target: PullTarget) -> (String, ConsumerSpec) {
        match target {
            PullTarget::Ingestion => (self.routing.ingestion().stream.clone(), self.router_spec()),
            PullTarget::Tier(tier) => (self.routing.stream(tier).to_string(), self.tier_spec(tier)),
        }
    }

    fn all_targets() -> Vec<PullTarget> {
        std::iter::once(PullTarget::Ingestion)
            .chain(Tier::ALL.into_iter().map(PullTarget::Tier))
            .collect()
    }

    pub async fn ensure_router_consumer(&self) -> Result<ConsumerInfo, TransportError> {
        self.ensure(PullTarget::Ingestion).await
    }

    pub async fn ensure_consumer(&self, tier: Tier) -> Result<ConsumerInfo, TransportError> {
        self.ensure(PullTarget::Tier(tier)).await
    }

    async fn ensure(&self, target: PullTarget) -> Result<ConsumerInfo, TransportError> {
        let (stream, spec) = self.resolve(target);
        let info = self.transport.ensure_consumer(&stream, &spec).await?;
        if info.filter_subject != spec.filter_subject {
            warn!(
                consumer = %info.name,
                expected = %spec.filter_subject,
                actual = %info.filter_subject,
                "Existing consumer is filtered on a different subject"
            );
        }
        debug!(%target, consumer = %info.name, pending = info.num_pending, "Consumer ensured");
        Ok(info)
    }

    /// Ensure the router consumer and every tier consumer
    #[instrument(skip(self))]
    pub async fn ensure_all(&self) -> Result<(), TransportError> {
        for target in Self::all_targets() {
            self.ensure(target).await?;
        }
        Ok(())
    }

    /// Bounded-wait batch fetch. The batch size comes from the target's tuning.
    pub async fn pull(
        &self,
        target: PullTarget,
        timeout: Duration,
    ) -> Result<Vec<IncomingMessage>, TransportError> {
        let batch = match target {
            PullTarget::Ingestion => self.routing.ingestion().tuning.batch_size,
            PullTarget::Tier(tier) => self.routing.worker_config(tier).batch_size,
        };
        self.pull_batch(target, batch, timeout).await
    }

    pub async fn pull_batch(
        &self,
        target: PullTarget,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<IncomingMessage>, TransportError> {
        let (stream, spec) = self.resolve(target);
        self.transport
            .pull(&stream, &spec.durable_name, batch, timeout)
            .await
    }

    /// Delete consumers that are not one of the expected durables, then
    /// re-create any expected durable that has gone missing
    #[instrument(skip(self))]
    pub async fn cleanup_stale_consumers(&self) -> Result<CleanupReport, TransportError> {
        let mut report = CleanupReport::default();

        for target in Self::all_targets() {
            let (stream, spec) = self.resolve(target);
            let names = self.transport.consumer_names(&stream).await?;

            for name in names.iter().filter(|n| **n != spec.durable_name) {
                match self.transport.delete_consumer(&stream, name).await {
                    Ok(()) => {
                        info!(stream = %stream, consumer = %name, "Deleted stale consumer");
                        report.deleted.push(name.clone());
                    }
                    Err(e) => {
                        warn!(stream = %stream, consumer = %name, error = %e, "Failed to delete stale consumer");
                    }
                }
            }

            if !names.contains(&spec.durable_name) {
                self.ensure(target).await?;
                info!(stream = %stream, consumer = %spec.durable_name, "Re-created missing consumer");
                report.recreated.push(spec.durable_name);
            }
        }

        Ok(report)
    }

    /// Per consumer: exists and is filtered on its configured subject
    pub async fn validate(&self) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for target in Self::all_targets() {
            let (stream, spec) = self.resolve(target);
            let healthy = match self.transport.consumer_info(&stream, &spec.durable_name).await {
                Ok(info) => info.filter_subject == spec.filter_subject,
                Err(e) => {
                    warn!(consumer = %spec.durable_name, error = %e, "Consumer validation failed");
                    false
                }
            };
            results.insert(format!("{}/{}", stream, spec.durable_name), healthy);
        }
        results
    }

    pub async fn consumer_info(&self, target: PullTarget) -> Result<ConsumerInfo, TransportError> {
        let (stream, spec) = self.resolve(target);
        self.transport.consumer_info(&stream, &spec.durable_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use crate::transport::{MemoryTransport, OutgoingMessage};

    fn managers() -> (MemoryTransport, StreamManager, ConsumerManager) {
        let transport = MemoryTransport::new();
        let routing = Arc::new(RoutingTable::from_config(&RoutingConfig::default()).unwrap());
        let shared: Arc<dyn Transport> = Arc::new(transport.clone());
        (
            transport,
            StreamManager::new(shared.clone(), routing.clone()),
            ConsumerManager::new(shared, routing),
        )
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let (_, streams, consumers) = managers();
        for _ in 0..2 {
            streams.ensure_all().await.unwrap();
            consumers.ensure_all().await.unwrap();
        }

        assert!(streams.validate().await.values().all(|ok| *ok));
        let consumer_health = consumers.validate().await;
        assert_eq!(consumer_health.len(), 4);
        assert!(consumer_health.values().all(|ok| *ok));
        assert_eq!(
            consumer_health.get("STORAGE_EVENTS/tiered-storage-router"),
            Some(&true)
        );
    }

    #[tokio::test]
    async fn test_validate_reports_missing() {
        let (_, streams, consumers) = managers();
        streams.ensure_stream(Tier::Small).await.unwrap();

        let stream_health = streams.validate().await;
        assert_eq!(stream_health.get("STORAGE_EVENTS_SMALL"), Some(&true));
        assert_eq!(stream_health.get("STORAGE_EVENTS_LARGE"), Some(&false));
        assert!(consumers.validate().await.values().all(|ok| !*ok));
    }

    #[tokio::test]
    async fn test_tier_specs_follow_tuning() {
        let (_, streams, consumers) = managers();
        let large = consumers.tier_spec(Tier::Large);
        assert_eq!(large.durable_name, "large-workers");
        assert_eq!(large.filter_subject, "storage.events.large");
        assert_eq!(large.ack_wait, Duration::from_secs(1800));
        assert_eq!(large.max_deliver, 2);
        assert_eq!(streams.tier_spec(Tier::Large).max_age, hours(48));
        assert_eq!(consumers.router_spec().max_ack_pending, 200);
    }

    #[tokio::test]
    async fn test_cleanup_stale_consumers() {
        let (transport, streams, consumers) = managers();
        streams.ensure_all().await.unwrap();
        consumers.ensure_all().await.unwrap();

        let stale = ConsumerSpec {
            durable_name: "router-1700000000".to_string(),
            ..consumers.router_spec()
        };
        transport.ensure_consumer("STORAGE_EVENTS", &stale).await.unwrap();
        transport
            .delete_consumer("STORAGE_EVENTS_MEDIUM", "medium-workers")
            .await
            .unwrap();

        let report = consumers.cleanup_stale_consumers().await.unwrap();
        assert_eq!(report.deleted, vec!["router-1700000000".to_string()]);
        assert_eq!(report.recreated, vec!["medium-workers".to_string()]);
        assert!(consumers.validate().await.values().all(|ok| *ok));

        let again = consumers.cleanup_stale_consumers().await.unwrap();
        assert_eq!(again, CleanupReport::default());
    }

    #[tokio::test]
    async fn test_pull_uses_tier_batch_size() {
        let (transport, streams, consumers) = managers();
        streams.ensure_all().await.unwrap();
        consumers.ensure_all().await.unwrap();

        for _ in 0..3 {
            transport
                .publish(OutgoingMessage::new("storage.events.large", "{}"))
                .await
                .unwrap();
        }

        let pulled = consumers
            .pull(PullTarget::Tier(Tier::Large), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(pulled.len(), 1);
    }
}

//! Tierflow Pipeline - size-tiered routing of storage change notifications
//!
//! This library provides the shared building blocks of the tierflow system:
//!
//! - The storage event model and its validation rules
//! - Size tiers and the immutable routing table
//! - A durable transport abstraction over NATS JetStream (plus an in-memory
//!   backend), and the stream/consumer lifecycle built on it
//! - Trace propagation through message headers
//! - The router that moves events from the ingestion subject to the tiers
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tierflow_pipeline::{JetStreamTransport, PipelineConfig, Router, RoutingTable};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load()?;
//!     let transport = Arc::new(JetStreamTransport::connect(&config.nats).await?);
//!     let routing = Arc::new(RoutingTable::from_config(&config.routing)?);
//!
//!     let router = Router::new(transport, routing, config.router.clone());
//!     router.setup().await?;
//!     router.run(CancellationToken::new()).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod router;
pub mod streams;
pub mod telemetry;
pub mod tier;
pub mod transport;

// Re-export main types
pub use config::{
    ConfigError, IngestionConfig, NatsConfig, PipelineConfig, RouterSettings, RoutingConfig,
    ScalingPolicy, TelemetryConfig, TierConfig, TierTableConfig, WorkerTuning,
};
pub use error::{Classify, ErrorClass};
pub use event::{
    should_process_raw, EventError, LegacyStorageEvent, StorageEvent, StorageEventMetadata,
    StorageEventType, StoragePathInfo,
};
pub use router::{RouteOutcome, Router, RouterError, RouterStatus, SetupValidation};
pub use streams::{CleanupReport, ConsumerManager, PullTarget, StreamManager};
pub use telemetry::{
    continue_trace, extract_trace_context, inject_trace_context, with_span, TraceContext,
};
pub use tier::{RoutingTable, Tier, TierThresholds};
pub use transport::{
    ConsumerInfo, ConsumerSpec, Headers, IncomingMessage, JetStreamTransport, MemoryTransport,
    OutgoingMessage, PublishAck, StreamInfo, StreamSpec, Transport, TransportError,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::event::{StorageEvent, StorageEventType};
    pub use crate::streams::{ConsumerManager, PullTarget, StreamManager};
    pub use crate::tier::{RoutingTable, Tier};
    pub use crate::transport::{IncomingMessage, OutgoingMessage, Transport, TransportError};
}

//! Tierflow Storage Workers
//!
//! Per-tier workers that consume routed storage events, extract the content
//! of the referenced objects and index it in PostgreSQL.
//!
//! ## Features
//!
//! - **One pull loop per tier**: batch size, ack wait and redelivery limits
//!   come from the shared routing table
//! - **Idempotent indexing**: file and resource ids are derived from the
//!   tenant path, so redeliveries overwrite instead of duplicating
//! - **Exclusive dependencies**: every worker owns its own S3 client and
//!   database pool
//! - **Status API**: health, readiness and per-tier metrics over HTTP
//!
//! ## Architecture
//!
//! ```text
//! NATS JetStream                                          PostgreSQL
//! ┌──────────────────┐     ┌──────────────┐              ┌──────────────┐
//! │ STORAGE_EVENTS_  │     │ Worker       │   upsert /   │ files        │
//! │   SMALL          │────▶│  (small)     │─────────────▶│ resources    │
//! │   MEDIUM         │────▶│  (medium)    │   delete     └──────────────┘
//! │   LARGE          │────▶│  (large)     │                     ▲
//! └──────────────────┘     └──────────────┘                     │
//!                                 │                             │
//!                                 ▼                             │
//!                          ┌──────────────┐    ┌──────────────┐ │
//!                          │ Content      │◀───│ S3 /         │ │
//!                          │ Processor    │    │ SeaweedFS    │ │
//!                          └──────────────┘    └──────────────┘ │
//!                                 │                             │
//!                                 └─────────────────────────────┘
//! ```

pub mod config;
pub mod http;
pub mod processor;
pub mod repository;
pub mod worker;

pub use config::Config;
pub use http::{create_router, start_api_server, AppState};
pub use processor::{
    chunk_text, ContentProcessor, ExtractedResource, ObjectContentProcessor, ProcessedFile,
    ProcessingError,
};
pub use repository::{FileRecord, PostgresRepository, Repository, RepositoryError, ResourceRecord};
pub use worker::{
    Dependencies, DependencyFactory, HealthReport, ManagerStatus, MessageOutcome,
    PostgresS3Factory, StorageEventWorker, TenantScope, WorkerError, WorkerManager,
    WorkerMetrics, WorkerSettings, WorkerStatus, WorkerStatusReport,
};

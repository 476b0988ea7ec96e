//! Durable message transport for the tierflow pipeline.
//!
//! The router and the workers talk to the broker only through the
//! [`Transport`] trait. Two backends are provided:
//!
//! - [`JetStreamTransport`]: NATS JetStream, durable work-queue streams and
//!   explicit-ack pull consumers
//! - [`MemoryTransport`]: in-process work queue with the same ack-wait and
//!   max-deliver semantics, used by tests and single-process runs
//!
//! Messages are pulled in bounded batches and settled individually with
//! [`IncomingMessage::ack`], [`IncomingMessage::nak`] or
//! [`IncomingMessage::term`]. A message is settled at most once.

mod jetstream;
mod memory;

pub use jetstream::JetStreamTransport;
pub use memory::MemoryTransport;

use crate::config::WorkerTuning;
use crate::error::{Classify, ErrorClass};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Flat string-keyed message headers
pub type Headers = HashMap<String, String>;

/// Errors that can occur while talking to the broker
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {message}")]
    Connection { url: String, message: String },

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Consumer not found: {stream}/{consumer}")]
    ConsumerNotFound { stream: String, consumer: String },

    #[error("Stream error on {stream}: {message}")]
    Stream { stream: String, message: String },

    #[error("Consumer error on {consumer}: {message}")]
    Consumer { consumer: String, message: String },

    #[error("Failed to publish to {subject}: {message}")]
    Publish { subject: String, message: String },

    #[error("Failed to fetch from {consumer}: {message}")]
    Fetch { consumer: String, message: String },

    #[error("Failed to settle message: {0}")]
    Ack(String),

    #[error("Failed to serialize message: {0}")]
    Serialization(String),
}

impl Classify for TransportError {
    fn class(&self) -> ErrorClass {
        match self {
            TransportError::Serialization(_) => ErrorClass::Validation,
            _ => ErrorClass::TransientInfra,
        }
    }
}

/// Declarative description of a durable stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub max_age: Duration,
    pub max_consumers: i32,
    pub description: Option<String>,
}

/// Declarative description of a durable, explicit-ack pull consumer
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSpec {
    pub durable_name: String,
    pub filter_subject: String,
    pub ack_wait: Duration,
    pub max_deliver: i64,
    pub max_ack_pending: i64,
}

impl ConsumerSpec {
    pub fn from_tuning(
        durable_name: impl Into<String>,
        filter_subject: impl Into<String>,
        tuning: &WorkerTuning,
    ) -> Self {
        Self {
            durable_name: durable_name.into(),
            filter_subject: filter_subject.into(),
            ack_wait: tuning.ack_wait(),
            max_deliver: tuning.max_deliver,
            max_ack_pending: tuning.max_ack_pending,
        }
    }
}

/// Snapshot of a stream's configuration and state
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub name: String,
    pub subjects: Vec<String>,
    pub messages: u64,
    pub consumer_count: usize,
}

/// Snapshot of a consumer's configuration and state
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub name: String,
    pub filter_subject: String,
    pub ack_wait: Duration,
    pub max_deliver: i64,
    /// Messages not yet delivered
    pub num_pending: u64,
    /// Messages delivered but not yet acknowledged
    pub num_ack_pending: usize,
}

/// Acknowledgement returned by the broker for a published message
#[derive(Debug, Clone, PartialEq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
}

/// Message to be published
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,
}

impl OutgoingMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        subject: impl Into<String>,
        message: &T,
    ) -> Result<Self, TransportError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        Ok(Self::new(subject, payload))
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Merge a set of headers into the message
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// How a pulled message is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Processing succeeded, remove from the work queue
    Ack,
    /// Redeliver as soon as possible
    Nak,
    /// Never redeliver
    Term,
}

/// Backend-specific handle that settles one delivered message
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync {
    async fn settle(&self, settlement: Settlement) -> Result<(), TransportError>;
}

/// A message pulled from a consumer
pub struct IncomingMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,
    /// Delivery attempt, starting at 1
    pub delivered: i64,
    pub stream_sequence: u64,
    acker: Box<dyn Acknowledger>,
    settled: AtomicBool,
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .field("delivered", &self.delivered)
            .field("stream_sequence", &self.stream_sequence)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl IncomingMessage {
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        headers: Headers,
        delivered: i64,
        stream_sequence: u64,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers,
            delivered,
            stream_sequence,
            acker,
            settled: AtomicBool::new(false),
        }
    }

    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| TransportError::Serialization(e.to_string()))
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Whether this delivery is the last one the consumer will make
    pub fn is_last_delivery(&self, max_deliver: i64) -> bool {
        self.delivered >= max_deliver
    }

    pub async fn ack(&self) -> Result<(), TransportError> {
        self.settle(Settlement::Ack).await
    }

    pub async fn nak(&self) -> Result<(), TransportError> {
        self.settle(Settlement::Nak).await
    }

    pub async fn term(&self) -> Result<(), TransportError> {
        self.settle(Settlement::Term).await
    }

    /// Settle the message. A second settlement is a no-op.
    pub async fn settle(&self, settlement: Settlement) -> Result<(), TransportError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.acker.settle(settlement).await;
        if result.is_err() {
            self.settled.store(false, Ordering::Release);
        }
        result
    }
}

/// Operations the router and workers need from the broker
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Create the stream if missing and return its current state
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<StreamInfo, TransportError>;

    /// Create the durable consumer on `stream` if missing
    async fn ensure_consumer(
        &self,
        stream: &str,
        spec: &ConsumerSpec,
    ) -> Result<ConsumerInfo, TransportError>;

    /// Publish and wait for the broker's acknowledgement
    async fn publish(&self, message: OutgoingMessage) -> Result<PublishAck, TransportError>;

    /// Fetch up to `batch` messages, waiting at most `timeout`
    async fn pull(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<IncomingMessage>, TransportError>;

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, TransportError>;

    async fn consumer_info(&self, stream: &str, consumer: &str)
        -> Result<ConsumerInfo, TransportError>;

    async fn consumer_names(&self, stream: &str) -> Result<Vec<String>, TransportError>;

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Flush pending publishes and release the connection
    async fn close(&self) -> Result<(), TransportError>;
}

/// NATS subject matching with `*` and `>` wildcards
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

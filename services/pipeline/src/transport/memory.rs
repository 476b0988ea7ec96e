//! In-process transport with work-queue semantics.
//!
//! Delivered messages stay invisible for the consumer's `ack_wait` and are
//! handed out again afterwards until `max_deliver` attempts are used up. An
//! ack or term removes the message; a nak makes it visible immediately.

use super::{
    subject_matches, Acknowledger, ConsumerInfo, ConsumerSpec, Headers, IncomingMessage,
    OutgoingMessage, PublishAck, Settlement, StreamInfo, StreamSpec, Transport, TransportError,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct StoredMessage {
    subject: String,
    payload: Bytes,
    headers: Headers,
    delivered: i64,
    invisible_until: Option<Instant>,
}

impl StoredMessage {
    fn is_in_flight(&self, now: Instant) -> bool {
        self.invisible_until.map(|until| until > now).unwrap_or(false)
    }
}

#[derive(Debug)]
struct MemoryStream {
    spec: StreamSpec,
    next_sequence: u64,
    messages: BTreeMap<u64, StoredMessage>,
    consumers: HashMap<String, ConsumerSpec>,
}

impl MemoryStream {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            name: self.spec.name.clone(),
            subjects: self.spec.subjects.clone(),
            messages: self.messages.len() as u64,
            consumer_count: self.consumers.len(),
        }
    }

    fn consumer_info(&self, spec: &ConsumerSpec) -> ConsumerInfo {
        let matching = self
            .messages
            .values()
            .filter(|m| subject_matches(&spec.filter_subject, &m.subject));
        let (mut pending, mut ack_pending) = (0u64, 0usize);
        for message in matching {
            if message.delivered == 0 {
                pending += 1;
            } else if message.delivered < spec.max_deliver || message.is_in_flight(Instant::now()) {
                ack_pending += 1;
            }
        }
        ConsumerInfo {
            name: spec.durable_name.clone(),
            filter_subject: spec.filter_subject.clone(),
            ack_wait: spec.ack_wait,
            max_deliver: spec.max_deliver,
            num_pending: pending,
            num_ack_pending: ack_pending,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    streams: Mutex<HashMap<String, MemoryStream>>,
    available: Notify,
    closed: AtomicBool,
}

impl Inner {
    fn streams(&self) -> Result<MutexGuard<'_, HashMap<String, MemoryStream>>, TransportError> {
        self.streams
            .lock()
            .map_err(|_| TransportError::Stream {
                stream: "*".to_string(),
                message: "memory transport state poisoned".to_string(),
            })
    }
}

/// In-memory [`super::Transport`]. Cloning shares the same broker state.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

struct MemoryAcker {
    inner: Arc<Inner>,
    stream: String,
    sequence: u64,
}

#[async_trait::async_trait]
impl Acknowledger for MemoryAcker {
    async fn settle(&self, settlement: Settlement) -> Result<(), TransportError> {
        let mut streams = self.inner.streams()?;
        let stream = streams
            .get_mut(&self.stream)
            .ok_or_else(|| TransportError::StreamNotFound(self.stream.clone()))?;

        match settlement {
            Settlement::Ack | Settlement::Term => {
                stream.messages.remove(&self.sequence);
            }
            Settlement::Nak => {
                if let Some(message) = stream.messages.get_mut(&self.sequence) {
                    message.invisible_until = None;
                }
                drop(streams);
                self.inner.available.notify_waiters();
            }
        }
        Ok(())
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a dropped or restored connection
    pub fn set_connected(&self, connected: bool) {
        self.inner.closed.store(!connected, Ordering::Release);
    }

    /// Number of messages still stored in `stream`
    pub fn message_count(&self, stream: &str) -> usize {
        self.inner
            .streams()
            .ok()
            .and_then(|streams| streams.get(stream).map(|s| s.messages.len()))
            .unwrap_or(0)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    /// Mark up to `batch` visible messages as delivered and hand them out
    fn take_available(
        &self,
        stream_name: &str,
        consumer_name: &str,
        batch: usize,
    ) -> Result<(Vec<IncomingMessage>, Option<Instant>), TransportError> {
        let mut streams = self.inner.streams()?;
        let stream = streams
            .get_mut(stream_name)
            .ok_or_else(|| TransportError::StreamNotFound(stream_name.to_string()))?;
        let spec = stream
            .consumers
            .get(consumer_name)
            .cloned()
            .ok_or_else(|| TransportError::ConsumerNotFound {
                stream: stream_name.to_string(),
                consumer: consumer_name.to_string(),
            })?;

        let now = Instant::now();
        let in_flight = stream
            .messages
            .values()
            .filter(|m| subject_matches(&spec.filter_subject, &m.subject) && m.is_in_flight(now))
            .count() as i64;
        let room = (spec.max_ack_pending - in_flight).max(0) as usize;

        let mut pulled = Vec::new();
        let mut next_visible: Option<Instant> = None;
        for (sequence, message) in stream.messages.iter_mut() {
            if !subject_matches(&spec.filter_subject, &message.subject)
                || message.delivered >= spec.max_deliver
            {
                continue;
            }
            if message.is_in_flight(now) {
                next_visible = match (next_visible, message.invisible_until) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                continue;
            }
            if pulled.len() >= batch.min(room) {
                break;
            }

            message.delivered += 1;
            message.invisible_until = Some(now + spec.ack_wait);
            pulled.push(IncomingMessage::new(
                message.subject.clone(),
                message.payload.clone(),
                message.headers.clone(),
                message.delivered,
                *sequence,
                Box::new(MemoryAcker {
                    inner: self.inner.clone(),
                    stream: stream_name.to_string(),
                    sequence: *sequence,
                }),
            ));
        }

        Ok((pulled, next_visible))
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<StreamInfo, TransportError> {
        self.ensure_open()?;
        let mut streams = self.inner.streams()?;
        let stream = streams.entry(spec.name.clone()).or_insert_with(|| {
            debug!(stream = %spec.name, "Creating in-memory stream");
            MemoryStream {
                spec: spec.clone(),
                next_sequence: 1,
                messages: BTreeMap::new(),
                consumers: HashMap::new(),
            }
        });
        Ok(stream.info())
    }

    async fn ensure_consumer(
        &self,
        stream_name: &str,
        spec: &ConsumerSpec,
    ) -> Result<ConsumerInfo, TransportError> {
        self.ensure_open()?;
        let mut streams = self.inner.streams()?;
        let stream = streams
            .get_mut(stream_name)
            .ok_or_else(|| TransportError::StreamNotFound(stream_name.to_string()))?;
        let spec = stream
            .consumers
            .entry(spec.durable_name.clone())
            .or_insert_with(|| spec.clone())
            .clone();
        Ok(stream.consumer_info(&spec))
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<PublishAck, TransportError> {
        self.ensure_open()?;
        let ack = {
            let mut streams = self.inner.streams()?;
            let stream = streams
                .values_mut()
                .find(|s| {
                    s.spec
                        .subjects
                        .iter()
                        .any(|pattern| subject_matches(pattern, &message.subject))
                })
                .ok_or_else(|| TransportError::Publish {
                    subject: message.subject.clone(),
                    message: "no stream bound to subject".to_string(),
                })?;

            let sequence = stream.next_sequence;
            stream.next_sequence += 1;
            stream.messages.insert(
                sequence,
                StoredMessage {
                    subject: message.subject,
                    payload: message.payload,
                    headers: message.headers,
                    delivered: 0,
                    invisible_until: None,
                },
            );
            PublishAck {
                stream: stream.spec.name.clone(),
                sequence,
            }
        };
        self.inner.available.notify_waiters();
        Ok(ack)
    }

    async fn pull(
        &self,
        stream_name: &str,
        consumer_name: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<IncomingMessage>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_open()?;

            let mut notified = pin!(self.inner.available.notified());
            notified.as_mut().enable();

            let (pulled, next_visible) = self.take_available(stream_name, consumer_name, batch)?;
            if !pulled.is_empty() {
                return Ok(pulled);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_visible.map(|t| t.min(deadline)).unwrap_or(deadline);
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn stream_info(&self, stream_name: &str) -> Result<StreamInfo, TransportError> {
        self.ensure_open()?;
        let streams = self.inner.streams()?;
        streams
            .get(stream_name)
            .map(MemoryStream::info)
            .ok_or_else(|| TransportError::StreamNotFound(stream_name.to_string()))
    }

    async fn consumer_info(
        &self,
        stream_name: &str,
        consumer_name: &str,
    ) -> Result<ConsumerInfo, TransportError> {
        self.ensure_open()?;
        let streams = self.inner.streams()?;
        let stream = streams
            .get(stream_name)
            .ok_or_else(|| TransportError::StreamNotFound(stream_name.to_string()))?;
        stream
            .consumers
            .get(consumer_name)
            .map(|spec| stream.consumer_info(spec))
            .ok_or_else(|| TransportError::ConsumerNotFound {
                stream: stream_name.to_string(),
                consumer: consumer_name.to_string(),
            })
    }

    async fn consumer_names(&self, stream_name: &str) -> Result<Vec<String>, TransportError> {
        self.ensure_open()?;
        let streams = self.inner.streams()?;
        let stream = streams
            .get(stream_name)
            .ok_or_else(|| TransportError::StreamNotFound(stream_name.to_string()))?;
        let mut names: Vec<String> = stream.consumers.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_consumer(
        &self,
        stream_name: &str,
        consumer_name: &str,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut streams = self.inner.streams()?;
        let stream = streams
            .get_mut(stream_name)
            .ok_or_else(|| TransportError::StreamNotFound(stream_name.to_string()))?;
        stream
            .consumers
            .remove(consumer_name)
            .map(|_| ())
            .ok_or_else(|| TransportError::ConsumerNotFound {
                stream: stream_name.to_string(),
                consumer: consumer_name.to_string(),
            })
    }

    fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.available.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup(max_deliver: i64, ack_wait: Duration) -> MemoryTransport {
        let transport = MemoryTransport::new();
        transport
            .ensure_stream(&StreamSpec {
                name: "EVENTS".to_string(),
                subjects: vec!["events".to_string()],
                max_age: Duration::from_secs(60),
                max_consumers: 10,
                description: None,
            })
            .await
            .unwrap();
        transport
            .ensure_consumer(
                "EVENTS",
                &ConsumerSpec {
                    durable_name: "workers".to_string(),
                    filter_subject: "events".to_string(),
                    ack_wait,
                    max_deliver,
                    max_ack_pending: 100,
                },
            )
            .await
            .unwrap();
        transport
    }

    #[tokio::test]
    async fn test_publish_pull_ack() {
        let transport = setup(3, Duration::from_secs(30)).await;
        let ack = transport
            .publish(OutgoingMessage::new("events", "hello").with_header("k", "v"))
            .await
            .unwrap();
        assert_eq!(ack.stream, "EVENTS");
        assert_eq!(ack.sequence, 1);

        let messages = transport
            .pull("EVENTS", "workers", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0].payload[..], b"hello");
        assert_eq!(messages[0].header("k"), Some("v"));
        assert_eq!(messages[0].delivered, 1);

        messages[0].ack().await.unwrap();
        assert_eq!(transport.message_count("EVENTS"), 0);
    }

    #[tokio::test]
    async fn test_unacked_message_is_hidden_until_ack_wait() {
        let transport = setup(3, Duration::from_secs(30)).await;
        transport.publish(OutgoingMessage::new("events", "x")).await.unwrap();

        let first = transport
            .pull("EVENTS", "workers", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = transport
            .pull("EVENTS", "workers", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(second.is_empty());

        first[0].nak().await.unwrap();
        let third = transport
            .pull("EVENTS", "workers", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].delivered, 2);
    }

    #[tokio::test]
    async fn test_max_deliver_exhaustion() {
        let transport = setup(2, Duration::ZERO).await;
        transport.publish(OutgoingMessage::new("events", "x")).await.unwrap();

        for attempt in 1..=2 {
            let messages = transport
                .pull("EVENTS", "workers", 1, Duration::from_millis(10))
                .await
                .unwrap();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].delivered, attempt);
            assert_eq!(messages[0].is_last_delivery(2), attempt == 2);
        }

        let exhausted = transport
            .pull("EVENTS", "workers", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(exhausted.is_empty());
    }

    #[tokio::test]
    async fn test_pull_wakes_on_publish() {
        let transport = setup(3, Duration::from_secs(30)).await;
        let publisher = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish(OutgoingMessage::new("events", "late"))
                .await
                .unwrap();
        });

        let messages = transport
            .pull("EVENTS", "workers", 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_stream_fails() {
        let transport = MemoryTransport::new();
        let result = transport.publish(OutgoingMessage::new("nowhere", "x")).await;
        assert!(matches!(result, Err(TransportError::Publish { .. })));
    }

    #[tokio::test]
    async fn test_consumer_lifecycle() {
        let transport = setup(3, Duration::from_secs(30)).await;
        assert_eq!(transport.consumer_names("EVENTS").await.unwrap(), vec!["workers"]);

        transport.delete_consumer("EVENTS", "workers").await.unwrap();
        assert!(matches!(
            transport.consumer_info("EVENTS", "workers").await,
            Err(TransportError::ConsumerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_calls() {
        let transport = setup(3, Duration::from_secs(30)).await;
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.pull("EVENTS", "workers", 1, Duration::from_millis(10)).await,
            Err(TransportError::NotConnected)
        ));
    }
}

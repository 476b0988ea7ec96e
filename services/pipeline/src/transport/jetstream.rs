//! NATS JetStream backend.

use super::{
    Acknowledger, ConsumerInfo, ConsumerSpec, Headers, IncomingMessage, OutgoingMessage,
    PublishAck, Settlement, StreamInfo, StreamSpec, Transport, TransportError,
};
use crate::config::NatsConfig;
use async_nats::connection::State;
use async_nats::jetstream::{self, consumer, stream, AckKind};
use async_nats::HeaderMap;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

type PullConsumer = consumer::Consumer<consumer::pull::Config>;

/// JetStream transport sharing one client connection
pub struct JetStreamTransport {
    client: async_nats::Client,
    context: jetstream::Context,
    consumers: Mutex<HashMap<(String, String), PullConsumer>>,
}

impl JetStreamTransport {
    /// Connect to the NATS server described by `config`
    pub async fn connect(config: &NatsConfig) -> Result<Self, TransportError> {
        info!(url = %config.url, client = %config.client_name, "Connecting to NATS");

        let options = config
            .connect_options()
            .await
            .map_err(|e| TransportError::Connection {
                url: config.url.clone(),
                message: e.to_string(),
            })?;
        let client = options
            .connect(config.url.as_str())
            .await
            .map_err(|e| TransportError::Connection {
                url: config.url.clone(),
                message: e.to_string(),
            })?;

        info!(url = %config.url, "Connected to NATS");
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        let context = jetstream::new(client.clone());
        Self {
            client,
            context,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    async fn get_stream(&self, name: &str) -> Result<stream::Stream, TransportError> {
        self.context
            .get_stream(name)
            .await
            .map_err(|e| TransportError::Stream {
                stream: name.to_string(),
                message: e.to_string(),
            })
    }

    async fn pull_consumer(
        &self,
        stream_name: &str,
        consumer_name: &str,
    ) -> Result<PullConsumer, TransportError> {
        let key = (stream_name.to_string(), consumer_name.to_string());
        if let Some(existing) = self.cached_consumer(&key) {
            return Ok(existing);
        }

        let stream = self.get_stream(stream_name).await?;
        let consumer: PullConsumer =
            stream
                .get_consumer(consumer_name)
                .await
                .map_err(|e| TransportError::Consumer {
                    consumer: consumer_name.to_string(),
                    message: e.to_string(),
                })?;

        if let Ok(mut cache) = self.consumers.lock() {
            cache.insert(key, consumer.clone());
        }
        Ok(consumer)
    }

    fn cached_consumer(&self, key: &(String, String)) -> Option<PullConsumer> {
        self.consumers
            .lock()
            .ok()
            .and_then(|cache| cache.get(key).cloned())
    }

    fn forget_consumer(&self, stream_name: &str, consumer_name: &str) {
        if let Ok(mut cache) = self.consumers.lock() {
            cache.remove(&(stream_name.to_string(), consumer_name.to_string()));
        }
    }
}

fn stream_info_from(info: &stream::Info) -> StreamInfo {
    StreamInfo {
        name: info.config.name.clone(),
        subjects: info.config.subjects.clone(),
        messages: info.state.messages,
        consumer_count: info.state.consumer_count,
    }
}

fn consumer_info_from(info: &consumer::Info) -> ConsumerInfo {
    ConsumerInfo {
        name: info.name.clone(),
        filter_subject: info.config.filter_subject.clone(),
        ack_wait: info.config.ack_wait,
        max_deliver: info.config.max_deliver,
        num_pending: info.num_pending,
        num_ack_pending: info.num_ack_pending,
    }
}

fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        map.insert(key.as_str(), value.as_str());
    }
    map
}

fn from_header_map(headers: Option<&HeaderMap>) -> Headers {
    let mut out = Headers::new();
    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            if let Some(value) = values.first() {
                out.insert(name.to_string(), value.as_str().to_string());
            }
        }
    }
    out
}

/// Settles a JetStream message through its reply subject
struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait::async_trait]
impl Acknowledger for JetStreamAcker {
    async fn settle(&self, settlement: Settlement) -> Result<(), TransportError> {
        let kind = match settlement {
            Settlement::Ack => AckKind::Ack,
            Settlement::Nak => AckKind::Nak(None),
            Settlement::Term => AckKind::Term,
        };
        self.message
            .ack_with(kind)
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Transport for JetStreamTransport {
    #[instrument(skip(self, spec), fields(stream = %spec.name))]
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<StreamInfo, TransportError> {
        let config = stream::Config {
            name: spec.name.clone(),
            subjects: spec.subjects.clone(),
            retention: stream::RetentionPolicy::WorkQueue,
            storage: stream::StorageType::File,
            max_age: spec.max_age,
            max_consumers: spec.max_consumers,
            num_replicas: 1,
            description: spec.description.clone(),
            ..Default::default()
        };

        let stream = self
            .context
            .get_or_create_stream(config)
            .await
            .map_err(|e| TransportError::Stream {
                stream: spec.name.clone(),
                message: e.to_string(),
            })?;

        let info = stream_info_from(stream.cached_info());
        if info.subjects != spec.subjects {
            warn!(
                stream = %spec.name,
                expected = ?spec.subjects,
                actual = ?info.subjects,
                "Existing stream is bound to different subjects"
            );
        }
        debug!(stream = %info.name, messages = info.messages, "Stream ready");
        Ok(info)
    }

    #[instrument(skip(self, spec), fields(consumer = %spec.durable_name))]
    async fn ensure_consumer(
        &self,
        stream_name: &str,
        spec: &ConsumerSpec,
    ) -> Result<ConsumerInfo, TransportError> {
        let stream = self.get_stream(stream_name).await?;
        let config = consumer::pull::Config {
            durable_name: Some(spec.durable_name.clone()),
            filter_subject: spec.filter_subject.clone(),
            ack_policy: consumer::AckPolicy::Explicit,
            deliver_policy: consumer::DeliverPolicy::All,
            ack_wait: spec.ack_wait,
            max_deliver: spec.max_deliver,
            max_ack_pending: spec.max_ack_pending,
            ..Default::default()
        };

        let consumer: PullConsumer = stream
            .get_or_create_consumer(&spec.durable_name, config)
            .await
            .map_err(|e| TransportError::Consumer {
                consumer: spec.durable_name.clone(),
                message: e.to_string(),
            })?;

        let info = consumer_info_from(consumer.cached_info());
        if let Ok(mut cache) = self.consumers.lock() {
            cache.insert(
                (stream_name.to_string(), spec.durable_name.clone()),
                consumer,
            );
        }
        Ok(info)
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<PublishAck, TransportError> {
        let publish_error = |e: String| TransportError::Publish {
            subject: message.subject.clone(),
            message: e,
        };

        let ack = self
            .context
            .publish_with_headers(
                message.subject.clone(),
                to_header_map(&message.headers),
                message.payload.clone(),
            )
            .await
            .map_err(|e| publish_error(e.to_string()))?
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
        })
    }

    async fn pull(
        &self,
        stream_name: &str,
        consumer_name: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<IncomingMessage>, TransportError> {
        let fetch_error = |e: String| TransportError::Fetch {
            consumer: consumer_name.to_string(),
            message: e,
        };

        let consumer = self.pull_consumer(stream_name, consumer_name).await?;
        let messages = match consumer
            .batch()
            .max_messages(batch)
            .expires(timeout)
            .messages()
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                // The consumer may have been deleted underneath us
                self.forget_consumer(stream_name, consumer_name);
                return Err(fetch_error(e.to_string()));
            }
        };

        tokio::pin!(messages);

        let mut pulled = Vec::with_capacity(batch);
        while let Some(next) = messages.next().await {
            let message = next.map_err(|e| fetch_error(e.to_string()))?;
            let (delivered, stream_sequence) = match message.info() {
                Ok(info) => (info.delivered, info.stream_sequence),
                Err(e) => {
                    warn!(error = %e, "Message without JetStream metadata, assuming first delivery");
                    (1, 0)
                }
            };

            pulled.push(IncomingMessage::new(
                message.subject.to_string(),
                message.payload.clone(),
                from_header_map(message.headers.as_ref()),
                delivered,
                stream_sequence,
                Box::new(JetStreamAcker { message }),
            ));
        }

        Ok(pulled)
    }

    async fn stream_info(&self, stream_name: &str) -> Result<StreamInfo, TransportError> {
        let mut stream = self.get_stream(stream_name).await?;
        let info = stream.info().await.map_err(|e| TransportError::Stream {
            stream: stream_name.to_string(),
            message: e.to_string(),
        })?;
        Ok(stream_info_from(info))
    }

    async fn consumer_info(
        &self,
        stream_name: &str,
        consumer_name: &str,
    ) -> Result<ConsumerInfo, TransportError> {
        let stream = self.get_stream(stream_name).await?;
        let info = stream
            .consumer_info(consumer_name)
            .await
            .map_err(|e| TransportError::Consumer {
                consumer: consumer_name.to_string(),
                message: e.to_string(),
            })?;
        Ok(consumer_info_from(&info))
    }

    async fn consumer_names(&self, stream_name: &str) -> Result<Vec<String>, TransportError> {
        let stream = self.get_stream(stream_name).await?;
        stream
            .consumer_names()
            .try_collect()
            .await
            .map_err(|e| TransportError::Stream {
                stream: stream_name.to_string(),
                message: e.to_string(),
            })
    }

    async fn delete_consumer(
        &self,
        stream_name: &str,
        consumer_name: &str,
    ) -> Result<(), TransportError> {
        let stream = self.get_stream(stream_name).await?;
        self.forget_consumer(stream_name, consumer_name);
        stream
            .delete_consumer(consumer_name)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Consumer {
                consumer: consumer_name.to_string(),
                message: e.to_string(),
            })
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Ok(mut cache) = self.consumers.lock() {
            cache.clear();
        }
        self.client
            .flush()
            .await
            .map_err(|_| TransportError::NotConnected)?;
        info!("NATS connection flushed");
        Ok(())
    }
}

//! NATS JetStream transport client.

use async_nats::jetstream;
use async_nats::jetstream::stream::{
    Config as JetStreamConfig, DiscardPolicy, RetentionPolicy, StorageType,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    DeliveryFn, StreamConfig, StreamInfo, Subscription, Transport, TransportError, TransportResult,
};

/// Production transport over a NATS server with JetStream enabled.
///
/// Publishes go through the JetStream context so the append is
/// acknowledged by the stream; subscriptions use plain core NATS
/// delivery on the same subjects.
pub struct NatsTransport {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream_name: Mutex<Option<String>>,
}

impl NatsTransport {
    pub async fn connect(url: &str) -> TransportResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|error| TransportError::Unavailable(error.to_string()))?;
        let jetstream = jetstream::new(client.clone());
        Ok(Self {
            client,
            jetstream,
            stream_name: Mutex::new(None),
        })
    }

    fn ensured_stream_name(&self) -> TransportResult<String> {
        self.stream_name
            .lock()
            .clone()
            .ok_or(TransportError::StreamNotEnsured)
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn ensure_stream(&self, config: StreamConfig) -> TransportResult<()> {
        let jetstream_config = JetStreamConfig {
            name: config.name.clone(),
            subjects: config.subjects.clone(),
            retention: RetentionPolicy::Limits,
            discard: DiscardPolicy::Old,
            max_age: config.max_age,
            storage: StorageType::File,
            ..Default::default()
        };

        match self.jetstream.get_stream(&config.name).await {
            Ok(_) => {
                self.jetstream
                    .update_stream(&jetstream_config)
                    .await
                    .map_err(|error| TransportError::Stream {
                        name: config.name.clone(),
                        reason: format!("update: {error}"),
                    })?;
                debug!(stream = %config.name, "stream configuration updated");
            }
            Err(_) => {
                self.jetstream
                    .create_stream(jetstream_config)
                    .await
                    .map_err(|error| TransportError::Stream {
                        name: config.name.clone(),
                        reason: format!("create: {error}"),
                    })?;
                debug!(stream = %config.name, "stream created");
            }
        }

        *self.stream_name.lock() = Some(config.name);
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> TransportResult<()> {
        let ack = self
            .jetstream
            .publish(subject.to_owned(), Bytes::from(payload))
            .await
            .map_err(|error| TransportError::Publish {
                subject: subject.to_owned(),
                reason: error.to_string(),
            })?;
        ack.await.map_err(|error| TransportError::Publish {
            subject: subject.to_owned(),
            reason: format!("ack: {error}"),
        })?;
        Ok(())
    }

    async fn subscribe(&self, subject: &str, deliver: DeliveryFn) -> TransportResult<Subscription> {
        let mut subscriber = self
            .client
            .subscribe(subject.to_owned())
            .await
            .map_err(|error| TransportError::Subscribe {
                subject: subject.to_owned(),
                reason: error.to_string(),
            })?;
        self.client
            .flush()
            .await
            .map_err(|error| TransportError::Subscribe {
                subject: subject.to_owned(),
                reason: format!("flush: {error}"),
            })?;

        let task = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                deliver(&message.payload);
            }
        });
        Ok(Subscription::new(task))
    }

    async fn stream_info(&self) -> TransportResult<StreamInfo> {
        let name = self.ensured_stream_name()?;
        let mut stream =
            self.jetstream
                .get_stream(&name)
                .await
                .map_err(|error| TransportError::Stream {
                    name: name.clone(),
                    reason: error.to_string(),
                })?;
        let info = stream.info().await.map_err(|error| TransportError::Stream {
            name: name.clone(),
            reason: format!("info: {error}"),
        })?;
        Ok(StreamInfo {
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
            messages: info.state.messages,
        })
    }

    async fn message_by_sequence(&self, sequence: u64) -> TransportResult<Option<Vec<u8>>> {
        let name = self.ensured_stream_name()?;
        let stream = self
            .jetstream
            .get_stream(&name)
            .await
            .map_err(|error| TransportError::Stream {
                name: name.clone(),
                reason: error.to_string(),
            })?;
        match stream.get_raw_message(sequence).await {
            Ok(raw) => Ok(Some(raw.payload.to_vec())),
            Err(error) => {
                // Aged-out and deleted sequences are expected during a
                // backward scan; treat every lookup failure as a gap.
                debug!(sequence, %error, "stored message lookup failed");
                Ok(None)
            }
        }
    }

    async fn close(&self) {
        if let Err(error) = self.client.flush().await {
            warn!(%error, "flush before close failed");
        }
    }
}

//! Outbound/inbound channel pair over JetStream.
//!
//! The two halves are independent: commands leave through a pooled set of
//! producer connections, results arrive on a dedicated consumer connection
//! with a durable explicit-ack consumer. A result is acked only after it has
//! been handed to the correlation broker, so a crash between receive and
//! hand-off yields a redelivery rather than a lost reply.

use super::correlation::CorrelationBroker;
use super::envelope::{CommandEnvelope, ResultEnvelope, HEADER_CORRELATION_ID};
use super::pool::NatsPool;
use async_nats::jetstream::{self, consumer};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const HEADER_KIND: &str = "Fuzzmesh-Kind";

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("broker connect failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("consume failed: {0}")]
    Consume(String),
    #[error("envelope encode failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone)]
pub struct MqConfig {
    pub url: String,
    pub pool_size: usize,
    pub tasks_subject: String,
    pub results_subject: String,
    pub dlq_subject: String,
    pub tasks_stream: String,
    pub results_stream: String,
    pub consumer_name: String,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            url: "127.0.0.1:4222".into(),
            pool_size: 2,
            tasks_subject: "fuzzmesh.tasks".into(),
            results_subject: "fuzzmesh.results".into(),
            dlq_subject: "fuzzmesh.dlq".into(),
            tasks_stream: "FUZZMESH_TASKS".into(),
            results_stream: "FUZZMESH_RESULTS".into(),
            consumer_name: "task-gateway".into(),
        }
    }
}

/// Seam between the correlation broker and the transport. Production code
/// publishes through [`OutboundChannel`]; tests substitute a recorder.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn publish(&self, cmd: &CommandEnvelope) -> Result<(), TransportError>;
}

pub struct OutboundChannel {
    pool: NatsPool,
    subject: String,
}

impl OutboundChannel {
    pub fn pool(&self) -> &NatsPool {
        &self.pool
    }
}

#[async_trait]
impl CommandSink for OutboundChannel {
    async fn publish(&self, cmd: &CommandEnvelope) -> Result<(), TransportError> {
        let body = serde_json::to_vec(cmd).map_err(|e| TransportError::Encode(e.to_string()))?;
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(HEADER_CORRELATION_ID, cmd.correlation_id.to_string().as_str());
        headers.insert(HEADER_KIND, cmd.kind.as_str());
        self.pool
            .publish_with_headers(self.subject.clone(), headers, body)
            .await?;
        debug!(correlation_id = %cmd.correlation_id, kind = %cmd.kind, "command published");
        Ok(())
    }
}

pub struct InboundChannel {
    js: jetstream::Context,
    consumer: consumer::Consumer<consumer::pull::Config>,
    dlq_subject: String,
}

impl InboundChannel {
    /// Consume results until the stream closes, handing each envelope to the
    /// broker before acking it. Undecodable messages go to the dead-letter
    /// subject so they cannot wedge the consumer.
    pub async fn run(&self, broker: Arc<CorrelationBroker>) -> Result<(), TransportError> {
        let mut messages = self
            .consumer
            .messages()
            .await
            .map_err(|e| TransportError::Consume(e.to_string()))?;

        while let Some(item) = messages.next().await {
            let msg = match item {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "result stream hiccup");
                    continue;
                }
            };

            match serde_json::from_slice::<ResultEnvelope>(&msg.payload) {
                Ok(envelope) => {
                    broker.deliver(envelope);
                }
                Err(e) => {
                    let correlation = msg
                        .headers
                        .as_ref()
                        .and_then(|h| h.get(HEADER_CORRELATION_ID))
                        .map(|v| v.as_str().to_string());
                    warn!(error = %e, ?correlation, "undecodable result, dead-lettering");
                    if let Err(e) = self.dead_letter(msg.payload.to_vec()).await {
                        error!(error = %e, "dead-letter publish failed, dropping message");
                    }
                }
            }

            if let Err(e) = msg.ack().await {
                warn!(error = %e, "ack failed, message will be redelivered");
            }
        }

        Err(TransportError::Consume("result stream closed".into()))
    }

    async fn dead_letter(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.js
            .publish(self.dlq_subject.clone(), payload.into())
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        Ok(())
    }
}

pub struct ChannelPair {
    pub outbound: OutboundChannel,
    pub inbound: InboundChannel,
}

impl ChannelPair {
    /// Connect both halves and provision the task, result and dead-letter
    /// streams. Idempotent across restarts.
    pub async fn connect(cfg: &MqConfig) -> Result<Self, TransportError> {
        let pool = NatsPool::connect(&cfg.url, cfg.pool_size).await?;

        ensure_stream(pool.context(), &cfg.tasks_stream, &cfg.tasks_subject).await?;

        let inbound_client = async_nats::connect(cfg.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let js = jetstream::new(inbound_client);

        let results = ensure_stream(&js, &cfg.results_stream, &cfg.results_subject).await?;
        ensure_stream(&js, &format!("{}_DLQ", cfg.results_stream), &cfg.dlq_subject).await?;

        let consumer = results
            .get_or_create_consumer(
                &cfg.consumer_name,
                consumer::pull::Config {
                    durable_name: Some(cfg.consumer_name.clone()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        info!(url = %cfg.url, pool = pool.size(), "channel pair connected");
        Ok(Self {
            outbound: OutboundChannel { pool, subject: cfg.tasks_subject.clone() },
            inbound: InboundChannel { js, consumer, dlq_subject: cfg.dlq_subject.clone() },
        })
    }
}

async fn ensure_stream(
    js: &jetstream::Context,
    name: &str,
    subject: &str,
) -> Result<jetstream::stream::Stream, TransportError> {
    js.get_or_create_stream(jetstream::stream::Config {
        name: name.to_string(),
        subjects: vec![subject.to_string()],
        ..Default::default()
    })
    .await
    .map_err(|e| TransportError::Connect(e.to_string()))
}

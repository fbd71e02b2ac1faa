//! NATS connection pool for the producer side of the channel pair.
//!
//! Each slot is its own TCP connection with its own JetStream context, so a
//! stalled consumer connection can never back-pressure command publishing.

use super::channel::TransportError;
use async_nats::jetstream;
use async_nats::Client;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct NatsPool {
    connections: Vec<(Client, jetstream::Context)>,
    semaphore: Arc<Semaphore>,
    next_index: Mutex<usize>,
}

impl NatsPool {
    /// Create pool with specified size.
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self, TransportError> {
        let pool_size = pool_size.max(1);
        let mut connections = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let client = async_nats::connect(url)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let context = jetstream::new(client.clone());
            connections.push((client, context));
        }

        Ok(Self {
            connections,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            next_index: Mutex::new(0),
        })
    }

    /// Get next JetStream context using round-robin.
    pub fn context(&self) -> &jetstream::Context {
        let mut index = self.next_index.lock();
        let slot = *index % self.connections.len();
        *index = (*index + 1) % self.connections.len();
        &self.connections[slot].1
    }

    /// Publish with automatic connection selection, awaiting the stream ack.
    pub async fn publish_with_headers(
        &self,
        subject: String,
        headers: async_nats::HeaderMap,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        let context = self.context();
        context
            .publish_with_headers(subject, headers, payload.into())
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        Ok(())
    }

    /// Get pool size.
    pub fn size(&self) -> usize {
        self.connections.len()
    }

    /// Flush all connections; best effort during shutdown.
    pub async fn flush(&self) {
        for (client, _) in &self.connections {
            if let Err(e) = client.flush().await {
                tracing::warn!(error = %e, "flush failed during shutdown");
            }
        }
    }
}

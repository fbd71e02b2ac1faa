//! Wire envelopes exchanged with worker processes.
//!
//! Payloads are opaque byte blobs, base64-encoded inside the JSON envelope.
//! The correlation id is also mirrored into a NATS header so brokers and
//! tooling can route without decoding the body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Header carrying the correlation id alongside the encoded envelope.
pub const HEADER_CORRELATION_ID: &str = "Fuzzmesh-Correlation-Id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub correlation_id: Uuid,
    pub kind: String,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// Workers skip commands whose deadline already passed.
    pub deadline: DateTime<Utc>,
}

impl CommandEnvelope {
    pub fn new(correlation_id: Uuid, kind: impl Into<String>, payload: Vec<u8>, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let deadline =
            created_at + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self { correlation_id, kind: kind.into(), payload, created_at, deadline }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Ok,
    Failed,
    /// The worker gave up because the command deadline passed before it ran.
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub correlation_id: Uuid,
    pub status: ResultStatus,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

//! Application-facing job API: resolve the requested combination, then drive
//! the command through the correlation broker.
//!
//! Rejections return before any broker traffic. Background submissions retry
//! transport faults with backoff; timeouts are assumed to be worker-side and
//! are never retried.

use crate::mq::{CallError, CorrelationBroker, ResultEnvelope, ResultStatus, TransportError};
use fuzzmesh_core::catalog::{Catalog, EngineId, ImageId, LangId};
use fuzzmesh_core::resilience::{retry_async, RetryConfig};
use fuzzmesh_core::resolver::{CompatibilityTriple, RejectionReason, Resolver};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const KIND_START_FUZZER: &str = "task-gateway.fuzzer.start";
pub const KIND_UPDATE_FUZZER: &str = "task-gateway.fuzzer.update";
pub const KIND_STOP_FUZZER: &str = "task-gateway.fuzzer.stop";
pub const KIND_STOP_POOL_FUZZERS: &str = "task-gateway.pool.stop_all_fuzzers";

/// Resource budget and identity of a fuzzer run, as supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub user_id: String,
    pub project_id: String,
    pub pool_id: String,
    pub fuzzer_id: String,
    pub fuzzer_rev: String,
    pub cpu_usage: u32,
    pub ram_usage: u32,
    pub tmpfs_size: u32,
    pub reset_state: bool,
    pub is_verified: bool,
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub lang: LangId,
    pub engine: EngineId,
    pub image: Option<ImageId>,
    pub job: JobSpec,
}

/// Start command as workers see it: the job spec plus the resolved triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartFuzzer {
    #[serde(flatten)]
    pub job: JobSpec,
    pub fuzzer_lang: LangId,
    pub fuzzer_engine: EngineId,
    pub image_id: ImageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJob {
    pub pool_id: String,
    pub fuzzer_id: String,
    pub fuzzer_rev: String,
    pub cpu_usage: u32,
    pub ram_usage: u32,
    pub tmpfs_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopJob {
    pub pool_id: String,
    pub fuzzer_id: String,
    pub fuzzer_rev: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StopPool {
    pool_id: String,
}

/// Status block workers attach to their replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReport {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerReply {
    pub correlation_id: Uuid,
    pub status: ResultStatus,
    /// Decoded report when the payload parses; raw bytes are kept either way.
    pub report: Option<WorkerReport>,
    pub payload: Vec<u8>,
}

impl WorkerReply {
    fn from_envelope(envelope: ResultEnvelope) -> Self {
        let report = serde_json::from_slice(&envelope.payload).ok();
        Self {
            correlation_id: envelope.correlation_id,
            status: envelope.status,
            report,
            payload: envelope.payload,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub triple: CompatibilityTriple,
    pub reply: WorkerReply,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Rejected(#[from] RejectionReason),
    #[error(transparent)]
    Transport(TransportError),
    #[error("worker did not answer in time")]
    Timeout,
    #[error("submission cancelled")]
    Cancelled,
}

impl From<CallError> for DispatchError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Transport(t) => Self::Transport(t),
            CallError::Timeout => Self::Timeout,
            CallError::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub interactive_timeout: Duration,
    pub background_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interactive_timeout: Duration::from_secs(30),
            background_timeout: Duration::from_secs(300),
            retry: RetryConfig {
                max_retries: 4,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                jitter: 0.25,
            },
        }
    }
}

pub struct TaskDispatcher {
    resolver: Resolver,
    broker: Arc<CorrelationBroker>,
    cfg: DispatcherConfig,
}

impl TaskDispatcher {
    pub fn new(catalog: Arc<Catalog>, broker: Arc<CorrelationBroker>, cfg: DispatcherConfig) -> Self {
        Self { resolver: Resolver::new(catalog), broker, cfg }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Interactive submission: one attempt, short timeout.
    pub async fn submit_job(&self, req: &JobRequest) -> Result<JobResult, DispatchError> {
        let (triple, payload) = self.prepare(req)?;
        let result = self
            .broker
            .call(KIND_START_FUZZER, payload, self.cfg.interactive_timeout)
            .await?;
        Ok(JobResult { triple, reply: WorkerReply::from_envelope(result) })
    }

    /// Background submission: long timeout, bounded backoff retries on
    /// transport faults only. Rejections and timeouts are terminal.
    pub async fn submit_background_job(&self, req: &JobRequest) -> Result<JobResult, DispatchError> {
        let (triple, payload) = self.prepare(req)?;
        let reply = retry_async(
            &self.cfg.retry,
            |e: &DispatchError| matches!(e, DispatchError::Transport(_)),
            |attempt| {
                let payload = payload.clone();
                async move {
                    if attempt > 0 {
                        debug!(attempt, fuzzer_id = %req.job.fuzzer_id, "retrying background submission");
                    }
                    let result = self
                        .broker
                        .call(KIND_START_FUZZER, payload, self.cfg.background_timeout)
                        .await?;
                    Ok::<_, DispatchError>(WorkerReply::from_envelope(result))
                }
            },
        )
        .await?;
        Ok(JobResult { triple, reply })
    }

    pub async fn update_job(&self, update: &UpdateJob) -> Result<WorkerReply, DispatchError> {
        self.plain_call(KIND_UPDATE_FUZZER, update).await
    }

    pub async fn stop_job(&self, stop: &StopJob) -> Result<WorkerReply, DispatchError> {
        self.plain_call(KIND_STOP_FUZZER, stop).await
    }

    pub async fn stop_pool(&self, pool_id: &str) -> Result<WorkerReply, DispatchError> {
        self.plain_call(KIND_STOP_POOL_FUZZERS, &StopPool { pool_id: pool_id.to_string() })
            .await
    }

    fn prepare(&self, req: &JobRequest) -> Result<(CompatibilityTriple, Vec<u8>), DispatchError> {
        let triple = self.resolver.resolve(&req.lang, &req.engine, req.image.as_ref())?;
        let command = StartFuzzer {
            job: req.job.clone(),
            fuzzer_lang: triple.lang.clone(),
            fuzzer_engine: triple.engine.clone(),
            image_id: triple.image.clone(),
        };
        let payload = encode(&command)?;
        Ok((triple, payload))
    }

    async fn plain_call<T: Serialize>(
        &self,
        kind: &str,
        command: &T,
    ) -> Result<WorkerReply, DispatchError> {
        let payload = encode(command)?;
        let result = self.broker.call(kind, payload, self.cfg.interactive_timeout).await?;
        Ok(WorkerReply::from_envelope(result))
    }
}

fn encode<T: Serialize>(command: &T) -> Result<Vec<u8>, DispatchError> {
    serde_json::to_vec(command)
        .map_err(|e| DispatchError::Transport(TransportError::Encode(e.to_string())))
}

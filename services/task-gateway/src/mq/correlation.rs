//! Request/response matching over the fire-and-forget channel pair.
//!
//! Every call registers a pending entry keyed by a fresh correlation id,
//! publishes the command, and suspends on a oneshot until the consumer loop
//! delivers the matching result or the deadline elapses. The pending table is
//! the only shared mutable state; the lock is never held across an await.

use super::channel::{CommandSink, TransportError};
use super::envelope::{CommandEnvelope, ResultEnvelope};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no result before deadline")]
    Timeout,
    #[error("call cancelled")]
    Cancelled,
}

struct Pending {
    tx: oneshot::Sender<ResultEnvelope>,
    deadline: Instant,
}

pub struct CorrelationBroker {
    sink: Arc<dyn CommandSink>,
    pending: Mutex<HashMap<Uuid, Pending>>,
}

impl CorrelationBroker {
    pub fn new(sink: Arc<dyn CommandSink>) -> Arc<Self> {
        Arc::new(Self { sink, pending: Mutex::new(HashMap::new()) })
    }

    /// Publish a command and wait for its correlated result.
    ///
    /// Dropping the returned future cancels only the local wait: the command
    /// stays with the workers and its eventual result is dropped as orphaned.
    pub async fn call(
        &self,
        kind: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<ResultEnvelope, CallError> {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            // v4 ids are collision-free for any realistic pending set.
            debug_assert!(!pending.contains_key(&correlation_id));
            pending.insert(correlation_id, Pending { tx, deadline: Instant::now() + timeout });
        }

        let envelope = CommandEnvelope::new(correlation_id, kind, payload, timeout);
        if let Err(e) = self.sink.publish(&envelope).await {
            self.pending.lock().remove(&correlation_id);
            return Err(CallError::Transport(e));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            // Sender dropped: the broker shut down while we were waiting.
            Ok(Err(_)) => Err(CallError::Cancelled),
            Err(_) => {
                self.pending.lock().remove(&correlation_id);
                Err(CallError::Timeout)
            }
        }
    }

    /// Hand an inbound result to its waiter. First delivery wins; anything
    /// without a live pending entry is orphaned and dropped.
    pub fn deliver(&self, result: ResultEnvelope) {
        let entry = self.pending.lock().remove(&result.correlation_id);
        match entry {
            Some(p) => {
                if p.tx.send(result).is_err() {
                    debug!("waiter gone before delivery, result dropped");
                }
            }
            None => {
                debug!(correlation_id = %result.correlation_id, "orphaned result discarded");
            }
        }
    }

    /// Drop entries whose waiter vanished (cancelled calls) or whose deadline
    /// passed long enough ago that the caller's own timeout path must have
    /// fired. Returns how many entries were reclaimed.
    pub fn sweep(&self) -> usize {
        let grace = Duration::from_secs(1);
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| !p.tx.is_closed() && now < p.deadline + grace);
        before - pending.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let swept = broker.sweep();
                if swept > 0 {
                    debug!(swept, "reclaimed abandoned pending requests");
                }
            }
        })
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Cancel every in-flight call; their waiters resolve to `Cancelled`.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        let n = drained.len();
        if n > 0 {
            info!(cancelled = n, "pending requests flushed on shutdown");
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::envelope::ResultStatus;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct RecordingSink {
        tx: mpsc::UnboundedSender<CommandEnvelope>,
        fail: Mutex<usize>,
    }

    impl RecordingSink {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CommandEnvelope>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { tx, fail: Mutex::new(0) }), rx)
        }

        fn fail_next(&self, n: usize) {
            *self.fail.lock() = n;
        }
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn publish(&self, cmd: &CommandEnvelope) -> Result<(), TransportError> {
            {
                let mut fail = self.fail.lock();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(TransportError::Publish("simulated outage".into()));
                }
            }
            self.tx.send(cmd.clone()).unwrap();
            Ok(())
        }
    }

    fn ok_result(correlation_id: Uuid, payload: &[u8]) -> ResultEnvelope {
        ResultEnvelope { correlation_id, status: ResultStatus::Ok, payload: payload.to_vec() }
    }

    #[tokio::test]
    async fn matching_result_resolves_call_once() {
        let (sink, mut cmds) = RecordingSink::new();
        let broker = CorrelationBroker::new(sink);

        let responder = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let cmd = cmds.recv().await.unwrap();
                broker.deliver(ok_result(cmd.correlation_id, b"done"));
                // Duplicate delivery for the same id must be a no-op.
                broker.deliver(ok_result(cmd.correlation_id, b"dup"));
                cmd.correlation_id
            })
        };

        let result = broker
            .call("test.echo", b"ping".to_vec(), Duration::from_secs(2))
            .await
            .unwrap();
        let id = responder.await.unwrap();
        assert_eq!(result.correlation_id, id);
        assert_eq!(result.payload, b"done");
        assert_eq!(broker.pending_len(), 0);
    }

    #[tokio::test]
    async fn deadline_elapse_yields_timeout_and_orphans_late_result() {
        let (sink, mut cmds) = RecordingSink::new();
        let broker = CorrelationBroker::new(sink);

        let err = broker
            .call("test.slow", vec![], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout));
        assert_eq!(broker.pending_len(), 0);

        // The worker answers after we gave up: discarded, no panic, no leak.
        let cmd = cmds.recv().await.unwrap();
        broker.deliver(ok_result(cmd.correlation_id, b"too late"));
        assert_eq!(broker.pending_len(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_match_their_own_results() {
        let (sink, mut cmds) = RecordingSink::new();
        let broker = CorrelationBroker::new(sink);
        const N: usize = 16;

        let responder = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..N {
                    seen.push(cmds.recv().await.unwrap());
                }
                // Answer in reverse arrival order to force interleaving.
                for cmd in seen.into_iter().rev() {
                    broker.deliver(ok_result(cmd.correlation_id, cmd.payload.as_slice()));
                }
            })
        };

        let mut calls = tokio::task::JoinSet::new();
        for i in 0..N {
            let broker = Arc::clone(&broker);
            calls.spawn(async move {
                let payload = format!("job-{i}").into_bytes();
                let result = broker
                    .call("test.echo", payload.clone(), Duration::from_secs(2))
                    .await
                    .unwrap();
                assert_eq!(result.payload, payload);
            });
        }
        while let Some(res) = calls.join_next().await {
            res.unwrap();
        }
        responder.await.unwrap();
        assert_eq!(broker.pending_len(), 0);
    }

    #[tokio::test]
    async fn publish_failure_rolls_back_pending_entry() {
        let (sink, _cmds) = RecordingSink::new();
        sink.fail_next(1);
        let broker = CorrelationBroker::new(sink);

        let err = broker.call("test.echo", vec![], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CallError::Transport(_)));
        assert_eq!(broker.pending_len(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_waiters() {
        let (sink, _cmds) = RecordingSink::new();
        let broker = CorrelationBroker::new(sink);

        let call = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker.call("test.echo", vec![], Duration::from_secs(5)).await
            })
        };
        // Let the call register before flushing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.shutdown(), 1);
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CallError::Cancelled));
    }

    #[tokio::test]
    async fn sweep_reclaims_abandoned_entries() {
        let (sink, _cmds) = RecordingSink::new();
        let broker = CorrelationBroker::new(sink);

        let call = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker.call("test.echo", vec![], Duration::from_secs(30)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.pending_len(), 1);

        // Caller walks away mid-wait; its receiver is dropped with the task.
        call.abort();
        let _ = call.await;
        assert_eq!(broker.sweep(), 1);
        assert_eq!(broker.pending_len(), 0);
    }
}

//! Gateway service wiring: catalog, channel pair, correlation broker and the
//! task dispatcher assembled into one process.

use anyhow::Result;
use fuzzmesh_core::catalog::Catalog;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub mod dispatcher;
pub mod mq;

pub use dispatcher::{
    DispatchError, DispatcherConfig, JobRequest, JobResult, JobSpec, StopJob, TaskDispatcher,
    UpdateJob, WorkerReply, WorkerReport,
};
use mq::{ChannelPair, CorrelationBroker, MqConfig, OutboundChannel, TransportError};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// A started gateway: the dispatcher plus the background tasks behind it.
pub struct Gateway {
    pub dispatcher: Arc<TaskDispatcher>,
    broker: Arc<CorrelationBroker>,
    outbound: Arc<OutboundChannel>,
    consumer: tokio::task::JoinHandle<()>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl Gateway {
    pub async fn start(catalog: Arc<Catalog>, mq: MqConfig) -> Result<Self, TransportError> {
        Self::start_with(catalog, mq, DispatcherConfig::default()).await
    }

    pub async fn start_with(
        catalog: Arc<Catalog>,
        mq: MqConfig,
        dispatcher_cfg: DispatcherConfig,
    ) -> Result<Self, TransportError> {
        let ChannelPair { outbound, inbound } = ChannelPair::connect(&mq).await?;
        let outbound = Arc::new(outbound);
        let sink: Arc<dyn mq::CommandSink> = Arc::clone(&outbound) as Arc<dyn mq::CommandSink>;
        let broker = CorrelationBroker::new(sink);

        let consumer = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                if let Err(e) = inbound.run(broker).await {
                    error!(error = %e, "result consumer stopped");
                }
            })
        };
        let sweeper = broker.spawn_sweeper(SWEEP_INTERVAL);

        let dispatcher = Arc::new(TaskDispatcher::new(
            catalog,
            Arc::clone(&broker),
            dispatcher_cfg,
        ));

        Ok(Self { dispatcher, broker, outbound, consumer, sweeper })
    }

    /// Stop consuming, cancel in-flight calls and flush producer connections.
    pub async fn shutdown(self) {
        self.consumer.abort();
        self.sweeper.abort();
        self.broker.shutdown();
        self.outbound.pool().flush().await;
        info!("gateway shut down");
    }
}

pub async fn run() -> Result<()> {
    let cfg = fuzzmesh_core::load_config("task-gateway")?;

    let catalog = match cfg.catalog_file.as_deref() {
        Some(path) => Arc::new(Catalog::from_yaml_file(path)?),
        None => Arc::new(Catalog::builtin()),
    };
    info!(
        langs = catalog.languages().len(),
        engines = catalog.engines().len(),
        images = catalog.images().len(),
        "catalog loaded"
    );

    fuzzmesh_core::start_health_server(cfg.health_port.unwrap_or(8080)).await?;

    let mut mq = MqConfig::default();
    if let Some(url) = cfg.nats_url.clone() {
        mq.url = url;
    }

    let gateway = match Gateway::start(Arc::clone(&catalog), mq).await {
        Ok(gw) => {
            fuzzmesh_core::mark_ready();
            info!(target: "task-gateway", "Connected to NATS");
            Some(gw)
        }
        Err(e) => {
            warn!(target: "task-gateway", error = %e, "NATS unavailable - running degraded mode");
            None
        }
    };

    if std::env::var("FUZZMESH_RUN_ONCE").is_ok() {
        if let Some(gw) = gateway {
            gw.shutdown().await;
        }
        return Ok(());
    }

    tokio::signal::ctrl_c().await?;
    info!(target: "task-gateway", "Shutdown signal received");
    fuzzmesh_core::clear_ready();
    if let Some(gw) = gateway {
        gw.shutdown().await;
    }
    Ok(())
}

use anyhow::Result;
use fuzzmesh_core::init_tracing;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("task-gateway")?;
    info!(target: "task-gateway", "Starting task-gateway service");
    task_gateway::run().await
}

//! Core shared utilities for fuzzmesh services.

use anyhow::Result;
use axum::{routing::get, Router};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }

pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let json = std::env::var("FUZZMESH_JSON_LOG")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let env_filter = tracing_subscriber::EnvFilter::from_default_env();
        let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
        if json {
            builder.json().flatten_event(true).try_init()
        } else {
            builder.with_target(true).with_line_number(true).try_init()
        }
        .map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))
    })?;
    info!(target: "fuzzmesh", service, "Tracing initialized");
    Ok(())
}

pub async fn start_health_server(port: u16) -> Result<()> {
    let app = Router::new()
        .route("/live", get(|| async {
            axum::Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)}))
        }))
        .route("/ready", get(|| async {
            axum::Json(serde_json::json!({"ready": NODE_READINESS.load(Ordering::SeqCst)}))
        }))
        .route("/status", get(|| async {
            axum::Json(serde_json::json!({
                "live": NODE_LIVENESS.load(Ordering::SeqCst),
                "ready": NODE_READINESS.load(Ordering::SeqCst),
            }))
        }));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(?addr, "Health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "Health server failed");
        }
    });
    Ok(())
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub service_name: Option<String>,
    pub nats_url: Option<String>,
    pub log_level: Option<String>,
    pub catalog_file: Option<String>,
    pub health_port: Option<u16>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            nats_url: Some("127.0.0.1:4222".into()),
            log_level: Some("info".into()),
            catalog_file: None,
            health_port: Some(8080),
        }
    }
}

/// Layered settings: defaults, then an optional file named by
/// `FUZZMESH_CONFIG_FILE`, then `FUZZMESH_*` environment overrides.
pub fn load_config(service: &str) -> Result<GatewayConfig> {
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?
        .set_default("nats_url", "127.0.0.1:4222")?
        .set_default("log_level", "info")?
        .set_default("health_port", 8080_i64)?;

    if let Ok(file) = std::env::var("FUZZMESH_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("FUZZMESH").separator("__"));
    let cfg = builder.build()?;
    Ok(cfg.try_deserialize()?)
}

pub mod catalog;
pub mod resilience;
pub mod resolver;

pub use catalog::{
    Catalog, CatalogDef, CatalogError, Engine, EngineId, Image, ImageId, ImageStatus, LangId,
    Language,
};
pub use resilience::{retry_async, RetryConfig};
pub use resolver::{CompatibilityTriple, RejectionReason, Resolver};

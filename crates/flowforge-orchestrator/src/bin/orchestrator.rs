use std::sync::Arc;

use anyhow::{Context, Result};
use flowforge_bus::RedisMessageBus;
use flowforge_core::bus::MessageBus;
use flowforge_core::kv::KvStore;
use flowforge_kv::RedisKvStore;
use flowforge_orchestrator::coordinator::Phase;
use flowforge_orchestrator::{Config, PhaseCoordinator, WorkflowEngine};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "flowforge_orchestrator=info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let config = Config::from_env().context("loading orchestrator configuration")?;
    tracing::info!(instance_id = %config.instance_id, "flowforge-orchestrator starting");

    let bus: Arc<dyn MessageBus> = Arc::new(
        RedisMessageBus::connect(&config.message_bus_url)
            .await
            .context("connecting to message bus")?,
    );
    let kv: Arc<dyn KvStore> = Arc::new(
        RedisKvStore::connect(&config.kv_url)
            .await
            .context("connecting to KV store")?,
    );

    let engine = Arc::new(WorkflowEngine::new(config.instance_id.clone(), Arc::clone(&bus), kv));

    let mut handles = Vec::new();
    for (enabled, phase) in [
        (config.coordinators.plan, Phase::Plan),
        (config.coordinators.code, Phase::Code),
        (config.coordinators.certify, Phase::Certify),
        (config.coordinators.deploy, Phase::Deploy),
        (config.coordinators.monitor, Phase::Monitor),
    ] {
        if !enabled {
            continue;
        }
        let coordinator = Arc::new(PhaseCoordinator::new(phase, Arc::clone(&bus), Arc::clone(&engine)));
        handles.push(tokio::spawn(async move { coordinator.run().await }));
    }

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");

    for handle in handles {
        handle.abort();
    }

    Ok(())
}

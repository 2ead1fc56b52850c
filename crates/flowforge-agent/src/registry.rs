//! Agent registration: a lightweight directory of which agent types are
//! currently online, kept in the KV store so the orchestrator can route
//! stage dispatch away from agent types with no live workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowforge_core::error::Result;
use flowforge_core::kv::KvStore;
use serde::{Deserialize, Serialize};

const REGISTRATION_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub agent_type: String,
    pub max_concurrency: usize,
    pub registered_at: DateTime<Utc>,
}

fn registry_key(agent_type: &str, agent_id: &str) -> String {
    format!("agents:{agent_type}:{agent_id}")
}

/// Write this agent's registration, refreshed on every heartbeat via the
/// registration's TTL so dead agents fall out of the directory on their own.
pub async fn register(kv: &dyn KvStore, registration: &AgentRegistration) -> Result<()> {
    let bytes = serde_json::to_vec(registration)?;
    kv.set(
        &registry_key(&registration.agent_type, &registration.agent_id),
        bytes,
        Some(REGISTRATION_TTL),
    )
    .await
}

pub async fn deregister(kv: &dyn KvStore, agent_type: &str, agent_id: &str) -> Result<()> {
    kv.del(&registry_key(agent_type, agent_id)).await
}

/// Periodically refresh `registration`'s TTL until `shutdown` fires.
pub async fn heartbeat_loop(
    kv: Arc<dyn KvStore>,
    registration: AgentRegistration,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = register(kv.as_ref(), &registration).await {
                    tracing::warn!(error = %e, "agent registration heartbeat failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

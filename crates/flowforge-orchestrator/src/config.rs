//! Process configuration, loaded from environment variables (spec.md §6).

use std::env;
use std::time::Duration;

/// Which phase coordinators (spec.md §4, orchestrator component 8) this
/// process runs. Each is independently toggled so an operator can split
/// coordinators across processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorToggles {
    pub plan: bool,
    pub code: bool,
    pub certify: bool,
    pub deploy: bool,
    pub monitor: bool,
}

impl CoordinatorToggles {
    fn from_env() -> Self {
        Self {
            plan: env_flag("ENABLE_PLAN", false),
            code: env_flag("ENABLE_CODE", false),
            certify: env_flag("ENABLE_CERTIFY", false),
            deploy: env_flag("ENABLE_DEPLOY", false),
            monitor: env_flag("ENABLE_MONITOR", false),
        }
    }

    pub fn any(&self) -> bool {
        self.plan || self.code || self.certify || self.deploy || self.monitor
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Connection string for the message bus adapter (`flowforge-bus`).
    pub message_bus_url: String,

    /// Connection string for the KV store adapter (`flowforge-kv`).
    pub kv_url: String,

    /// Key prefix this process's KV store adapter scopes all keys under.
    pub kv_namespace: String,

    /// Default TTL applied to KV entries that don't specify their own.
    pub kv_default_ttl: Duration,

    pub coordinators: CoordinatorToggles,

    /// This process's identity, used as `source` on published envelopes and
    /// as the default lock holder name.
    pub instance_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Environment variables:
    /// - `MESSAGE_BUS_URL` (required)
    /// - `KV_URL` (required)
    /// - `KV_NAMESPACE` (default: `flowforge`)
    /// - `KV_DEFAULT_TTL` seconds (default: 3600)
    /// - `ENABLE_PLAN` / `ENABLE_CODE` / `ENABLE_CERTIFY` / `ENABLE_DEPLOY` / `ENABLE_MONITOR`
    /// - `INSTANCE_ID` (default: a fresh UUID)
    ///
    /// Fails if a phase coordinator is enabled but its model API credential
    /// is absent — an orchestrator that can't reach an agent it's supposed
    /// to coordinate for should not start silently degraded.
    pub fn from_env() -> Result<Self, ConfigError> {
        let message_bus_url = env::var("MESSAGE_BUS_URL").map_err(|_| ConfigError::Missing("MESSAGE_BUS_URL"))?;
        let kv_url = env::var("KV_URL").map_err(|_| ConfigError::Missing("KV_URL"))?;
        let kv_namespace = env::var("KV_NAMESPACE").unwrap_or_else(|_| "flowforge".to_string());
        let kv_default_ttl = Duration::from_secs(
            env::var("KV_DEFAULT_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
        );
        let coordinators = CoordinatorToggles::from_env();
        let instance_id = env::var("INSTANCE_ID").unwrap_or_else(|_| format!("orchestrator-{}", uuid::Uuid::now_v7()));

        if coordinators.any() && env::var("ANTHROPIC_API_KEY").is_err() && env::var("OPENAI_API_KEY").is_err() {
            return Err(ConfigError::Missing("ANTHROPIC_API_KEY or OPENAI_API_KEY"));
        }

        Ok(Self {
            message_bus_url,
            kv_url,
            kv_namespace,
            kv_default_ttl,
            coordinators,
            instance_id,
        })
    }
}

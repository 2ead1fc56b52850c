//! Resolves a platform/workflow-type pair to a [`WorkflowDefinition`],
//! preferring a platform's own customized stage graph and falling back to
//! the built-in sequence for that workflow type (spec.md §4.7).

use std::sync::Arc;
use std::time::Duration;

use flowforge_core::error::Result;
use flowforge_core::kv::KvStore;
use flowforge_schemas::workflow::{
    workflow_types, OnFailure, OnSuccess, RetryStrategy, StageDefinition, WorkflowDefinition,
};
use flowforge_schemas::agent_envelope::builtin_agents;
use tracing::debug;

/// How long a resolved definition is cached before the KV-stored override is
/// re-checked.
const DEFINITION_CACHE_TTL: Duration = Duration::from_secs(60);

fn definition_key(platform_id: &str, workflow_type: &str) -> String {
    format!("workflow-definitions:{platform_id}:{workflow_type}")
}

struct CachedDefinition {
    definition: Arc<WorkflowDefinition>,
    is_fallback: bool,
    cached_at: tokio::time::Instant,
}

/// A resolved stage graph plus whether it came from the built-in fallback
/// rather than a platform override (the resolver cannot tell "never had an
/// override" apart from "override was deleted" — both read back as absent
/// from the KV store — so `is_fallback` covers both).
#[derive(Debug, Clone)]
pub struct ResolvedDefinition {
    pub definition: Arc<WorkflowDefinition>,
    pub is_fallback: bool,
}

pub struct WorkflowDefinitionResolver {
    kv: Arc<dyn KvStore>,
    cache: tokio::sync::RwLock<std::collections::HashMap<String, CachedDefinition>>,
}

impl WorkflowDefinitionResolver {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            cache: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Store (and validate) a platform-specific override for `workflow_type`.
    pub async fn put_override(&self, platform_id: &str, definition: WorkflowDefinition) -> Result<()> {
        definition
            .validate()
            .map_err(|e| flowforge_core::error::CoreError::Validation(e.to_string()))?;
        let bytes = serde_json::to_vec(&definition)?;
        self.kv
            .set(&definition_key(platform_id, &definition.workflow_type), bytes, None)
            .await?;
        self.cache.write().await.remove(&definition_key(platform_id, &definition.workflow_type));
        Ok(())
    }

    /// Resolve the stage graph for `(platform_id, workflow_type)`: a
    /// platform override if one exists and is enabled, otherwise the
    /// built-in fallback sequence for `workflow_type`.
    pub async fn resolve(
        &self,
        platform_id: &str,
        workflow_type: &str,
    ) -> Result<ResolvedDefinition> {
        let cache_key = definition_key(platform_id, workflow_type);

        if let Some(cached) = self.cache.read().await.get(&cache_key) {
            if cached.cached_at.elapsed() < DEFINITION_CACHE_TTL {
                return Ok(ResolvedDefinition {
                    definition: Arc::clone(&cached.definition),
                    is_fallback: cached.is_fallback,
                });
            }
        }

        let (resolved, is_fallback) = match self.kv.get(&cache_key).await? {
            Some(bytes) => {
                let definition: WorkflowDefinition = serde_json::from_slice(&bytes)?;
                if definition.enabled {
                    (Arc::new(definition), false)
                } else {
                    debug!(platform_id, workflow_type, "override disabled, using builtin");
                    (Arc::new(builtin_definition(platform_id, workflow_type)), true)
                }
            }
            None => (Arc::new(builtin_definition(platform_id, workflow_type)), true),
        };

        self.cache.write().await.insert(
            cache_key,
            CachedDefinition {
                definition: Arc::clone(&resolved),
                is_fallback,
                cached_at: tokio::time::Instant::now(),
            },
        );

        Ok(ResolvedDefinition { definition: resolved, is_fallback })
    }

    /// Drop a cached entry so the next [`resolve`](Self::resolve) rereads
    /// the KV store (used after [`put_override`](Self::put_override) from a
    /// different resolver instance, e.g. another orchestrator process).
    pub async fn invalidate(&self, platform_id: &str, workflow_type: &str) {
        self.cache.write().await.remove(&definition_key(platform_id, workflow_type));
    }
}

fn stage(name: &str, agent_type: &str, on_success: OnSuccess, weight: u32) -> StageDefinition {
    StageDefinition {
        name: name.to_string(),
        agent_type: agent_type.to_string(),
        timeout_ms: 600_000,
        retry_strategy: RetryStrategy::default(),
        on_success,
        on_failure: OnFailure::End,
        weight,
    }
}

/// Chain a linear sequence of `(name, agent_type)` pairs into `on_success`
/// edges, splitting `budget` points across them (remainder on the last
/// stage) so every success path sums to exactly 100.
fn linear_chain(names: &[(&str, &str)]) -> Vec<StageDefinition> {
    let share = 100 / names.len() as u32;
    let mut remainder = 100 - share * names.len() as u32;

    names
        .iter()
        .enumerate()
        .map(|(i, (name, agent_type))| {
            let on_success = match names.get(i + 1) {
                Some((next, _)) => OnSuccess::Stage { name: (*next).to_string() },
                None => OnSuccess::End,
            };
            let mut weight = share;
            if remainder > 0 {
                weight += 1;
                remainder -= 1;
            }
            stage(name, agent_type, on_success, weight)
        })
        .collect()
}

/// Built-in stage sequences used when a platform has no override (spec.md
/// §4.7), each beginning with `initialization`:
/// - `app`: initialization -> scaffolding -> dependency_installation ->
///   validation -> e2e_testing -> integration -> deployment -> monitoring
/// - `feature`: initialization -> scaffolding -> dependency_installation ->
///   validation -> e2e_testing
/// - `bugfix`: initialization -> validation -> e2e_testing
/// - `service`: initialization -> scaffolding -> dependency_installation ->
///   validation -> integration -> deployment
/// - `capability`: initialization -> implementation -> validation
fn builtin_definition(platform_id: &str, workflow_type: &str) -> WorkflowDefinition {
    use builtin_agents as a;

    let stages = match workflow_type {
        workflow_types::APP => linear_chain(&[
            ("initialization", a::INITIALIZATION),
            ("scaffolding", a::SCAFFOLD),
            ("dependency_installation", a::DEPENDENCY_INSTALLATION),
            ("validation", a::VALIDATION),
            ("e2e_testing", a::E2E),
            ("integration", a::INTEGRATION),
            ("deployment", a::DEPLOYMENT),
            ("monitoring", a::MONITORING),
        ]),
        workflow_types::FEATURE => linear_chain(&[
            ("initialization", a::INITIALIZATION),
            ("scaffolding", a::SCAFFOLD),
            ("dependency_installation", a::DEPENDENCY_INSTALLATION),
            ("validation", a::VALIDATION),
            ("e2e_testing", a::E2E),
        ]),
        workflow_types::BUGFIX => linear_chain(&[
            ("initialization", a::INITIALIZATION),
            ("validation", a::VALIDATION),
            ("e2e_testing", a::E2E),
        ]),
        workflow_types::SERVICE => linear_chain(&[
            ("initialization", a::INITIALIZATION),
            ("scaffolding", a::SCAFFOLD),
            ("dependency_installation", a::DEPENDENCY_INSTALLATION),
            ("validation", a::VALIDATION),
            ("integration", a::INTEGRATION),
            ("deployment", a::DEPLOYMENT),
        ]),
        workflow_types::CAPABILITY => linear_chain(&[
            ("initialization", a::INITIALIZATION),
            ("implementation", a::IMPLEMENTATION),
            ("validation", a::VALIDATION),
        ]),
        other => {
            debug!(workflow_type = other, "unknown workflow type, using single-validation fallback");
            linear_chain(&[("validation", a::VALIDATION)])
        }
    };

    WorkflowDefinition {
        platform_id: platform_id.to_string(),
        workflow_type: workflow_type.to_string(),
        enabled: true,
        stages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_kv::InMemoryKvStore;

    fn resolver() -> WorkflowDefinitionResolver {
        WorkflowDefinitionResolver::new(Arc::new(InMemoryKvStore::new()))
    }

    #[tokio::test]
    async fn resolves_builtin_app_sequence_when_no_override() {
        let resolver = resolver();
        let resolved = resolver.resolve("acme", workflow_types::APP).await.unwrap();
        assert!(resolved.is_fallback);
        let def = resolved.definition;
        assert_eq!(def.stages.len(), 8);
        assert_eq!(def.stages[0].name, "initialization");
        assert_eq!(def.stages.last().unwrap().name, "monitoring");
        assert!(def.validate().is_ok());
    }

    #[tokio::test]
    async fn unknown_workflow_type_falls_back_to_single_stage() {
        let resolver = resolver();
        let resolved = resolver.resolve("acme", "custom-ml").await.unwrap();
        assert!(resolved.is_fallback);
        assert_eq!(resolved.definition.stages.len(), 1);
    }

    #[tokio::test]
    async fn platform_override_wins_over_builtin() {
        let resolver = resolver();
        let custom = WorkflowDefinition {
            platform_id: "acme".to_string(),
            workflow_type: workflow_types::APP.to_string(),
            enabled: true,
            stages: vec![stage("only-stage", builtin_agents::VALIDATION, OnSuccess::End, 100)],
        };
        resolver.put_override("acme", custom).await.unwrap();

        let resolved = resolver.resolve("acme", workflow_types::APP).await.unwrap();
        assert!(!resolved.is_fallback);
        assert_eq!(resolved.definition.stages.len(), 1);
        assert_eq!(resolved.definition.stages[0].name, "only-stage");
    }

    #[tokio::test]
    async fn disabled_override_falls_back_to_builtin() {
        let resolver = resolver();
        let custom = WorkflowDefinition {
            platform_id: "acme".to_string(),
            workflow_type: workflow_types::APP.to_string(),
            enabled: false,
            stages: vec![stage("only-stage", builtin_agents::VALIDATION, OnSuccess::End, 100)],
        };
        resolver.put_override("acme", custom).await.unwrap();

        let resolved = resolver.resolve("acme", workflow_types::APP).await.unwrap();
        assert!(resolved.is_fallback);
        assert_eq!(resolved.definition.stages.len(), 8);
    }
}

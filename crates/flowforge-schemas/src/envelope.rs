//! Envelope protocol
//!
//! Every message that crosses the bus is an [`Envelope`]: a typed header plus
//! an opaque JSON payload. Business code must never inspect a payload before
//! it has passed [`validate`] (or a payload-specific schema registered for
//! its `type`).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Errors raised while constructing, validating, or parsing an envelope.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// `type` does not match `^[a-z0-9.]+$`
    #[error("invalid envelope type: {0}")]
    InvalidType(String),

    /// Payload failed the schema registered for this envelope's `type`
    #[error("invalid payload for type {type_}: {reason}")]
    InvalidPayload { type_: String, reason: String },

    /// `json` could not be deserialized into an envelope at all
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Per-envelope bookkeeping: attempt count, last error, schema version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMeta {
    /// Number of delivery attempts so far (0 on first publish)
    #[serde(default)]
    pub attempts: u32,

    /// The error recorded on the most recent failed attempt, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Suggested delay (ms) before the next retry, set by `retry_envelope`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,

    /// Envelope schema version, bumped on every retry
    #[serde(default = "EnvelopeMeta::default_version")]
    pub version: u32,

    /// Free-form extension slot for callers that need to stash extra context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

impl EnvelopeMeta {
    fn default_version() -> u32 {
        1
    }
}

impl Default for EnvelopeMeta {
    fn default() -> Self {
        Self {
            attempts: 0,
            last_error: None,
            retry_after: None,
            version: 1,
            custom: None,
        }
    }
}

/// The unit of transport for every topic in the system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique per delivery attempt
    pub id: Uuid,

    /// Dotted event-type tag, e.g. `task.result`, `system.dead_letter`
    pub r#type: String,

    /// When this envelope was created
    pub ts: DateTime<Utc>,

    /// Ties together every envelope belonging to the same logical operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    pub meta: EnvelopeMeta,

    /// Type-specific body; never inspected by the bus, only by validators
    /// registered for `type` and by business handlers.
    pub payload: Value,
}

static TYPE_PATTERN: &str = r"^[a-z0-9.]+$";

fn type_regex() -> regex::Regex {
    regex::Regex::new(TYPE_PATTERN).expect("static envelope type pattern is valid")
}

/// Construct a brand new envelope with a fresh id and `meta.attempts = 0`.
pub fn create_envelope(
    r#type: impl Into<String>,
    payload: Value,
    corr_id: Option<Uuid>,
    tenant_id: Option<String>,
    source: Option<String>,
) -> Envelope {
    Envelope {
        id: Uuid::now_v7(),
        r#type: r#type.into(),
        ts: Utc::now(),
        corr_id,
        tenant_id,
        source,
        meta: EnvelopeMeta::default(),
        payload,
    }
}

/// Derive a retry envelope from `original`: new id, same correlation id,
/// `attempts + 1`, bumped version, `last_error` recorded.
pub fn retry_envelope(original: &Envelope, error: Option<String>) -> Envelope {
    let mut meta = original.meta.clone();
    meta.attempts += 1;
    meta.version += 1;
    meta.last_error = error;

    Envelope {
        id: Uuid::now_v7(),
        r#type: original.r#type.clone(),
        ts: Utc::now(),
        corr_id: original.corr_id,
        tenant_id: original.tenant_id.clone(),
        source: original.source.clone(),
        meta,
        payload: original.payload.clone(),
    }
}

/// `true` once an envelope has attempted at least `max_retries` times and
/// must be routed to the DLQ instead of retried again.
pub fn has_exhausted_retries(env: &Envelope, max_retries: u32) -> bool {
    env.meta.attempts >= max_retries
}

/// A schema validator for one envelope `type`.
pub trait PayloadValidator: Send + Sync {
    fn validate(&self, payload: &Value) -> Result<(), String>;
}

impl<F> PayloadValidator for F
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, payload: &Value) -> Result<(), String> {
        (self)(payload)
    }
}

/// Registry of `type -> validator`, consulted by [`validate`].
///
/// Unregistered types are accepted (forward compatibility, spec.md §4.1 edge
/// cases): unknown event types are permitted and routed to an "unknown type"
/// counter rather than rejected.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    validators: Arc<HashMap<String, Arc<dyn PayloadValidator>>>,
}

pub struct SchemaRegistryBuilder {
    validators: HashMap<String, Arc<dyn PayloadValidator>>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder {
            validators: HashMap::new(),
        }
    }

    pub fn validate_payload(&self, r#type: &str, payload: &Value) -> Result<(), EnvelopeError> {
        match self.validators.get(r#type) {
            Some(v) => v.validate(payload).map_err(|reason| EnvelopeError::InvalidPayload {
                type_: r#type.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Whether `type` has no registered validator — forward-compat path.
    pub fn is_unknown_type(&self, r#type: &str) -> bool {
        !self.validators.contains_key(r#type)
    }
}

impl SchemaRegistryBuilder {
    pub fn register(mut self, r#type: impl Into<String>, validator: impl PayloadValidator + 'static) -> Self {
        self.validators.insert(r#type.into(), Arc::new(validator));
        self
    }

    pub fn build(self) -> SchemaRegistry {
        SchemaRegistry {
            validators: Arc::new(self.validators),
        }
    }
}

/// Validate `env` against the §3 invariants and, if present, its registered
/// payload schema. Does not mutate `env`.
pub fn validate(env: &Envelope, registry: &SchemaRegistry) -> Result<(), EnvelopeError> {
    if !type_regex().is_match(&env.r#type) {
        return Err(EnvelopeError::InvalidType(env.r#type.clone()));
    }
    registry.validate_payload(&env.r#type, &env.payload)
}

/// Parse a JSON document into an [`Envelope`]. Does not run schema
/// validation — call [`validate`] afterward.
pub fn parse(json: &str) -> Result<Envelope, EnvelopeError> {
    serde_json::from_str(json).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

/// Serialize an envelope back to its wire JSON form.
pub fn serialize(env: &Envelope) -> Result<String, EnvelopeError> {
    serde_json::to_string(env).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

/// Type-guard suffixes recognized by the fan-out dispatch layer.
pub fn is_request(env: &Envelope) -> bool {
    env.r#type.ends_with(".request")
}

pub fn is_result(env: &Envelope) -> bool {
    env.r#type.ends_with(".result")
}

pub fn is_error(env: &Envelope) -> bool {
    env.r#type.ends_with(".error")
}

pub fn is_system(env: &Envelope) -> bool {
    env.r#type.starts_with("system.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builder()
            .register("task.request", |payload: &Value| {
                if payload.get("task_id").is_some() {
                    Ok(())
                } else {
                    Err("missing task_id".to_string())
                }
            })
            .build()
    }

    #[test]
    fn create_sets_fresh_id_and_zero_attempts() {
        let env = create_envelope("task.request", json!({"task_id": "1"}), None, None, None);
        assert_eq!(env.meta.attempts, 0);
        assert_eq!(env.meta.version, 1);
    }

    #[test]
    fn retry_bumps_attempts_and_version_preserves_corr_id() {
        let corr = Uuid::now_v7();
        let original = create_envelope("task.request", json!({}), Some(corr), None, None);
        let retried = retry_envelope(&original, Some("boom".to_string()));

        assert_ne!(retried.id, original.id);
        assert_eq!(retried.corr_id, Some(corr));
        assert_eq!(retried.meta.attempts, 1);
        assert_eq!(retried.meta.version, 2);
        assert_eq!(retried.meta.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn validate_rejects_bad_type() {
        let mut env = create_envelope("task.request", json!({"task_id": "1"}), None, None, None);
        env.r#type = "Task.Request".to_string();
        assert!(matches!(
            validate(&env, &registry()),
            Err(EnvelopeError::InvalidType(_))
        ));
    }

    #[test]
    fn validate_rejects_bad_payload_for_known_type() {
        let env = create_envelope("task.request", json!({}), None, None, None);
        assert!(matches!(
            validate(&env, &registry()),
            Err(EnvelopeError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn unknown_types_pass_validation_for_forward_compatibility() {
        let env = create_envelope("some.brand.new.type", json!({"anything": true}), None, None, None);
        assert!(validate(&env, &registry()).is_ok());
        assert!(registry().is_unknown_type("some.brand.new.type"));
    }

    #[test]
    fn round_trips_through_serialize_and_parse() {
        let env = create_envelope("task.request", json!({"task_id": "1"}), Some(Uuid::now_v7()), Some("t1".into()), Some("unit-test".into()));
        let json = serialize(&env).unwrap();
        let parsed = parse(&json).unwrap();
        assert_eq!(env, parsed);
    }

    #[test]
    fn has_exhausted_retries_boundary() {
        let mut env = create_envelope("task.request", json!({}), None, None, None);
        env.meta.attempts = 3;
        assert!(has_exhausted_retries(&env, 3));
        assert!(!has_exhausted_retries(&env, 4));
    }

    #[test]
    fn type_guards_match_suffix_and_prefix() {
        let mut env = create_envelope("task.request", json!({}), None, None, None);
        assert!(is_request(&env));
        env.r#type = "task.result".into();
        assert!(is_result(&env));
        env.r#type = "task.error".into();
        assert!(is_error(&env));
        env.r#type = "system.dead_letter".into();
        assert!(is_system(&env));
    }
}

mod registry;

use std::collections::HashMap;

use jsonschema::Validator;
use once_cell::sync::Lazy;
use serde_json::Value;
use thiserror::Error;

/// Kinds of on-disk records governed by a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaKind {
    ResolvedConfig,
    PlanEntry,
    TrialRecord,
    ParsedOutput,
    EmbeddingRecord,
    ClusterAssignment,
    MonitoringRecord,
    ClustersState,
    Aggregates,
    EmbeddingsProvenance,
    Manifest,
}

impl SchemaKind {
    pub const ALL: [SchemaKind; 11] = [
        SchemaKind::ResolvedConfig,
        SchemaKind::PlanEntry,
        SchemaKind::TrialRecord,
        SchemaKind::ParsedOutput,
        SchemaKind::EmbeddingRecord,
        SchemaKind::ClusterAssignment,
        SchemaKind::MonitoringRecord,
        SchemaKind::ClustersState,
        SchemaKind::Aggregates,
        SchemaKind::EmbeddingsProvenance,
        SchemaKind::Manifest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaKind::ResolvedConfig => "resolved_config",
            SchemaKind::PlanEntry => "plan_entry",
            SchemaKind::TrialRecord => "trial_record",
            SchemaKind::ParsedOutput => "parsed_output",
            SchemaKind::EmbeddingRecord => "embedding_record",
            SchemaKind::ClusterAssignment => "cluster_assignment",
            SchemaKind::MonitoringRecord => "monitoring_record",
            SchemaKind::ClustersState => "clusters_state",
            SchemaKind::Aggregates => "aggregates",
            SchemaKind::EmbeddingsProvenance => "embeddings_provenance",
            SchemaKind::Manifest => "manifest",
        }
    }
}

impl std::fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One schema violation with a JSON-pointer path into the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub pointer: String,
    pub message: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pointer = if self.pointer.is_empty() {
            "/"
        } else {
            self.pointer.as_str()
        };
        write!(f, "{}: {}", pointer, self.message)
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema registry failed to compile: {0}")]
    Registry(String),
    #[error("{kind} failed validation: {}", summarize(.violations))]
    Invalid {
        kind: &'static str,
        violations: Vec<SchemaViolation>,
    },
}

fn summarize(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

static VALIDATORS: Lazy<Result<HashMap<SchemaKind, Validator>, String>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for kind in SchemaKind::ALL {
        let schema = registry::schema_for(kind);
        let validator = jsonschema::validator_for(&schema)
            .map_err(|err| format!("{}: {err}", kind.as_str()))?;
        map.insert(kind, validator);
    }
    Ok(map)
});

/// Pure predicate: does `value` satisfy the schema for `kind`? Errors carry
/// JSON-pointer paths into the offending instance.
pub fn validate(kind: SchemaKind, value: &Value) -> Result<(), SchemaError> {
    let validators = VALIDATORS
        .as_ref()
        .map_err(|err| SchemaError::Registry(err.clone()))?;
    let validator = validators
        .get(&kind)
        .ok_or_else(|| SchemaError::Registry(format!("no validator for {kind}")))?;

    let violations: Vec<SchemaViolation> = validator
        .iter_errors(value)
        .map(|err| SchemaViolation {
            pointer: err.instance_path.to_string(),
            message: err.to_string(),
        })
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::Invalid {
            kind: kind.as_str(),
            violations,
        })
    }
}

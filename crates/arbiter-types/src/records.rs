use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ProtocolType, StopMode, StopPolicy};

/// One planned trial. Persisted verbatim to `trial_plan.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanEntry {
    pub trial_id: u32,
    pub protocol: ProtocolType,
    pub assigned_config: AssignedConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_assignments: Option<BTreeMap<String, RoleAssignment>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignedConfig {
    pub model_slug: String,
    pub persona_id: String,
    pub protocol_prompt_id: String,
    pub decode: BTreeMap<String, f64>,
}

/// Per-slot assignment for multi-participant protocols. Slot "A" is the
/// proposer and final answerer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleAssignment {
    pub model_slug: String,
    pub persona_id: String,
    pub decode: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Success,
    Error,
    ModelUnavailable,
    TimeoutExhausted,
    ShutdownAbort,
}

impl TrialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::Success => "success",
            TrialStatus::Error => "error",
            TrialStatus::ModelUnavailable => "model_unavailable",
            TrialStatus::TimeoutExhausted => "timeout_exhausted",
            TrialStatus::ShutdownAbort => "shutdown_abort",
        }
    }
}

/// Immutable record of one executed trial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialRecord {
    pub trial_id: u32,
    pub requested_model_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_model: Option<String>,
    pub protocol: ProtocolType,
    pub status: TrialStatus,
    pub assigned_config: AssignedConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_assignments: Option<BTreeMap<String, RoleAssignment>>,
    pub calls: Vec<CallRecord>,
    pub transcript: Vec<TranscriptTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_assistant_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageTotals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub embedding_summary: EmbeddingSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRecord {
    pub turn: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    pub purpose: CallPurpose,
    pub model_slug: String,
    pub ok: bool,
    pub latency_ms: u64,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageTotals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    Single,
    DebateTurn,
    Final,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptTurn {
    pub turn: u32,
    pub round: u32,
    pub slot: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl UsageTotals {
    pub fn add(&mut self, other: &UsageTotals) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        match (self.cost, other.cost) {
            (Some(a), Some(b)) => self.cost = Some(a + b),
            (None, Some(b)) => self.cost = Some(b),
            _ => {}
        }
    }

    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0
            && self.completion_tokens == 0
            && self.total_tokens == 0
            && self.cost.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingSummary {
    pub status: EmbeddingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    Success,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    TrialNotSuccess,
    EmptyEmbedText,
    ContractParseExcluded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Success,
    Fallback,
    Failed,
}

/// Parsed view of one trial's final assistant text. Exactly one per emitted
/// `TrialRecord`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedOutput {
    pub trial_id: u32,
    pub parse_status: ParseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_assistant_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub parser_version: String,
}

/// One embedding outcome per emitted trial. `vector_b64` is the base64 of the
/// little-endian float32 bytes, present iff `embedding_status` is success.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingRecord {
    pub trial_id: u32,
    pub embedding_status: EmbeddingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_b64: Option<String>,
    pub dtype: String,
    pub encoding: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
    pub embed_text_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EmbeddingRecord {
    pub const DTYPE: &'static str = "float32";
    pub const ENCODING: &'static str = "float32le_base64";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterAssignment {
    pub trial_id: u32,
    pub cluster_id: usize,
    pub batch_number: u32,
    pub forced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringRecord {
    pub batch_number: u32,
    pub k_attempted: u64,
    pub k_eligible: u64,
    pub has_eligible_in_batch: bool,
    pub novelty_rate: Option<f64>,
    pub mean_max_sim_to_prior: Option<f64>,
    pub recorded_at: DateTime<Utc>,
    pub stop: StopBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_metrics: Option<ClusterMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopBlock {
    pub mode: StopMode,
    pub would_stop: bool,
    pub should_stop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterMetrics {
    pub cluster_count: usize,
    pub new_clusters_this_batch: usize,
    pub largest_cluster_share: f64,
    pub cluster_distribution: Vec<u64>,
    pub entropy: f64,
    pub effective_cluster_count: f64,
    pub singleton_count: usize,
    pub js_divergence: Option<f64>,
    pub cluster_limit_hit: bool,
    pub forced_assignments_this_batch: u64,
    pub forced_assignments_cumulative: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClustersState {
    pub cluster_count: usize,
    pub member_counts: Vec<u64>,
    pub forced_cumulative: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
    pub updated_at: DateTime<Utc>,
}

/// Final run-level metrics; mirrors the shared fields of the last
/// `MonitoringRecord`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Aggregates {
    pub batches: u32,
    pub k_attempted: u64,
    pub k_eligible: u64,
    pub novelty_rate: Option<f64>,
    pub mean_max_sim_to_prior: Option<f64>,
    pub stop: StopBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_metrics: Option<ClusterMetrics>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    KMaxReached,
    Converged,
    UserInterrupt,
    Error,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::KMaxReached => "k_max_reached",
            StopReason::Converged => "converged",
            StopReason::UserInterrupt => "user_interrupt",
            StopReason::Error => "error",
        }
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, StopReason::UserInterrupt | StopReason::Error)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceStatus {
    ArrowGenerated,
    JsonlFallback,
    NotGenerated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingsProvenance {
    pub status: ProvenanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub finalized_at: DateTime<Utc>,
}

/// Snapshot of the stop policy recorded in the manifest for auditability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopSnapshot {
    pub stop_mode: StopMode,
    pub stop_policy: StopPolicy,
    pub novelty_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub schema_version: String,
    pub arbiter_version: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub plan_sha256: String,
    pub config_sha256: String,
    pub hash_algorithm: String,
    pub k_planned: u32,
    pub k_attempted: u64,
    pub k_eligible: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub incomplete: bool,
    pub stop: StopSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_catalog_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_catalog_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_manifest_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSummary>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl Manifest {
    pub const SCHEMA_VERSION: &'static str = "1.0.0";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageSummary {
    pub totals: UsageTotals,
    #[serde(default)]
    pub per_model: BTreeMap<String, UsageTotals>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trial_status_wire_names() {
        assert_eq!(
            serde_json::to_value(TrialStatus::TimeoutExhausted).unwrap(),
            serde_json::json!("timeout_exhausted")
        );
        assert_eq!(
            serde_json::to_value(SkipReason::ContractParseExcluded).unwrap(),
            serde_json::json!("contract_parse_excluded")
        );
        assert_eq!(
            serde_json::to_value(StopReason::KMaxReached).unwrap(),
            serde_json::json!("k_max_reached")
        );
    }

    #[test]
    fn stop_reason_incompleteness() {
        assert!(StopReason::UserInterrupt.is_incomplete());
        assert!(StopReason::Error.is_incomplete());
        assert!(!StopReason::Converged.is_incomplete());
        assert!(!StopReason::KMaxReached.is_incomplete());
        assert!(!StopReason::Completed.is_incomplete());
    }

    #[test]
    fn usage_totals_accumulate() {
        let mut total = UsageTotals::default();
        assert!(total.is_zero());
        total.add(&UsageTotals {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            cost: Some(0.002),
        });
        total.add(&UsageTotals {
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
            cost: None,
        });
        assert_eq!(total.total_tokens, 17);
        assert_eq!(total.cost, Some(0.002));
        assert!(!total.is_zero());
    }

    #[test]
    fn optional_fields_are_omitted_from_wire_records() {
        let record = EmbeddingRecord {
            trial_id: 3,
            embedding_status: EmbeddingStatus::Skipped,
            skip_reason: Some(SkipReason::EmptyEmbedText),
            vector_b64: None,
            dtype: EmbeddingRecord::DTYPE.to_string(),
            encoding: EmbeddingRecord::ENCODING.to_string(),
            dimensions: None,
            embed_text_sha256: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
                .to_string(),
            error: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("vector_b64").is_none());
        assert!(value.get("dimensions").is_none());
        assert_eq!(value["skip_reason"], "empty_embed_text");
    }
}

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Fully-resolved run configuration. Produced by the CLI layer, treated as
/// immutable by the core for the lifetime of the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedConfig {
    pub run: RunSection,
    pub question: QuestionSection,
    pub sampling: SamplingSection,
    pub protocol: ProtocolSection,
    pub execution: ExecutionSection,
    pub measurement: MeasurementSection,
    pub output: OutputSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSection {
    pub seed: SeedValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SeedValue {
    Int(i64),
    Text(String),
}

impl SeedValue {
    /// Stable textual form used to derive the per-trial random streams.
    pub fn stream_key(&self) -> String {
        match self {
            SeedValue::Int(n) => n.to_string(),
            SeedValue::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionSection {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingSection {
    pub models: Vec<WeightedModel>,
    pub personas: Vec<WeightedPersona>,
    pub protocols: Vec<WeightedPrompt>,
    #[serde(default)]
    pub decode: BTreeMap<String, DecodeSetting>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightedModel {
    pub slug: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightedPersona {
    pub id: String,
    pub weight: f64,
    /// System-prompt text for the persona. Falls back to a neutral prompt
    /// derived from the id when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightedPrompt {
    pub id: String,
    pub weight: f64,
}

/// Decode parameter: fixed scalar or a uniform range sampled per trial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DecodeSetting {
    Scalar(f64),
    Range { min: f64, max: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolSection {
    #[serde(rename = "type")]
    pub protocol_type: ProtocolType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ProtocolPrompts>,
    pub timeouts: TimeoutsSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_contract: Option<DecisionContract>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolType {
    Independent,
    DebateV1,
}

impl ProtocolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Independent => "independent",
            ProtocolType::DebateV1 => "debate_v1",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProtocolPrompts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposer_system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critic_system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposer_final_system: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutsSection {
    pub total_trial_ms: u64,
    pub per_call_ms: u64,
    #[serde(default)]
    pub per_call_max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionContract {
    #[serde(default)]
    pub policy: ContractPolicy,
    /// Exact clause appended to the final system prompt; content-hashed into
    /// the prompt manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clause: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContractPolicy {
    #[default]
    Warn,
    Exclude,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSection {
    pub k_max: u32,
    #[serde(default)]
    pub k_min: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k_min_count_rule: Option<String>,
    pub batch_size: u32,
    pub workers: u32,
    pub stop_mode: StopMode,
    pub stop_policy: StopPolicy,
    pub retry_policy: RetryPolicy,
    #[serde(default = "default_grace_window_ms")]
    pub grace_window_ms: u64,
}

fn default_grace_window_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    Advisor,
    Enforcer,
    Disabled,
    ResolveOnly,
}

impl StopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopMode::Advisor => "advisor",
            StopMode::Enforcer => "enforcer",
            StopMode::Disabled => "disabled",
            StopMode::ResolveOnly => "resolve_only",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopPolicy {
    pub novelty_epsilon: f64,
    pub similarity_threshold: f64,
    pub patience: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementSection {
    pub embedding_model: String,
    pub embed_text_strategy: EmbedTextStrategy,
    pub embedding_max_chars: usize,
    pub novelty_threshold: f64,
    pub clustering: ClusteringSection,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbedTextStrategy {
    OutcomeOnly,
    FullText,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusteringSection {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_mode: Option<StopMode>,
    pub tau: f64,
    pub centroid_update_rule: CentroidUpdateRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CentroidUpdateRule {
    RunningMean,
    Ema { alpha: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputSection {
    pub runs_dir: PathBuf,
    #[serde(default)]
    pub debug_enabled: bool,
    #[serde(default = "default_validate_artifacts")]
    pub validate_artifacts: bool,
}

fn default_validate_artifacts() -> bool {
    true
}

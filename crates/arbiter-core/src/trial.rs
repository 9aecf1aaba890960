use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbiter_backend::{
    Backend, BackendFailure, CallOptions, CallSuccess, ChatMessage, ChatRequest, EmbedRequest,
    FailureCode,
};
use arbiter_types::{
    encode_vector_f32le, CallPurpose, CallRecord, ContractPolicy, EmbedTextStrategy,
    EmbeddingRecord, EmbeddingStatus, EmbeddingSummary, ParseStatus, ParsedOutput, PlanEntry,
    ProtocolType, ResolvedConfig, RetryPolicy, RoleAssignment, SkipReason, TranscriptTurn,
    TrialRecord, TrialStatus, UsageTotals,
};

use crate::canonical::sha256_hex;
use crate::parser::{parse_assistant_text, prepare_embed_text, ParseResult, PARSER_VERSION};
use crate::protocol::{
    compose_system, contract_clause, persona_prompt, transcript_block, PromptSet,
};
use crate::shutdown::ShutdownSignal;

/// Everything one trial produces, emitted by the batch executor as
/// `trial.completed`, `parsed.output`, `embedding.recorded` in that order.
#[derive(Debug, Clone)]
pub struct TrialArtifacts {
    pub record: TrialRecord,
    pub parsed: ParsedOutput,
    pub embedding: EmbeddingRecord,
}

enum CallFailure {
    Timeout,
    Shutdown,
    Backend(BackendFailure),
}

struct TrialState {
    turn: u32,
    calls: Vec<CallRecord>,
    transcript: Vec<TranscriptTurn>,
    usage: UsageTotals,
    actual_model: Option<String>,
}

impl TrialState {
    fn new() -> Self {
        Self {
            turn: 0,
            calls: Vec::new(),
            transcript: Vec::new(),
            usage: UsageTotals::default(),
            actual_model: None,
        }
    }

    fn record_success(
        &mut self,
        purpose: CallPurpose,
        round: Option<u32>,
        slot: Option<&str>,
        model: &str,
        success: &CallSuccess,
    ) {
        self.turn += 1;
        if let Some(usage) = &success.usage {
            self.usage.add(usage);
        }
        if self.actual_model.is_none() {
            self.actual_model = success.actual_model.clone();
        }
        self.calls.push(CallRecord {
            turn: self.turn,
            round,
            slot: slot.map(|s| s.to_string()),
            purpose,
            model_slug: model.to_string(),
            ok: true,
            latency_ms: success.latency_ms,
            retry_count: success.retry_count,
            usage: success.usage.clone(),
            error: None,
        });
    }

    fn record_failure(
        &mut self,
        purpose: CallPurpose,
        round: Option<u32>,
        slot: Option<&str>,
        model: &str,
        failure: &CallFailure,
    ) {
        self.turn += 1;
        let (retry_count, latency_ms, error) = match failure {
            CallFailure::Timeout => (0, 0, "per-call or trial deadline exceeded".to_string()),
            CallFailure::Shutdown => (0, 0, "aborted by shutdown signal".to_string()),
            CallFailure::Backend(f) => (f.retry_count, f.latency_ms.unwrap_or(0), f.to_string()),
        };
        self.calls.push(CallRecord {
            turn: self.turn,
            round,
            slot: slot.map(|s| s.to_string()),
            purpose,
            model_slug: model.to_string(),
            ok: false,
            latency_ms,
            retry_count,
            usage: None,
            error: Some(error),
        });
    }
}

/// Drive one plan entry through its protocol state machine, parse the result,
/// and resolve its embedding. Never fails: every outcome is a record.
pub async fn execute_trial(
    entry: PlanEntry,
    config: Arc<ResolvedConfig>,
    backend: Arc<dyn Backend>,
    shutdown: ShutdownSignal,
) -> TrialArtifacts {
    let deadline = Instant::now() + Duration::from_millis(config.protocol.timeouts.total_trial_ms);
    let prompts = PromptSet::from_config(config.protocol.prompts.as_ref());
    let mut state = TrialState::new();

    let outcome = match entry.protocol {
        ProtocolType::Independent => {
            run_independent(&entry, &config, &prompts, backend.as_ref(), &shutdown, deadline, &mut state)
                .await
        }
        ProtocolType::DebateV1 => {
            run_debate(&entry, &config, &prompts, backend.as_ref(), &shutdown, deadline, &mut state)
                .await
        }
    };

    let (status, raw_assistant_text, error) = match outcome {
        Ok(raw) => (TrialStatus::Success, Some(raw), None),
        Err((status, message)) => (status, None, Some(message)),
    };

    conclude(
        entry,
        config,
        backend,
        shutdown,
        state,
        status,
        raw_assistant_text,
        error,
    )
    .await
}

async fn run_independent(
    entry: &PlanEntry,
    config: &ResolvedConfig,
    prompts: &PromptSet,
    backend: &dyn Backend,
    shutdown: &ShutdownSignal,
    deadline: Instant,
    state: &mut TrialState,
) -> Result<String, (TrialStatus, String)> {
    let persona = persona_prompt(config, &entry.assigned_config.persona_id);
    let mut system = compose_system(&persona, &prompts.system);
    if let Some(contract) = &config.protocol.decision_contract {
        system.push_str("\n\n");
        system.push_str(contract_clause(contract));
    }
    let messages = vec![
        ChatMessage::system(system),
        ChatMessage::user(config.question.text.clone()),
    ];

    let model = entry.assigned_config.model_slug.clone();
    match run_call(
        backend,
        config,
        shutdown,
        deadline,
        &model,
        messages,
        &entry.assigned_config.decode,
    )
    .await
    {
        Ok(success) => {
            state.record_success(CallPurpose::Single, None, None, &model, &success);
            finish_with_content(success.content, state.turn)
        }
        Err(failure) => {
            state.record_failure(CallPurpose::Single, None, None, &model, &failure);
            Err(classify_failure(failure, state.turn))
        }
    }
}

async fn run_debate(
    entry: &PlanEntry,
    config: &ResolvedConfig,
    prompts: &PromptSet,
    backend: &dyn Backend,
    shutdown: &ShutdownSignal,
    deadline: Instant,
    state: &mut TrialState,
) -> Result<String, (TrialStatus, String)> {
    // Slot A first, remaining slots in lexicographic order; the BTreeMap
    // keeps that invariant for us.
    let slots: Vec<(String, RoleAssignment)> = entry
        .role_assignments
        .clone()
        .unwrap_or_else(|| {
            BTreeMap::from([(
                "A".to_string(),
                RoleAssignment {
                    model_slug: entry.assigned_config.model_slug.clone(),
                    persona_id: entry.assigned_config.persona_id.clone(),
                    decode: entry.assigned_config.decode.clone(),
                },
            )])
        })
        .into_iter()
        .collect();
    let rounds = config.protocol.rounds.unwrap_or(1);

    for round in 1..=rounds {
        for (slot, role) in &slots {
            let role_system = if slot == "A" {
                &prompts.proposer_system
            } else {
                &prompts.critic_system
            };
            let persona = persona_prompt(config, &role.persona_id);
            let system = compose_system(&persona, role_system);
            let messages = vec![
                ChatMessage::system(system),
                ChatMessage::user(debate_user_content(config, &state.transcript)),
            ];

            match run_call(
                backend,
                config,
                shutdown,
                deadline,
                &role.model_slug,
                messages,
                &role.decode,
            )
            .await
            {
                Ok(success) => {
                    state.record_success(
                        CallPurpose::DebateTurn,
                        Some(round),
                        Some(slot),
                        &role.model_slug,
                        &success,
                    );
                    state.transcript.push(TranscriptTurn {
                        turn: state.turn,
                        round,
                        slot: slot.clone(),
                        content: success.content,
                    });
                }
                Err(failure) => {
                    state.record_failure(
                        CallPurpose::DebateTurn,
                        Some(round),
                        Some(slot),
                        &role.model_slug,
                        &failure,
                    );
                    return Err(classify_failure(failure, state.turn));
                }
            }
        }
    }

    // Final answer comes from slot A with the closing prompt.
    let (slot, role) = &slots[0];
    let persona = persona_prompt(config, &role.persona_id);
    let mut system = compose_system(&persona, &prompts.proposer_final_system);
    if let Some(contract) = &config.protocol.decision_contract {
        system.push_str("\n\n");
        system.push_str(contract_clause(contract));
    }
    let messages = vec![
        ChatMessage::system(system),
        ChatMessage::user(debate_user_content(config, &state.transcript)),
    ];

    match run_call(
        backend,
        config,
        shutdown,
        deadline,
        &role.model_slug,
        messages,
        &role.decode,
    )
    .await
    {
        Ok(success) => {
            state.record_success(
                CallPurpose::Final,
                Some(rounds),
                Some(slot),
                &role.model_slug,
                &success,
            );
            finish_with_content(success.content, state.turn)
        }
        Err(failure) => {
            state.record_failure(
                CallPurpose::Final,
                Some(rounds),
                Some(slot),
                &role.model_slug,
                &failure,
            );
            Err(classify_failure(failure, state.turn))
        }
    }
}

fn debate_user_content(config: &ResolvedConfig, transcript: &[TranscriptTurn]) -> String {
    if transcript.is_empty() {
        config.question.text.clone()
    } else {
        format!(
            "{}\n\nDiscussion so far:\n{}",
            config.question.text,
            transcript_block(transcript)
        )
    }
}

fn finish_with_content(content: String, turn: u32) -> Result<String, (TrialStatus, String)> {
    if content.is_empty() {
        Err((
            TrialStatus::Error,
            format!("call at turn {turn} produced empty content"),
        ))
    } else {
        Ok(content)
    }
}

fn classify_failure(failure: CallFailure, turn: u32) -> (TrialStatus, String) {
    match failure {
        CallFailure::Timeout => (
            TrialStatus::TimeoutExhausted,
            format!("trial time budget exhausted at turn {turn}"),
        ),
        CallFailure::Shutdown => (
            TrialStatus::ShutdownAbort,
            format!("shutdown requested while turn {turn} was inflight"),
        ),
        CallFailure::Backend(f) if f.model_unavailable => (TrialStatus::ModelUnavailable, f.to_string()),
        CallFailure::Backend(f) => (TrialStatus::Error, f.to_string()),
    }
}

/// Per-call retry policy: the execution-level policy, capped by the
/// protocol's per-call retry limit when one is set.
fn effective_retry(config: &ResolvedConfig) -> RetryPolicy {
    let base = config.execution.retry_policy.clone();
    let cap = config.protocol.timeouts.per_call_max_retries;
    RetryPolicy {
        max_retries: if cap > 0 {
            base.max_retries.min(cap)
        } else {
            base.max_retries
        },
        backoff_ms: base.backoff_ms,
    }
}

/// One backend chat call under the composed deadline: the per-call timeout,
/// the remaining trial budget, and the shutdown signal all race the call.
async fn run_call(
    backend: &dyn Backend,
    config: &ResolvedConfig,
    shutdown: &ShutdownSignal,
    deadline: Instant,
    model: &str,
    messages: Vec<ChatMessage>,
    decode: &BTreeMap<String, f64>,
) -> Result<CallSuccess, CallFailure> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(CallFailure::Timeout);
    }
    let per_call = Duration::from_millis(config.protocol.timeouts.per_call_ms).min(remaining);

    let request = ChatRequest {
        model: model.to_string(),
        messages,
        params: decode.clone(),
        options: CallOptions {
            retry: effective_retry(config),
            signal: shutdown.call_token(),
        },
    };

    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(CallFailure::Shutdown),
        result = backend.chat(request) => result.map_err(|failure| {
            if failure.code == FailureCode::Cancelled {
                CallFailure::Shutdown
            } else {
                CallFailure::Backend(failure)
            }
        }),
        _ = tokio::time::sleep(per_call) => Err(CallFailure::Timeout),
    }
}

#[allow(clippy::too_many_arguments)]
async fn conclude(
    entry: PlanEntry,
    config: Arc<ResolvedConfig>,
    backend: Arc<dyn Backend>,
    shutdown: ShutdownSignal,
    state: TrialState,
    status: TrialStatus,
    raw_assistant_text: Option<String>,
    error: Option<String>,
) -> TrialArtifacts {
    let contract = config.protocol.decision_contract.as_ref();

    let parse = match raw_assistant_text.as_deref() {
        Some(raw) if status == TrialStatus::Success => parse_assistant_text(raw, contract),
        _ => ParseResult::failed(),
    };

    let embed_source = match config.measurement.embed_text_strategy {
        EmbedTextStrategy::OutcomeOnly => parse.outcome.clone().unwrap_or_default(),
        EmbedTextStrategy::FullText => raw_assistant_text.clone().unwrap_or_default(),
    };
    let prepared = prepare_embed_text(&embed_source, config.measurement.embedding_max_chars);
    let embed_text_sha256 = sha256_hex(prepared.text.as_bytes());

    let contract_excluded = contract.is_some()
        && status == TrialStatus::Success
        && parse.status != ParseStatus::Success
        && contract.map(|c| c.policy) == Some(ContractPolicy::Exclude);

    let skip_reason = if status != TrialStatus::Success {
        Some(SkipReason::TrialNotSuccess)
    } else if contract_excluded {
        Some(SkipReason::ContractParseExcluded)
    } else if prepared.was_empty {
        Some(SkipReason::EmptyEmbedText)
    } else {
        None
    };

    let (embedding, generation_id) = match skip_reason {
        Some(reason) => (
            EmbeddingRecord {
                trial_id: entry.trial_id,
                embedding_status: EmbeddingStatus::Skipped,
                skip_reason: Some(reason),
                vector_b64: None,
                dtype: EmbeddingRecord::DTYPE.to_string(),
                encoding: EmbeddingRecord::ENCODING.to_string(),
                dimensions: None,
                embed_text_sha256: embed_text_sha256.clone(),
                error: None,
            },
            None,
        ),
        None => {
            embed_vector(
                &entry,
                &config,
                backend.as_ref(),
                &shutdown,
                &prepared.text,
                &embed_text_sha256,
            )
            .await
        }
    };

    let parsed = ParsedOutput {
        trial_id: entry.trial_id,
        parse_status: parse.status,
        outcome: parse.outcome,
        rationale: parse.rationale,
        raw_assistant_text: raw_assistant_text.clone(),
        embed_text: raw_assistant_text.as_ref().map(|_| prepared.text.clone()),
        extraction_method: parse.extraction_method,
        confidence: parse.confidence,
        parser_version: PARSER_VERSION.to_string(),
    };

    let record = TrialRecord {
        trial_id: entry.trial_id,
        requested_model_slug: entry.assigned_config.model_slug.clone(),
        actual_model: state.actual_model,
        protocol: entry.protocol,
        status,
        assigned_config: entry.assigned_config,
        role_assignments: entry.role_assignments,
        calls: state.calls,
        transcript: state.transcript,
        raw_assistant_text,
        usage: (!state.usage.is_zero()).then_some(state.usage),
        error,
        embedding_summary: EmbeddingSummary {
            status: embedding.embedding_status,
            skip_reason: embedding.skip_reason,
            generation_id,
        },
    };

    TrialArtifacts {
        record,
        parsed,
        embedding,
    }
}

async fn embed_vector(
    entry: &PlanEntry,
    config: &ResolvedConfig,
    backend: &dyn Backend,
    shutdown: &ShutdownSignal,
    text: &str,
    embed_text_sha256: &str,
) -> (EmbeddingRecord, Option<String>) {
    let request = EmbedRequest {
        model: config.measurement.embedding_model.clone(),
        text: text.to_string(),
        options: CallOptions {
            retry: effective_retry(config),
            signal: shutdown.call_token(),
        },
    };
    let per_call = Duration::from_millis(config.protocol.timeouts.per_call_ms);

    let result = tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(BackendFailure::cancelled()),
        result = backend.embed(request) => result,
        _ = tokio::time::sleep(per_call) => Err(BackendFailure::new(
            FailureCode::Timeout,
            "embedding call timed out",
            false,
        )),
    };

    match result {
        Ok(success) => {
            let record = EmbeddingRecord {
                trial_id: entry.trial_id,
                embedding_status: EmbeddingStatus::Success,
                skip_reason: None,
                vector_b64: Some(encode_vector_f32le(&success.vector)),
                dtype: EmbeddingRecord::DTYPE.to_string(),
                encoding: EmbeddingRecord::ENCODING.to_string(),
                dimensions: Some(success.vector.len()),
                embed_text_sha256: embed_text_sha256.to_string(),
                error: None,
            };
            (record, success.generation_id)
        }
        Err(failure) => {
            let record = EmbeddingRecord {
                trial_id: entry.trial_id,
                embedding_status: EmbeddingStatus::Failed,
                skip_reason: None,
                vector_b64: None,
                dtype: EmbeddingRecord::DTYPE.to_string(),
                encoding: EmbeddingRecord::ENCODING.to_string(),
                dimensions: None,
                embed_text_sha256: embed_text_sha256.to_string(),
                error: Some(failure.to_string()),
            };
            (record, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_backend::MockBackend;
    use arbiter_types::{
        CentroidUpdateRule, ClusteringSection, DecisionContract, ExecutionSection,
        MeasurementSection, OutputSection, ProtocolSection, QuestionSection, RunSection,
        SamplingSection, SeedValue, StopMode, StopPolicy, TimeoutsSection, WeightedModel,
        WeightedPersona, WeightedPrompt,
    };

    fn test_config() -> ResolvedConfig {
        ResolvedConfig {
            run: RunSection {
                seed: SeedValue::Int(1),
            },
            question: QuestionSection {
                text: "Which opening should White play?".to_string(),
            },
            sampling: SamplingSection {
                models: vec![WeightedModel {
                    slug: "mock/model".to_string(),
                    weight: 1.0,
                }],
                personas: vec![WeightedPersona {
                    id: "baseline".to_string(),
                    weight: 1.0,
                    prompt: Some("You are a pragmatic analyst.".to_string()),
                }],
                protocols: vec![WeightedPrompt {
                    id: "default".to_string(),
                    weight: 1.0,
                }],
                decode: BTreeMap::new(),
            },
            protocol: ProtocolSection {
                protocol_type: ProtocolType::Independent,
                participants: None,
                rounds: None,
                prompts: None,
                timeouts: TimeoutsSection {
                    total_trial_ms: 5_000,
                    per_call_ms: 2_000,
                    per_call_max_retries: 0,
                },
                decision_contract: None,
            },
            execution: ExecutionSection {
                k_max: 1,
                k_min: 0,
                k_min_count_rule: None,
                batch_size: 1,
                workers: 1,
                stop_mode: StopMode::Disabled,
                stop_policy: StopPolicy {
                    novelty_epsilon: 0.0,
                    similarity_threshold: 1.0,
                    patience: 1,
                },
                retry_policy: arbiter_types::RetryPolicy {
                    max_retries: 0,
                    backoff_ms: 0,
                },
                grace_window_ms: 1_000,
            },
            measurement: MeasurementSection {
                embedding_model: "mock-embed".to_string(),
                embed_text_strategy: EmbedTextStrategy::OutcomeOnly,
                embedding_max_chars: 500,
                novelty_threshold: 0.85,
                clustering: ClusteringSection {
                    enabled: false,
                    stop_mode: None,
                    tau: 0.9,
                    centroid_update_rule: CentroidUpdateRule::RunningMean,
                    cluster_limit: None,
                },
            },
            output: OutputSection {
                runs_dir: "runs".into(),
                debug_enabled: false,
                validate_artifacts: true,
            },
        }
    }

    fn entry(trial_id: u32) -> PlanEntry {
        PlanEntry {
            trial_id,
            protocol: ProtocolType::Independent,
            assigned_config: arbiter_types::AssignedConfig {
                model_slug: "mock/model".to_string(),
                persona_id: "baseline".to_string(),
                protocol_prompt_id: "default".to_string(),
                decode: BTreeMap::new(),
            },
            role_assignments: None,
        }
    }

    #[tokio::test]
    async fn independent_trial_succeeds_end_to_end() {
        let artifacts = execute_trial(
            entry(0),
            Arc::new(test_config()),
            Arc::new(MockBackend::new()),
            ShutdownSignal::new(),
        )
        .await;

        assert_eq!(artifacts.record.status, TrialStatus::Success);
        assert_eq!(artifacts.record.calls.len(), 1);
        assert!(artifacts.record.calls[0].ok);
        assert_eq!(artifacts.parsed.parse_status, ParseStatus::Success);
        assert_eq!(artifacts.embedding.embedding_status, EmbeddingStatus::Success);
        let dims = artifacts.embedding.dimensions.unwrap();
        let decoded =
            arbiter_types::decode_vector_checked(artifacts.embedding.vector_b64.as_ref().unwrap(), dims)
                .unwrap();
        assert_eq!(decoded.len(), dims);
    }

    #[tokio::test]
    async fn unavailable_model_is_classified() {
        let backend = MockBackend::new().with_unavailable_model("mock/model");
        let artifacts = execute_trial(
            entry(0),
            Arc::new(test_config()),
            Arc::new(backend),
            ShutdownSignal::new(),
        )
        .await;
        assert_eq!(artifacts.record.status, TrialStatus::ModelUnavailable);
        assert_eq!(artifacts.parsed.parse_status, ParseStatus::Failed);
        assert_eq!(
            artifacts.embedding.skip_reason,
            Some(SkipReason::TrialNotSuccess)
        );
    }

    #[tokio::test]
    async fn shutdown_before_start_aborts_the_trial() {
        let shutdown = ShutdownSignal::new();
        shutdown.request_user_interrupt();
        let artifacts = execute_trial(
            entry(0),
            Arc::new(test_config()),
            Arc::new(MockBackend::new()),
            shutdown,
        )
        .await;
        assert_eq!(artifacts.record.status, TrialStatus::ShutdownAbort);
    }

    #[tokio::test]
    async fn whitespace_reply_skips_embedding_as_empty() {
        let backend = MockBackend::new().with_fixed_reply("   ");
        let artifacts = execute_trial(
            entry(0),
            Arc::new(test_config()),
            Arc::new(backend),
            ShutdownSignal::new(),
        )
        .await;
        assert_eq!(artifacts.record.status, TrialStatus::Success);
        assert_eq!(
            artifacts.embedding.skip_reason,
            Some(SkipReason::EmptyEmbedText)
        );
        assert_eq!(artifacts.embedding.embedding_status, EmbeddingStatus::Skipped);
    }

    #[tokio::test]
    async fn contract_exclude_policy_skips_fallback_parses() {
        let mut config = test_config();
        config.protocol.decision_contract = Some(DecisionContract {
            policy: arbiter_types::ContractPolicy::Exclude,
            clause: None,
        });
        // Reply is plain prose, so the contract parse falls back.
        let backend = MockBackend::new().with_fixed_reply("I would answer e4.");
        let artifacts = execute_trial(
            entry(0),
            Arc::new(config),
            Arc::new(backend),
            ShutdownSignal::new(),
        )
        .await;
        assert_eq!(artifacts.record.status, TrialStatus::Success);
        assert_eq!(artifacts.parsed.parse_status, ParseStatus::Fallback);
        assert_eq!(
            artifacts.embedding.skip_reason,
            Some(SkipReason::ContractParseExcluded)
        );
    }

    #[tokio::test]
    async fn contract_prompt_reaches_the_model() {
        let mut config = test_config();
        config.protocol.decision_contract = Some(DecisionContract {
            policy: arbiter_types::ContractPolicy::Warn,
            clause: None,
        });
        // The mock answers contract prompts with a JSON object.
        let artifacts = execute_trial(
            entry(0),
            Arc::new(config),
            Arc::new(MockBackend::new()),
            ShutdownSignal::new(),
        )
        .await;
        assert_eq!(artifacts.parsed.parse_status, ParseStatus::Success);
        assert_eq!(
            artifacts.parsed.extraction_method.as_deref(),
            Some("json_direct")
        );
        assert!(artifacts.parsed.confidence.is_some());
    }

    #[tokio::test]
    async fn embed_failure_is_recorded_not_fatal() {
        let backend = MockBackend::new().with_embed_failure("embedding backend down");
        let artifacts = execute_trial(
            entry(0),
            Arc::new(test_config()),
            Arc::new(backend),
            ShutdownSignal::new(),
        )
        .await;
        assert_eq!(artifacts.record.status, TrialStatus::Success);
        assert_eq!(artifacts.embedding.embedding_status, EmbeddingStatus::Failed);
        assert!(artifacts
            .embedding
            .error
            .as_deref()
            .unwrap()
            .contains("embedding backend down"));
    }

    #[tokio::test]
    async fn debate_builds_transcript_and_final_answer() {
        let mut config = test_config();
        config.protocol.protocol_type = ProtocolType::DebateV1;
        config.protocol.participants = Some(2);
        config.protocol.rounds = Some(2);
        let mut entry = entry(0);
        entry.protocol = ProtocolType::DebateV1;
        entry.role_assignments = Some(BTreeMap::from([
            (
                "A".to_string(),
                RoleAssignment {
                    model_slug: "mock/model".to_string(),
                    persona_id: "baseline".to_string(),
                    decode: BTreeMap::new(),
                },
            ),
            (
                "B".to_string(),
                RoleAssignment {
                    model_slug: "mock/model".to_string(),
                    persona_id: "baseline".to_string(),
                    decode: BTreeMap::new(),
                },
            ),
        ]));

        let artifacts = execute_trial(
            entry,
            Arc::new(config),
            Arc::new(MockBackend::new()),
            ShutdownSignal::new(),
        )
        .await;

        assert_eq!(artifacts.record.status, TrialStatus::Success);
        // 2 rounds x 2 slots plus the final call.
        assert_eq!(artifacts.record.calls.len(), 5);
        assert_eq!(artifacts.record.transcript.len(), 4);
        assert_eq!(
            artifacts.record.calls.last().unwrap().purpose,
            CallPurpose::Final
        );
        assert_eq!(artifacts.record.transcript[0].slot, "A");
        assert_eq!(artifacts.record.transcript[1].slot, "B");
        assert!(artifacts.record.raw_assistant_text.is_some());
    }
}

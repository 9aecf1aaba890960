use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use arbiter_backend::{
    Backend, BackendFailure, CallSuccess, ChatRequest, EmbedRequest, EmbedSuccess, MockBackend,
};
use arbiter_core::{RunOrchestrator, RunOutcome, ShutdownSignal};
use arbiter_schemas::{validate, SchemaKind};
use arbiter_types::{
    CentroidUpdateRule, ClusteringSection, ContractPolicy, DecisionContract, DecodeSetting,
    EmbedTextStrategy, ExecutionSection, MeasurementSection, OutputSection, ProtocolSection,
    ProtocolType, QuestionSection, ResolvedConfig, RetryPolicy, RunSection, SamplingSection,
    SeedValue, StopMode, StopPolicy, StopReason, TimeoutsSection, WeightedModel, WeightedPersona,
    WeightedPrompt,
};

fn base_config(runs_dir: PathBuf, k_max: u32, batch_size: u32, workers: u32) -> ResolvedConfig {
    ResolvedConfig {
        run: RunSection {
            seed: SeedValue::Int(42),
        },
        question: QuestionSection {
            text: "What is the best first move in chess?".to_string(),
        },
        sampling: SamplingSection {
            models: vec![
                WeightedModel {
                    slug: "alpha/answerer".to_string(),
                    weight: 2.0,
                },
                WeightedModel {
                    slug: "beta/answerer".to_string(),
                    weight: 1.0,
                },
            ],
            personas: vec![
                WeightedPersona {
                    id: "direct".to_string(),
                    weight: 1.0,
                    prompt: Some("You answer directly.".to_string()),
                },
                WeightedPersona {
                    id: "cautious".to_string(),
                    weight: 1.0,
                    prompt: Some("You hedge carefully.".to_string()),
                },
            ],
            protocols: vec![WeightedPrompt {
                id: "default".to_string(),
                weight: 1.0,
            }],
            decode: BTreeMap::from([(
                "temperature".to_string(),
                DecodeSetting::Range { min: 0.1, max: 0.9 },
            )]),
        },
        protocol: ProtocolSection {
            protocol_type: ProtocolType::Independent,
            participants: None,
            rounds: None,
            prompts: None,
            timeouts: TimeoutsSection {
                total_trial_ms: 10_000,
                per_call_ms: 5_000,
                per_call_max_retries: 0,
            },
            decision_contract: None,
        },
        execution: ExecutionSection {
            k_max,
            k_min: 0,
            k_min_count_rule: None,
            batch_size,
            workers,
            stop_mode: StopMode::Advisor,
            stop_policy: StopPolicy {
                novelty_epsilon: 0.0,
                similarity_threshold: 0.999,
                patience: 2,
            },
            retry_policy: RetryPolicy {
                max_retries: 0,
                backoff_ms: 0,
            },
            grace_window_ms: 5_000,
        },
        measurement: MeasurementSection {
            embedding_model: "mock-embed".to_string(),
            embed_text_strategy: EmbedTextStrategy::OutcomeOnly,
            embedding_max_chars: 2_000,
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
            runs_dir,
            debug_enabled: false,
            validate_artifacts: true,
        },
    }
}

async fn run_with(config: ResolvedConfig, backend: Arc<dyn Backend>) -> RunOutcome {
    let shutdown = ShutdownSignal::new();
    RunOrchestrator::new(Arc::new(config), backend, shutdown)
        .execute()
        .await
        .expect("run should complete")
}

fn read_jsonl(path: &Path) -> Vec<Value> {
    let raw = std::fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("reading {}: {err}", path.display()));
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("valid JSONL line"))
        .collect()
}

fn read_json(path: &Path) -> Value {
    let raw = std::fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("reading {}: {err}", path.display()));
    serde_json::from_str(&raw).expect("valid JSON file")
}

#[tokio::test]
async fn mock_run_produces_a_coherent_run_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let config = base_config(tmp.path().to_path_buf(), 6, 3, 2);
    let outcome = run_with(config, Arc::new(MockBackend::new())).await;

    assert_eq!(outcome.stop_reason, StopReason::KMaxReached);
    assert!(!outcome.incomplete);
    let dir = outcome.run_dir;

    let plan = read_jsonl(&dir.join("trial_plan.jsonl"));
    assert_eq!(plan.len(), 6);
    for (row, entry) in plan.iter().enumerate() {
        assert_eq!(entry["trial_id"], row as u64);
    }

    let trials = read_jsonl(&dir.join("trials.jsonl"));
    assert_eq!(trials.len(), 6);
    assert!(trials.iter().all(|t| t["status"] == "success"));

    let parsed = read_jsonl(&dir.join("parsed.jsonl"));
    assert_eq!(parsed.len(), 6);
    assert!(parsed.iter().all(|p| p["parse_status"] == "success"));

    let mut trial_ids: Vec<u64> = trials.iter().map(|t| t["trial_id"].as_u64().unwrap()).collect();
    let mut parsed_ids: Vec<u64> = parsed.iter().map(|p| p["trial_id"].as_u64().unwrap()).collect();
    trial_ids.sort_unstable();
    parsed_ids.sort_unstable();
    assert_eq!(trial_ids, parsed_ids);
    assert_eq!(trial_ids, (0..6).collect::<Vec<u64>>());

    let trace = read_jsonl(&dir.join("convergence_trace.jsonl"));
    assert_eq!(trace.len(), 2);
    for (index, record) in trace.iter().enumerate() {
        assert_eq!(record["batch_number"], index as u64);
        validate(SchemaKind::MonitoringRecord, record).unwrap();
    }
    // First batch has no priors; second batch measures against them.
    assert!(trace[0]["novelty_rate"].is_null());
    let novelty = trace[1]["novelty_rate"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&novelty));
    let mean_sim = trace[1]["mean_max_sim_to_prior"].as_f64().unwrap();
    assert!((-1.0..=1.0).contains(&mean_sim));

    let manifest = read_json(&dir.join("manifest.json"));
    validate(SchemaKind::Manifest, &manifest).unwrap();
    assert_eq!(manifest["k_planned"], 6);
    assert_eq!(manifest["k_attempted"], 6);
    assert_eq!(manifest["k_eligible"], 6);
    assert_eq!(manifest["stop_reason"], "k_max_reached");
    assert_eq!(manifest["incomplete"], false);
    assert_eq!(manifest["hash_algorithm"], "sha256");
    assert!(manifest["usage"]["totals"]["total_tokens"].as_u64().unwrap() > 0);

    let provenance = read_json(&dir.join("embeddings.provenance.json"));
    assert_eq!(provenance["status"], "arrow_generated");
    assert_eq!(provenance["count"], 6);
    assert!(dir.join("embeddings.arrow").exists());
    // Debug JSONL is a working file unless debugging was requested.
    assert!(!dir.join("debug/embeddings.jsonl").exists());

    let aggregates = read_json(&dir.join("aggregates.json"));
    validate(SchemaKind::Aggregates, &aggregates).unwrap();
    assert_eq!(aggregates["k_attempted"], 6);
    assert_eq!(aggregates["k_eligible"], 6);
    assert_eq!(aggregates["batches"], 2);

    let config_file = read_json(&dir.join("config.resolved.json"));
    validate(SchemaKind::ResolvedConfig, &config_file).unwrap();
}

#[tokio::test]
async fn empty_embed_text_leaves_zero_eligible() {
    let tmp = tempfile::tempdir().unwrap();
    let config = base_config(tmp.path().to_path_buf(), 4, 2, 2);
    // Whitespace replies succeed as trials but normalize to empty embed text.
    let backend = MockBackend::new().with_fixed_reply("   ");
    let outcome = run_with(config, Arc::new(backend)).await;
    let dir = outcome.run_dir;

    let trials = read_jsonl(&dir.join("trials.jsonl"));
    assert_eq!(trials.len(), 4);
    assert!(trials.iter().all(|t| {
        t["embedding_summary"]["status"] == "skipped"
            && t["embedding_summary"]["skip_reason"] == "empty_embed_text"
    }));
    // Neither debugging nor a fallback keeps the working JSONL around.
    assert!(!dir.join("debug/embeddings.jsonl").exists());

    let manifest = read_json(&dir.join("manifest.json"));
    assert_eq!(manifest["k_attempted"], 4);
    assert_eq!(manifest["k_eligible"], 0);

    let provenance = read_json(&dir.join("embeddings.provenance.json"));
    assert_eq!(provenance["status"], "not_generated");
    assert_eq!(provenance["reason"], "no_successful_embeddings");
    assert!(!dir.join("embeddings.arrow").exists());

    let aggregates = read_json(&dir.join("aggregates.json"));
    assert!(aggregates["novelty_rate"].is_null());
    assert!(aggregates["mean_max_sim_to_prior"].is_null());
}

#[tokio::test]
async fn clustering_with_limit_forces_assignments() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = base_config(tmp.path().to_path_buf(), 12, 4, 2);
    config.measurement.clustering = ClusteringSection {
        enabled: true,
        stop_mode: None,
        tau: 0.9,
        centroid_update_rule: CentroidUpdateRule::RunningMean,
        cluster_limit: Some(3),
    };
    let outcome = run_with(config, Arc::new(MockBackend::new())).await;
    let dir = outcome.run_dir;

    let assignments = read_jsonl(&dir.join("clusters/online.assignments.jsonl"));
    assert_eq!(assignments.len(), 12);
    for assignment in &assignments {
        validate(SchemaKind::ClusterAssignment, assignment).unwrap();
        let cluster_id = assignment["cluster_id"].as_u64().unwrap();
        assert!(cluster_id < 3);
    }
    // Mock embeddings of distinct texts are effectively orthogonal, so once
    // three clusters exist every later vector is a forced assignment.
    assert!(assignments.iter().any(|a| a["forced"] == true));

    let trace = read_jsonl(&dir.join("convergence_trace.jsonl"));
    assert_eq!(trace.len(), 3);
    let last = trace.last().unwrap();
    let metrics = &last["cluster_metrics"];
    assert_eq!(metrics["cluster_limit_hit"], true);
    let cluster_count = metrics["cluster_count"].as_u64().unwrap();
    assert_eq!(
        metrics["cluster_distribution"].as_array().unwrap().len() as u64,
        cluster_count
    );
    let entropy = metrics["entropy"].as_f64().unwrap();
    assert!(entropy >= 0.0);
    let effective = metrics["effective_cluster_count"].as_f64().unwrap();
    assert!(effective >= 1.0 - 1e-9);
    assert!(effective <= cluster_count as f64 + 1e-9);
    assert!(metrics["forced_assignments_cumulative"].as_u64().unwrap() > 0);

    let state = read_json(&dir.join("clusters/online.state.json"));
    validate(SchemaKind::ClustersState, &state).unwrap();
    assert_eq!(state["cluster_count"].as_u64().unwrap(), cluster_count);
}

#[tokio::test]
async fn enforcer_mode_halts_on_convergence() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = base_config(tmp.path().to_path_buf(), 12, 2, 2);
    config.execution.k_min = 4;
    config.execution.stop_mode = StopMode::Enforcer;
    // Identical embeddings meet the policy as soon as priors exist.
    let backend = MockBackend::new().with_fixed_vector(vec![0.6, 0.8, 0.0, 0.0]);
    let outcome = run_with(config, Arc::new(backend)).await;

    assert_eq!(outcome.stop_reason, StopReason::Converged);
    assert!(!outcome.incomplete);
    let dir = outcome.run_dir;

    let trials = read_jsonl(&dir.join("trials.jsonl"));
    // Batches of 2: nulls at batch 0, met at batches 1 and 2, halt before 3.
    assert_eq!(trials.len(), 6);

    let trace = read_jsonl(&dir.join("convergence_trace.jsonl"));
    let last = trace.last().unwrap();
    assert_eq!(last["stop"]["should_stop"], true);
    assert_eq!(last["stop"]["would_stop"], true);

    let manifest = read_json(&dir.join("manifest.json"));
    assert_eq!(manifest["stop_reason"], "converged");
    assert_eq!(manifest["incomplete"], false);
}

#[tokio::test]
async fn user_interrupt_drains_and_marks_incomplete() {
    let tmp = tempfile::tempdir().unwrap();
    let config = base_config(tmp.path().to_path_buf(), 8, 2, 2);
    let backend = MockBackend::new().with_latency(Duration::from_millis(150));

    let shutdown = ShutdownSignal::new();
    let tripper = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        tripper.request_user_interrupt();
    });

    let outcome = RunOrchestrator::new(Arc::new(config), Arc::new(backend), shutdown)
        .execute()
        .await
        .expect("interrupted run still finalizes");

    assert_eq!(outcome.stop_reason, StopReason::UserInterrupt);
    assert!(outcome.incomplete);
    let dir = outcome.run_dir;

    let trials = read_jsonl(&dir.join("trials.jsonl"));
    assert!(!trials.is_empty());
    assert!(trials.len() < 8, "later trials must not be enqueued");
    for trial in &trials {
        let status = trial["status"].as_str().unwrap();
        assert!(status == "success" || status == "shutdown_abort");
    }

    let parsed = read_jsonl(&dir.join("parsed.jsonl"));
    assert_eq!(parsed.len(), trials.len());

    let manifest = read_json(&dir.join("manifest.json"));
    validate(SchemaKind::Manifest, &manifest).unwrap();
    assert_eq!(manifest["stop_reason"], "user_interrupt");
    assert_eq!(manifest["incomplete"], true);
    assert_eq!(manifest["k_attempted"].as_u64().unwrap(), trials.len() as u64);
}

#[tokio::test]
async fn contract_fail_policy_forces_an_error_stop() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = base_config(tmp.path().to_path_buf(), 2, 2, 1);
    config.protocol.decision_contract = Some(DecisionContract {
        policy: ContractPolicy::Fail,
        clause: None,
    });
    // Whitespace replies parse as failed on otherwise-successful trials.
    let backend = MockBackend::new().with_fixed_reply("   ");
    let outcome = run_with(config, Arc::new(backend)).await;

    assert_eq!(outcome.stop_reason, StopReason::Error);
    assert!(outcome.incomplete);
    let dir = outcome.run_dir;

    let manifest = read_json(&dir.join("manifest.json"));
    validate(SchemaKind::Manifest, &manifest).unwrap();
    assert_eq!(manifest["stop_reason"], "error");
    assert_eq!(manifest["incomplete"], true);
    let notes = manifest["notes"].as_array().unwrap();
    assert!(notes
        .iter()
        .any(|n| n.as_str().unwrap() == "Contract parse failures: fallback=0, failed=2"));
}

#[tokio::test]
async fn empty_plan_completes_cleanly() {
    let tmp = tempfile::tempdir().unwrap();
    let config = base_config(tmp.path().to_path_buf(), 0, 3, 2);
    let outcome = run_with(config, Arc::new(MockBackend::new())).await;

    assert_eq!(outcome.stop_reason, StopReason::Completed);
    assert!(!outcome.incomplete);
    let dir = outcome.run_dir;

    assert!(read_jsonl(&dir.join("trial_plan.jsonl")).is_empty());
    assert!(read_jsonl(&dir.join("trials.jsonl")).is_empty());
    assert!(read_jsonl(&dir.join("convergence_trace.jsonl")).is_empty());

    let manifest = read_json(&dir.join("manifest.json"));
    validate(SchemaKind::Manifest, &manifest).unwrap();
    assert_eq!(manifest["k_planned"], 0);
    assert_eq!(manifest["k_attempted"], 0);
    assert_eq!(manifest["k_eligible"], 0);
    assert_eq!(manifest["stop_reason"], "completed");

    let provenance = read_json(&dir.join("embeddings.provenance.json"));
    assert_eq!(provenance["status"], "not_generated");
}

#[tokio::test]
async fn oversized_batch_runs_as_one_batch() {
    let tmp = tempfile::tempdir().unwrap();
    let config = base_config(tmp.path().to_path_buf(), 3, 10, 2);
    let outcome = run_with(config, Arc::new(MockBackend::new())).await;
    let dir = outcome.run_dir;

    let trace = read_jsonl(&dir.join("convergence_trace.jsonl"));
    assert_eq!(trace.len(), 1);
    assert_eq!(read_jsonl(&dir.join("trials.jsonl")).len(), 3);
}

#[tokio::test]
async fn all_embeddings_failing_still_finalizes() {
    let tmp = tempfile::tempdir().unwrap();
    let config = base_config(tmp.path().to_path_buf(), 4, 2, 2);
    let backend = MockBackend::new().with_embed_failure("embedding service down");
    let outcome = run_with(config, Arc::new(backend)).await;
    let dir = outcome.run_dir;

    let manifest = read_json(&dir.join("manifest.json"));
    assert_eq!(manifest["k_attempted"], 4);
    assert_eq!(manifest["k_eligible"], 0);

    let provenance = read_json(&dir.join("embeddings.provenance.json"));
    assert_eq!(provenance["status"], "not_generated");
    assert!(!dir.join("embeddings.arrow").exists());
}

#[tokio::test]
async fn worker_count_does_not_change_recorded_outcomes() {
    let tmp_single = tempfile::tempdir().unwrap();
    let tmp_parallel = tempfile::tempdir().unwrap();
    let mut single = base_config(tmp_single.path().to_path_buf(), 6, 3, 1);
    let mut parallel = base_config(tmp_parallel.path().to_path_buf(), 6, 3, 4);
    for config in [&mut single, &mut parallel] {
        config.measurement.clustering.enabled = true;
    }

    let outcome_single = run_with(single, Arc::new(MockBackend::new())).await;
    let outcome_parallel = run_with(parallel, Arc::new(MockBackend::new())).await;

    let strip_time = |mut record: Value| {
        record.as_object_mut().unwrap().remove("recorded_at");
        record
    };

    let sorted_parsed = |dir: &Path| {
        let mut rows = read_jsonl(&dir.join("parsed.jsonl"));
        rows.sort_by_key(|r| r["trial_id"].as_u64().unwrap());
        rows
    };
    assert_eq!(
        sorted_parsed(&outcome_single.run_dir),
        sorted_parsed(&outcome_parallel.run_dir)
    );

    let trace_single: Vec<Value> = read_jsonl(&outcome_single.run_dir.join("convergence_trace.jsonl"))
        .into_iter()
        .map(strip_time)
        .collect();
    let trace_parallel: Vec<Value> =
        read_jsonl(&outcome_parallel.run_dir.join("convergence_trace.jsonl"))
            .into_iter()
            .map(strip_time)
            .collect();
    assert_eq!(trace_single, trace_parallel);

    assert_eq!(
        read_jsonl(&outcome_single.run_dir.join("clusters/online.assignments.jsonl")),
        read_jsonl(&outcome_parallel.run_dir.join("clusters/online.assignments.jsonl"))
    );
}

/// Backend whose calls panic, standing in for a programming error inside a
/// trial task.
struct PanickingBackend;

#[async_trait::async_trait]
impl Backend for PanickingBackend {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn chat(&self, _request: ChatRequest) -> Result<CallSuccess, BackendFailure> {
        panic!("backend invariant violated");
    }

    async fn embed(&self, _request: EmbedRequest) -> Result<EmbedSuccess, BackendFailure> {
        panic!("backend invariant violated");
    }
}

#[tokio::test]
async fn orchestration_failure_emits_run_failed_and_seals_the_manifest() {
    let tmp = tempfile::tempdir().unwrap();
    let config = base_config(tmp.path().to_path_buf(), 4, 2, 1);

    let result = RunOrchestrator::new(
        Arc::new(config),
        Arc::new(PanickingBackend),
        ShutdownSignal::new(),
    )
    .execute()
    .await;
    let err = result.expect_err("a panicked trial task is unrecoverable");
    assert!(err.to_string().contains("panicked"));

    // The run directory still seals: run.failed finalizes the manifest.
    let run_dir = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("run-"))
        })
        .expect("run directory exists");

    let manifest = read_json(&run_dir.join("manifest.json"));
    validate(SchemaKind::Manifest, &manifest).unwrap();
    assert_eq!(manifest["stop_reason"], "error");
    assert_eq!(manifest["incomplete"], true);
    assert_eq!(manifest["k_attempted"], 0);
    assert_eq!(manifest["k_eligible"], 0);
    let notes = manifest["notes"].as_array().unwrap();
    assert!(notes
        .iter()
        .any(|n| n.as_str().unwrap().starts_with("Run failed:")));

    // Embeddings were never finalized, so the provenance is synthesized.
    let provenance = read_json(&run_dir.join("embeddings.provenance.json"));
    assert_eq!(provenance["status"], "not_generated");
    assert_eq!(provenance["reason"], "run_failed_before_embeddings");
    assert!(!run_dir.join("embeddings.arrow").exists());

    // The monitor still published its final aggregate before run.failed.
    let aggregates = read_json(&run_dir.join("aggregates.json"));
    validate(SchemaKind::Aggregates, &aggregates).unwrap();
    assert_eq!(aggregates["k_attempted"], 0);
}

#[tokio::test]
async fn debate_protocol_runs_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = base_config(tmp.path().to_path_buf(), 4, 2, 2);
    config.protocol.protocol_type = ProtocolType::DebateV1;
    config.protocol.participants = Some(2);
    config.protocol.rounds = Some(1);
    let outcome = run_with(config, Arc::new(MockBackend::new())).await;
    let dir = outcome.run_dir;

    let plan = read_jsonl(&dir.join("trial_plan.jsonl"));
    for entry in &plan {
        let slots = entry["role_assignments"].as_object().unwrap();
        assert_eq!(slots.len(), 2);
        assert!(slots.contains_key("A"));
        assert!(slots.contains_key("B"));
    }

    let trials = read_jsonl(&dir.join("trials.jsonl"));
    assert_eq!(trials.len(), 4);
    for trial in &trials {
        assert_eq!(trial["status"], "success");
        // One turn per slot plus the closing call from slot A.
        assert_eq!(trial["calls"].as_array().unwrap().len(), 3);
        assert_eq!(trial["transcript"].as_array().unwrap().len(), 2);
        let last_call = trial["calls"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(last_call["purpose"], "final");
        assert_eq!(last_call["slot"], "A");
    }

    let manifest = read_json(&dir.join("manifest.json"));
    assert_eq!(manifest["k_attempted"], 4);
    assert_eq!(manifest["k_eligible"], 4);
}

#[tokio::test]
async fn repeated_runs_with_one_seed_are_reproducible() {
    let tmp_a = tempfile::tempdir().unwrap();
    let tmp_b = tempfile::tempdir().unwrap();
    let config_a = base_config(tmp_a.path().to_path_buf(), 5, 2, 2);
    let config_b = base_config(tmp_b.path().to_path_buf(), 5, 2, 2);

    let outcome_a = run_with(config_a, Arc::new(MockBackend::new())).await;
    let outcome_b = run_with(config_b, Arc::new(MockBackend::new())).await;

    // Same seed, same sampling config: byte-identical plans and identical
    // recorded plan hashes, regardless of output location.
    let plan_a = std::fs::read_to_string(outcome_a.run_dir.join("trial_plan.jsonl")).unwrap();
    let plan_b = std::fs::read_to_string(outcome_b.run_dir.join("trial_plan.jsonl")).unwrap();
    assert_eq!(plan_a, plan_b);

    let manifest_a = read_json(&outcome_a.run_dir.join("manifest.json"));
    let manifest_b = read_json(&outcome_b.run_dir.join("manifest.json"));
    assert_eq!(manifest_a["plan_sha256"], manifest_b["plan_sha256"]);

    let sorted = |dir: &Path| {
        let mut rows = read_jsonl(&dir.join("parsed.jsonl"));
        rows.sort_by_key(|r| r["trial_id"].as_u64().unwrap());
        rows
    };
    assert_eq!(sorted(&outcome_a.run_dir), sorted(&outcome_b.run_dir));
}

#[tokio::test]
async fn debug_mode_keeps_the_embeddings_jsonl() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = base_config(tmp.path().to_path_buf(), 3, 3, 1);
    config.output.debug_enabled = true;
    let outcome = run_with(config, Arc::new(MockBackend::new())).await;
    let dir = outcome.run_dir;

    assert!(dir.join("debug/embeddings.jsonl").exists());
    assert!(dir.join("embeddings.arrow").exists());
    let embeddings = read_jsonl(&dir.join("debug/embeddings.jsonl"));
    let successes = embeddings
        .iter()
        .filter(|e| e["embedding_status"] == "success")
        .count();
    let manifest = read_json(&dir.join("manifest.json"));
    assert_eq!(manifest["k_eligible"].as_u64().unwrap(), successes as u64);
    let artifacts: Vec<&str> = manifest["artifacts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a.as_str().unwrap())
        .collect();
    assert!(artifacts.contains(&"debug/embeddings.jsonl"));
    assert!(artifacts.contains(&"embeddings.arrow"));
}

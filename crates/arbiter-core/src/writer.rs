use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use arrow::array::{ArrayRef, FixedSizeListArray, Float32Array, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::writer::FileWriter as ArrowFileWriter;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde_json::Value;

use arbiter_schemas::{validate, SchemaKind};
use arbiter_types::{
    decode_vector_f32le, ContractPolicy, EmbeddingStatus, EmbeddingsProvenance, Manifest,
    ParseStatus, ProvenanceStatus, ResolvedConfig, RunEvent, StopReason, StopSnapshot, Topic,
    TrialStatus, UsageSummary, UsageTotals,
};

use crate::event_bus::{EventBus, Subscription};

const CONFIG_FILE: &str = "config.resolved.json";
const MANIFEST_FILE: &str = "manifest.json";
const TRIAL_PLAN_FILE: &str = "trial_plan.jsonl";
const TRIALS_FILE: &str = "trials.jsonl";
const PARSED_FILE: &str = "parsed.jsonl";
const CONVERGENCE_FILE: &str = "convergence_trace.jsonl";
const PROVENANCE_FILE: &str = "embeddings.provenance.json";
const AGGREGATES_FILE: &str = "aggregates.json";
const ARROW_FILE: &str = "embeddings.arrow";
const DEBUG_EMBEDDINGS_FILE: &str = "debug/embeddings.jsonl";
const CLUSTER_ASSIGNMENTS_FILE: &str = "clusters/online.assignments.jsonl";
const CLUSTER_STATE_FILE: &str = "clusters/online.state.json";

/// Owns the run directory: append-only JSONL logs, atomically-written JSON
/// artifacts, and the manifest lifecycle. Consumes the whole event stream;
/// a failing write is surfaced as a warning and never aborts the run.
pub struct ArtifactWriter {
    inner: Arc<Mutex<WriterInner>>,
    bus: EventBus,
    subscriptions: Vec<Subscription>,
}

struct JsonlWriter {
    path: PathBuf,
    file: BufWriter<File>,
}

impl JsonlWriter {
    fn open(path: PathBuf) -> anyhow::Result<Self> {
        let file = File::options()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
        })
    }

    fn append(&mut self, value: &Value) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.file, value)?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }

    fn close(mut self) -> anyhow::Result<PathBuf> {
        self.file.flush()?;
        Ok(self.path)
    }
}

struct WriterInner {
    run_dir: PathBuf,
    validate_artifacts: bool,
    debug_enabled: bool,
    clustering_enabled: bool,
    contract_policy: Option<ContractPolicy>,
    embedding_model: String,
    trial_plan: Option<JsonlWriter>,
    trials: Option<JsonlWriter>,
    parsed: Option<JsonlWriter>,
    convergence: Option<JsonlWriter>,
    cluster_assignments: Option<JsonlWriter>,
    embeddings_debug: Option<JsonlWriter>,
    manifest: Option<Manifest>,
    trial_count: u64,
    embedding_success: u64,
    embedding_failed: u64,
    embedding_skipped: u64,
    usage_totals: UsageTotals,
    usage_per_model: BTreeMap<String, UsageTotals>,
    success_trials: HashSet<u32>,
    contract_fallback: u64,
    contract_failed: u64,
    vectors: Vec<(u32, Vec<f32>)>,
    provenance: Option<EmbeddingsProvenance>,
    extra_artifacts: Vec<String>,
    warning_count: u64,
    finalized: bool,
}

fn lock(inner: &Mutex<WriterInner>) -> MutexGuard<'_, WriterInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ArtifactWriter {
    pub fn create(
        run_dir: &Path,
        config: &ResolvedConfig,
        bus: EventBus,
    ) -> anyhow::Result<Self> {
        fs::create_dir_all(run_dir)?;
        fs::create_dir_all(run_dir.join("debug"))?;
        let clustering_enabled = config.measurement.clustering.enabled;
        if clustering_enabled {
            fs::create_dir_all(run_dir.join("clusters"))?;
        }

        let inner = WriterInner {
            run_dir: run_dir.to_path_buf(),
            validate_artifacts: config.output.validate_artifacts,
            debug_enabled: config.output.debug_enabled,
            clustering_enabled,
            contract_policy: config
                .protocol
                .decision_contract
                .as_ref()
                .map(|c| c.policy),
            embedding_model: config.measurement.embedding_model.clone(),
            trial_plan: Some(JsonlWriter::open(run_dir.join(TRIAL_PLAN_FILE))?),
            trials: Some(JsonlWriter::open(run_dir.join(TRIALS_FILE))?),
            parsed: Some(JsonlWriter::open(run_dir.join(PARSED_FILE))?),
            convergence: Some(JsonlWriter::open(run_dir.join(CONVERGENCE_FILE))?),
            cluster_assignments: clustering_enabled
                .then(|| JsonlWriter::open(run_dir.join(CLUSTER_ASSIGNMENTS_FILE)))
                .transpose()?,
            embeddings_debug: Some(JsonlWriter::open(run_dir.join(DEBUG_EMBEDDINGS_FILE))?),
            manifest: None,
            trial_count: 0,
            embedding_success: 0,
            embedding_failed: 0,
            embedding_skipped: 0,
            usage_totals: UsageTotals::default(),
            usage_per_model: BTreeMap::new(),
            success_trials: HashSet::new(),
            contract_fallback: 0,
            contract_failed: 0,
            vectors: Vec::new(),
            provenance: None,
            extra_artifacts: Vec::new(),
            warning_count: 0,
            finalized: false,
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            bus,
            subscriptions: Vec::new(),
        })
    }

    /// Subscribe to every topic. Handler errors become `warning.raised`.
    pub fn attach(&mut self) {
        for topic in Topic::ALL {
            let inner = self.inner.clone();
            let handler = move |event: &RunEvent| handle_event(&inner, event);
            let bus = self.bus.clone();
            let on_error = move |err: anyhow::Error| {
                tracing::warn!(target: "arbiter.writer", "writer handler failed: {err:#}");
                if topic != Topic::WarningRaised {
                    bus.emit(RunEvent::WarningRaised {
                        component: "writer".to_string(),
                        message: err.to_string(),
                    });
                }
            };
            self.subscriptions
                .push(self.bus.subscribe_safe(topic, handler, on_error));
        }
    }

    /// Materialize the final embeddings artifact (Arrow, falling back to the
    /// JSONL already on disk) and emit `embeddings.finalized`.
    pub fn finalize_embeddings(&self) {
        let provenance = {
            let mut inner = lock(&self.inner);
            build_embeddings_provenance(&mut inner)
        };
        self.bus.emit(RunEvent::EmbeddingsFinalized(provenance));
    }

    /// Final manifest as written to disk, once the run has finished.
    pub fn manifest_snapshot(&self) -> Option<Manifest> {
        lock(&self.inner).manifest.clone()
    }

    pub fn close(&self) -> anyhow::Result<()> {
        let mut inner = lock(&self.inner);
        for writer in [
            inner.trial_plan.take(),
            inner.trials.take(),
            inner.parsed.take(),
            inner.convergence.take(),
            inner.cluster_assignments.take(),
            inner.embeddings_debug.take(),
        ]
        .into_iter()
        .flatten()
        {
            writer.close()?;
        }
        Ok(())
    }
}

fn handle_event(inner: &Mutex<WriterInner>, event: &RunEvent) -> anyhow::Result<()> {
    match event {
        RunEvent::RunStarted {
            run_id,
            started_at,
            k_planned,
            plan_sha256,
            config_sha256,
            config,
        } => on_run_started(
            &mut lock(inner),
            run_id,
            *started_at,
            *k_planned,
            plan_sha256,
            config_sha256,
            config,
        ),
        RunEvent::TrialPlanned(entry) => {
            let mut inner = lock(inner);
            let value = serde_json::to_value(entry)?;
            check(&inner, SchemaKind::PlanEntry, &value)?;
            append(&mut inner.trial_plan, &value)
        }
        RunEvent::TrialCompleted(record) => {
            let mut inner = lock(inner);
            let value = serde_json::to_value(record)?;
            check(&inner, SchemaKind::TrialRecord, &value)?;
            append(&mut inner.trials, &value)?;
            inner.trial_count += 1;
            if record.status == TrialStatus::Success {
                inner.success_trials.insert(record.trial_id);
            }
            if let Some(usage) = &record.usage {
                inner.usage_totals.add(usage);
                inner
                    .usage_per_model
                    .entry(record.requested_model_slug.clone())
                    .or_default()
                    .add(usage);
            }
            Ok(())
        }
        RunEvent::ParsedOutput(parsed) => {
            let mut inner = lock(inner);
            let value = serde_json::to_value(parsed)?;
            check(&inner, SchemaKind::ParsedOutput, &value)?;
            append(&mut inner.parsed, &value)?;
            if inner.contract_policy.is_some() && inner.success_trials.contains(&parsed.trial_id) {
                match parsed.parse_status {
                    ParseStatus::Fallback => inner.contract_fallback += 1,
                    ParseStatus::Failed => inner.contract_failed += 1,
                    ParseStatus::Success => {}
                }
            }
            Ok(())
        }
        RunEvent::EmbeddingRecorded(record) => {
            let mut inner = lock(inner);
            let value = serde_json::to_value(record)?;
            check(&inner, SchemaKind::EmbeddingRecord, &value)?;
            append(&mut inner.embeddings_debug, &value)?;
            match record.embedding_status {
                EmbeddingStatus::Success => {
                    inner.embedding_success += 1;
                    if let Some(payload) = &record.vector_b64 {
                        let vector = decode_vector_f32le(payload)?;
                        inner.vectors.push((record.trial_id, vector));
                    }
                }
                EmbeddingStatus::Failed => inner.embedding_failed += 1,
                EmbeddingStatus::Skipped => inner.embedding_skipped += 1,
            }
            Ok(())
        }
        RunEvent::BatchStarted { .. } | RunEvent::BatchCompleted { .. } => Ok(()),
        RunEvent::ConvergenceRecord(record) => {
            let mut inner = lock(inner);
            let value = serde_json::to_value(record)?;
            check(&inner, SchemaKind::MonitoringRecord, &value)?;
            append(&mut inner.convergence, &value)
        }
        RunEvent::ClusterAssigned(assignment) => {
            let mut inner = lock(inner);
            let value = serde_json::to_value(assignment)?;
            check(&inner, SchemaKind::ClusterAssignment, &value)?;
            append(&mut inner.cluster_assignments, &value)
        }
        RunEvent::ClustersState(state) => {
            let inner = lock(inner);
            let value = serde_json::to_value(state)?;
            check(&inner, SchemaKind::ClustersState, &value)?;
            write_json_atomic(&inner.run_dir.join(CLUSTER_STATE_FILE), &value, false)
        }
        RunEvent::AggregatesComputed(aggregates) => {
            let inner = lock(inner);
            let value = serde_json::to_value(aggregates)?;
            check(&inner, SchemaKind::Aggregates, &value)?;
            write_json_atomic(&inner.run_dir.join(AGGREGATES_FILE), &value, true)
        }
        RunEvent::EmbeddingsFinalized(provenance) => {
            let mut inner = lock(inner);
            let value = serde_json::to_value(provenance)?;
            check(&inner, SchemaKind::EmbeddingsProvenance, &value)?;
            write_json_atomic(&inner.run_dir.join(PROVENANCE_FILE), &value, true)?;
            inner.provenance = Some(provenance.clone());
            Ok(())
        }
        RunEvent::ArtifactWritten { path } => {
            let mut inner = lock(inner);
            if !inner.extra_artifacts.contains(path) {
                inner.extra_artifacts.push(path.clone());
            }
            if inner.finalized {
                refresh_manifest_artifacts(&mut inner)?;
            }
            Ok(())
        }
        RunEvent::WarningRaised { component, message } => {
            let mut inner = lock(inner);
            inner.warning_count += 1;
            tracing::warn!(
                target: "arbiter.writer",
                component = component.as_str(),
                "warning raised: {message}"
            );
            Ok(())
        }
        RunEvent::RunCompleted {
            stop_reason,
            completed_at,
        } => finalize_manifest(&mut lock(inner), *stop_reason, *completed_at, None),
        RunEvent::RunFailed {
            error,
            completed_at,
        } => finalize_manifest(
            &mut lock(inner),
            StopReason::Error,
            *completed_at,
            Some(error.clone()),
        ),
    }
}

fn on_run_started(
    inner: &mut WriterInner,
    run_id: &str,
    started_at: DateTime<Utc>,
    k_planned: u32,
    plan_sha256: &str,
    config_sha256: &str,
    config: &ResolvedConfig,
) -> anyhow::Result<()> {
    let config_value = serde_json::to_value(config)?;
    check(inner, SchemaKind::ResolvedConfig, &config_value)?;
    write_json_atomic(&inner.run_dir.join(CONFIG_FILE), &config_value, true)?;

    let manifest = Manifest {
        schema_version: Manifest::SCHEMA_VERSION.to_string(),
        arbiter_version: env!("CARGO_PKG_VERSION").to_string(),
        run_id: run_id.to_string(),
        started_at,
        completed_at: None,
        plan_sha256: plan_sha256.to_string(),
        config_sha256: config_sha256.to_string(),
        hash_algorithm: "sha256".to_string(),
        k_planned,
        k_attempted: 0,
        k_eligible: 0,
        stop_reason: None,
        incomplete: true,
        stop: StopSnapshot {
            stop_mode: config.execution.stop_mode,
            stop_policy: config.execution.stop_policy.clone(),
            novelty_threshold: config.measurement.novelty_threshold,
        },
        model_catalog_version: None,
        model_catalog_sha256: None,
        prompt_manifest_sha256: Some(crate::protocol::prompt_manifest_sha256(config)),
        usage: None,
        notes: Vec::new(),
        artifacts: vec![CONFIG_FILE.to_string(), MANIFEST_FILE.to_string()],
    };
    write_manifest(inner, &manifest)?;
    inner.manifest = Some(manifest);
    tracing::info!(
        target: "arbiter.writer",
        run_id,
        k_planned,
        dir = %inner.run_dir.display(),
        "run directory initialized"
    );
    Ok(())
}

fn finalize_manifest(
    inner: &mut WriterInner,
    stop_reason: StopReason,
    completed_at: DateTime<Utc>,
    failure: Option<String>,
) -> anyhow::Result<()> {
    if inner.provenance.is_none() {
        let reason = if failure.is_some() {
            "run_failed_before_embeddings"
        } else {
            "no_embeddings_generated"
        };
        let synthesized = EmbeddingsProvenance {
            status: ProvenanceStatus::NotGenerated,
            reason: Some(reason.to_string()),
            embedding_model: Some(inner.embedding_model.clone()),
            dimensions: None,
            count: 0,
            path: None,
            finalized_at: completed_at,
        };
        let value = serde_json::to_value(&synthesized)?;
        check(inner, SchemaKind::EmbeddingsProvenance, &value)?;
        write_json_atomic(&inner.run_dir.join(PROVENANCE_FILE), &value, true)?;
        inner.provenance = Some(synthesized);
    }

    let mut manifest = inner
        .manifest
        .clone()
        .ok_or_else(|| anyhow::anyhow!("run finished before run.started was observed"))?;

    manifest.completed_at = Some(completed_at);
    manifest.stop_reason = Some(stop_reason);
    manifest.incomplete = stop_reason.is_incomplete();
    manifest.k_attempted = inner.trial_count;
    manifest.k_eligible = inner.embedding_success;

    if let Some(error) = failure {
        manifest.notes.push(format!("Run failed: {error}"));
    }

    if !inner.usage_totals.is_zero() {
        manifest.usage = Some(UsageSummary {
            totals: inner.usage_totals.clone(),
            per_model: inner.usage_per_model.clone(),
        });
    }

    let contract_failures = inner.contract_fallback + inner.contract_failed;
    if contract_failures > 0 {
        match inner.contract_policy {
            Some(ContractPolicy::Fail) => {
                manifest.stop_reason = Some(StopReason::Error);
                manifest.incomplete = true;
                manifest.notes.push(format!(
                    "Contract parse failures: fallback={}, failed={}",
                    inner.contract_fallback, inner.contract_failed
                ));
            }
            Some(ContractPolicy::Warn) => {
                manifest.notes.push(format!(
                    "Contract parse failures: fallback={}, failed={}",
                    inner.contract_fallback, inner.contract_failed
                ));
            }
            Some(ContractPolicy::Exclude) | None => {}
        }
    }

    if inner.warning_count > 0 {
        manifest
            .notes
            .push(format!("{} warnings raised during the run", inner.warning_count));
    }

    manifest.artifacts = build_artifact_list(inner);

    write_manifest(inner, &manifest)?;
    inner.manifest = Some(manifest);
    inner.finalized = true;
    Ok(())
}

fn refresh_manifest_artifacts(inner: &mut WriterInner) -> anyhow::Result<()> {
    let Some(mut manifest) = inner.manifest.clone() else {
        return Ok(());
    };
    manifest.artifacts = build_artifact_list(inner);
    write_manifest(inner, &manifest)?;
    inner.manifest = Some(manifest);
    Ok(())
}

fn build_artifact_list(inner: &WriterInner) -> Vec<String> {
    let mut artifacts = vec![
        CONFIG_FILE.to_string(),
        MANIFEST_FILE.to_string(),
        TRIAL_PLAN_FILE.to_string(),
        TRIALS_FILE.to_string(),
        PARSED_FILE.to_string(),
        CONVERGENCE_FILE.to_string(),
        PROVENANCE_FILE.to_string(),
        AGGREGATES_FILE.to_string(),
    ];
    let provenance_status = inner.provenance.as_ref().map(|p| p.status);
    if provenance_status == Some(ProvenanceStatus::ArrowGenerated) {
        artifacts.push(ARROW_FILE.to_string());
    }
    if inner.debug_enabled || provenance_status == Some(ProvenanceStatus::JsonlFallback) {
        artifacts.push(DEBUG_EMBEDDINGS_FILE.to_string());
    }
    if inner.clustering_enabled {
        artifacts.push(CLUSTER_ASSIGNMENTS_FILE.to_string());
        artifacts.push(CLUSTER_STATE_FILE.to_string());
    }
    for extra in &inner.extra_artifacts {
        if !artifacts.contains(extra) {
            artifacts.push(extra.clone());
        }
    }
    artifacts
}

fn build_embeddings_provenance(inner: &mut WriterInner) -> EmbeddingsProvenance {
    let finalized_at = Utc::now();

    if inner.vectors.is_empty() {
        discard_debug_jsonl_if_unwanted(inner);
        return EmbeddingsProvenance {
            status: ProvenanceStatus::NotGenerated,
            reason: Some("no_successful_embeddings".to_string()),
            embedding_model: Some(inner.embedding_model.clone()),
            dimensions: None,
            count: 0,
            path: None,
            finalized_at,
        };
    }

    let mut vectors = std::mem::take(&mut inner.vectors);
    vectors.sort_by_key(|(id, _)| *id);
    vectors.dedup_by_key(|(id, _)| *id);
    let count = vectors.len() as u64;
    let dimensions = vectors[0].1.len();
    let uniform = vectors.iter().all(|(_, v)| v.len() == dimensions);

    let arrow_result = if uniform {
        write_arrow_file(&inner.run_dir.join(ARROW_FILE), &vectors, dimensions)
    } else {
        Err(anyhow::anyhow!(
            "embedding dimensions are not uniform across the run"
        ))
    };
    inner.vectors = vectors;

    match arrow_result {
        Ok(()) => {
            discard_debug_jsonl_if_unwanted(inner);
            EmbeddingsProvenance {
                status: ProvenanceStatus::ArrowGenerated,
                reason: None,
                embedding_model: Some(inner.embedding_model.clone()),
                dimensions: Some(dimensions),
                count,
                path: Some(ARROW_FILE.to_string()),
                finalized_at,
            }
        }
        Err(err) => {
            tracing::warn!(
                target: "arbiter.writer",
                "arrow finalization failed, keeping JSONL fallback: {err:#}"
            );
            EmbeddingsProvenance {
                status: ProvenanceStatus::JsonlFallback,
                reason: Some(err.to_string()),
                embedding_model: Some(inner.embedding_model.clone()),
                dimensions: Some(dimensions),
                count,
                path: Some(DEBUG_EMBEDDINGS_FILE.to_string()),
                finalized_at,
            }
        }
    }
}

/// The embeddings JSONL is a working file: it survives only for debugging or
/// as the fallback artifact.
fn discard_debug_jsonl_if_unwanted(inner: &mut WriterInner) {
    if inner.debug_enabled {
        return;
    }
    if let Some(writer) = inner.embeddings_debug.take() {
        match writer.close() {
            Ok(path) => {
                let _ = fs::remove_file(&path);
                if let Some(parent) = path.parent() {
                    let _ = fs::remove_dir(parent);
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "arbiter.writer",
                    "failed to close embeddings JSONL before removal: {err:#}"
                );
            }
        }
    }
}

fn write_arrow_file(
    path: &Path,
    vectors: &[(u32, Vec<f32>)],
    dimensions: usize,
) -> anyhow::Result<()> {
    let item_field = Arc::new(Field::new("item", DataType::Float32, false));
    let schema = Arc::new(Schema::new(vec![
        Field::new("trial_id", DataType::UInt32, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(item_field.clone(), dimensions as i32),
            false,
        ),
    ]));

    let ids = UInt32Array::from(vectors.iter().map(|(id, _)| *id).collect::<Vec<u32>>());
    let flat = Float32Array::from(
        vectors
            .iter()
            .flat_map(|(_, v)| v.iter().copied())
            .collect::<Vec<f32>>(),
    );
    let lists = FixedSizeListArray::new(item_field, dimensions as i32, Arc::new(flat), None);
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![Arc::new(ids) as ArrayRef, Arc::new(lists) as ArrayRef],
    )?;

    let tmp = tmp_sibling(path);
    {
        let file = File::create(&tmp)?;
        let mut writer = ArrowFileWriter::try_new(file, &schema)?;
        writer.write(&batch)?;
        writer.finish()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn check(inner: &WriterInner, kind: SchemaKind, value: &Value) -> anyhow::Result<()> {
    if inner.validate_artifacts {
        validate(kind, value)?;
    }
    Ok(())
}

fn append(writer: &mut Option<JsonlWriter>, value: &Value) -> anyhow::Result<()> {
    writer
        .as_mut()
        .ok_or_else(|| anyhow::anyhow!("log writer is closed"))?
        .append(value)
}

fn write_manifest(inner: &WriterInner, manifest: &Manifest) -> anyhow::Result<()> {
    let value = serde_json::to_value(manifest)?;
    check(inner, SchemaKind::Manifest, &value)?;
    write_json_atomic(&inner.run_dir.join(MANIFEST_FILE), &value, true)
}

/// Write-to-tmp then rename. Callers get either the old file or the new one,
/// never a partial write.
fn write_json_atomic(path: &Path, value: &Value, pretty: bool) -> anyhow::Result<()> {
    let payload = if pretty {
        serde_json::to_vec_pretty(value)?
    } else {
        serde_json::to_vec(value)?
    };
    let tmp = tmp_sibling(path);
    fs::write(&tmp, payload).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!("{name}.tmp"))
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;

use arbiter_backend::Backend;
use arbiter_types::{ResolvedConfig, RunEvent, StopReason};

use crate::canonical::canonical_sha256;
use crate::event_bus::EventBus;
use crate::executor::run_batches;
use crate::monitor::ClusteringMonitor;
use crate::planner::build_plan;
use crate::shutdown::ShutdownSignal;
use crate::writer::ArtifactWriter;

/// Result of one completed run, as recorded in the finalized manifest.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub stop_reason: StopReason,
    pub incomplete: bool,
}

/// Wires planner, bus, executor, monitor, and writer together and owns the
/// run lifecycle: `run.started` → batches → `run.completed` | `run.failed`.
pub struct RunOrchestrator {
    config: Arc<ResolvedConfig>,
    backend: Arc<dyn Backend>,
    shutdown: ShutdownSignal,
}

impl RunOrchestrator {
    pub fn new(
        config: Arc<ResolvedConfig>,
        backend: Arc<dyn Backend>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            backend,
            shutdown,
        }
    }

    pub async fn execute(&self) -> anyhow::Result<RunOutcome> {
        // Plan generation and directory setup abort before run.started.
        let plan = build_plan(&self.config).context("plan generation failed")?;
        let config_value = serde_json::to_value(&*self.config)?;
        let config_sha256 = canonical_sha256(&config_value);

        let run_id = generate_run_id();
        let run_dir = self.config.output.runs_dir.join(&run_id);

        let bus = EventBus::new();
        let mut monitor = ClusteringMonitor::new(bus.clone(), self.shutdown.clone(), &self.config);
        monitor.attach();
        let mut writer = ArtifactWriter::create(&run_dir, &self.config, bus.clone())
            .with_context(|| format!("initializing run directory {}", run_dir.display()))?;
        writer.attach();

        tracing::info!(
            target: "arbiter.orchestrator",
            run_id = run_id.as_str(),
            k_planned = plan.entries.len(),
            plan_sha256 = plan.sha256.as_str(),
            "run started"
        );
        bus.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            started_at: Utc::now(),
            k_planned: plan.entries.len() as u32,
            plan_sha256: plan.sha256.clone(),
            config_sha256,
            config: self.config.clone(),
        });
        for entry in &plan.entries {
            bus.emit(RunEvent::TrialPlanned(entry.clone()));
        }
        bus.flush();

        let stop_reason = match run_batches(
            &plan.entries,
            self.config.clone(),
            self.backend.clone(),
            &bus,
            &self.shutdown,
        )
        .await
        {
            Ok(stop_reason) => stop_reason,
            Err(err) => {
                // Unrecoverable orchestration failure: seal the manifest via
                // run.failed, then re-raise to the caller.
                tracing::error!(
                    target: "arbiter.orchestrator",
                    run_id = run_id.as_str(),
                    "run failed: {err:#}"
                );
                monitor.finalize();
                bus.emit(RunEvent::RunFailed {
                    error: format!("{err:#}"),
                    completed_at: Utc::now(),
                });
                bus.flush();
                if let Err(close_err) = writer.close() {
                    tracing::warn!(
                        target: "arbiter.orchestrator",
                        "closing run logs failed: {close_err:#}"
                    );
                }
                return Err(err);
            }
        };

        // Finalization order: aggregates, then embeddings, then the terminal
        // run event that seals the manifest.
        monitor.finalize();
        writer.finalize_embeddings();
        bus.emit(RunEvent::RunCompleted {
            stop_reason,
            completed_at: Utc::now(),
        });
        bus.flush();
        if let Err(err) = writer.close() {
            tracing::warn!(target: "arbiter.orchestrator", "closing run logs failed: {err:#}");
        }

        // The contract-failure policy may have overridden the stop reason at
        // manifest finalization; the manifest is authoritative.
        let manifest = writer.manifest_snapshot();
        let (stop_reason, incomplete) = manifest
            .as_ref()
            .and_then(|m| m.stop_reason.map(|r| (r, m.incomplete)))
            .unwrap_or((stop_reason, stop_reason.is_incomplete()));

        tracing::info!(
            target: "arbiter.orchestrator",
            run_id = run_id.as_str(),
            stop_reason = stop_reason.as_str(),
            incomplete,
            "run finished"
        );
        Ok(RunOutcome {
            run_id,
            run_dir,
            stop_reason,
            incomplete,
        })
    }
}

fn generate_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("run-{stamp}-{}", &suffix[..8])
}

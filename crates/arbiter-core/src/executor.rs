use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use arbiter_backend::Backend;
use arbiter_types::{PlanEntry, ResolvedConfig, RunEvent, StopReason};

use crate::event_bus::EventBus;
use crate::shutdown::{ShutdownSignal, StopCause};
use crate::trial::{execute_trial, TrialArtifacts};

/// Run the plan in contiguous batches with up to `workers` trials inflight.
/// The cancellation oracle is consulted at batch boundaries and before every
/// enqueue; on a stop, inflight trials are drained and their records emitted,
/// but nothing further is enqueued. A panicked trial task is unrecoverable
/// and aborts the run.
pub async fn run_batches(
    entries: &[PlanEntry],
    config: Arc<ResolvedConfig>,
    backend: Arc<dyn Backend>,
    bus: &EventBus,
    shutdown: &ShutdownSignal,
) -> anyhow::Result<StopReason> {
    if entries.is_empty() {
        return Ok(StopReason::Completed);
    }

    let batch_size = config.execution.batch_size.max(1) as usize;
    let workers = config.execution.workers.max(1) as usize;
    let grace = Duration::from_millis(config.execution.grace_window_ms);
    let mut halted: Option<StopCause> = None;

    'batches: for (batch_index, chunk) in entries.chunks(batch_size).enumerate() {
        let batch_number = batch_index as u32;
        if let Some(cause) = shutdown.stop_cause(true) {
            halted = Some(cause);
            break 'batches;
        }

        let planned_ids: Vec<u32> = chunk.iter().map(|e| e.trial_id).collect();
        tracing::info!(
            target: "arbiter.executor",
            batch = batch_number,
            trials = planned_ids.len(),
            "batch started"
        );
        bus.emit(RunEvent::BatchStarted {
            batch_number,
            trial_ids: planned_ids,
        });

        let mut join_set: JoinSet<TrialArtifacts> = JoinSet::new();
        let mut pending = chunk.iter();
        let mut enqueued: Vec<u32> = Vec::new();

        loop {
            while join_set.len() < workers && halted.is_none() {
                if let Some(cause) = shutdown.stop_cause(true) {
                    halted = Some(cause);
                    break;
                }
                let Some(entry) = pending.next() else { break };
                enqueued.push(entry.trial_id);
                join_set.spawn(execute_trial(
                    entry.clone(),
                    config.clone(),
                    backend.clone(),
                    shutdown.clone(),
                ));
            }

            let joined = if halted == Some(StopCause::UserInterrupt) && !join_set.is_empty() {
                match tokio::time::timeout(grace, join_set.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        bus.emit(RunEvent::WarningRaised {
                            component: "executor".to_string(),
                            message: format!(
                                "grace window of {}ms expired; aborting {} inflight trials",
                                grace.as_millis(),
                                join_set.len()
                            ),
                        });
                        join_set.abort_all();
                        while let Some(result) = join_set.join_next().await {
                            if let Ok(artifacts) = result {
                                emit_trial_events(bus, artifacts);
                            }
                        }
                        None
                    }
                }
            } else {
                join_set.join_next().await
            };

            match joined {
                Some(Ok(artifacts)) => emit_trial_events(bus, artifacts),
                Some(Err(join_err)) if join_err.is_panic() => {
                    anyhow::bail!("trial task panicked: {join_err}");
                }
                Some(Err(join_err)) => {
                    bus.emit(RunEvent::WarningRaised {
                        component: "executor".to_string(),
                        message: format!("trial task failed to join: {join_err}"),
                    });
                }
                None => break,
            }
        }

        enqueued.sort_unstable();
        bus.emit(RunEvent::BatchCompleted {
            batch_number,
            trial_ids: enqueued,
        });

        if halted.is_some() {
            break 'batches;
        }
    }

    // The monitor may have tripped convergence on the final batch; interrupt
    // and convergence both take precedence over a fully-executed plan.
    Ok(match halted.or(shutdown.stop_cause(true)) {
        Some(StopCause::UserInterrupt) => StopReason::UserInterrupt,
        Some(StopCause::Converged) => StopReason::Converged,
        None => StopReason::KMaxReached,
    })
}

fn emit_trial_events(bus: &EventBus, artifacts: TrialArtifacts) {
    let TrialArtifacts {
        record,
        parsed,
        embedding,
    } = artifacts;
    tracing::debug!(
        target: "arbiter.executor",
        trial = record.trial_id,
        status = record.status.as_str(),
        "trial completed"
    );
    bus.emit(RunEvent::TrialCompleted(record));
    bus.emit(RunEvent::ParsedOutput(parsed));
    bus.emit(RunEvent::EmbeddingRecorded(embedding));
}

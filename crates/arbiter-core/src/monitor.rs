use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use arbiter_types::{
    decode_vector_f32le, Aggregates, CentroidUpdateRule, ClusterAssignment, ClusterMetrics,
    ClustersState, ClusteringSection, EmbeddingStatus, MonitoringRecord, ResolvedConfig, RunEvent,
    StopBlock, StopMode, StopPolicy, Topic,
};

use crate::event_bus::{EventBus, Subscription};
use crate::shutdown::ShutdownSignal;

/// Online convergence monitor: buffers successful embeddings as they arrive,
/// and on every `batch.completed` computes novelty metrics, advances the
/// single-pass leader clustering, and evaluates the stop policy. A monitor
/// failure never aborts the run; bad events are reported and ignored.
pub struct ClusteringMonitor {
    inner: Arc<Mutex<MonitorState>>,
    bus: EventBus,
    shutdown: ShutdownSignal,
    subscriptions: Vec<Subscription>,
}

struct Cluster {
    centroid: Vec<f32>,
    count: u64,
}

struct MonitorState {
    stop_mode: StopMode,
    stop_policy: StopPolicy,
    novelty_threshold: f64,
    k_min: u32,
    clustering: ClusteringSection,
    pending: HashMap<u32, Vec<f32>>,
    priors: Vec<Vec<f32>>,
    clusters: Vec<Cluster>,
    total_assigned: u64,
    forced_cumulative: u64,
    prev_distribution: Option<Vec<u64>>,
    consecutive_met: u32,
    k_attempted: u64,
    k_eligible: u64,
    batches_seen: u32,
    dimensions: Option<usize>,
    last_record: Option<MonitoringRecord>,
}

fn lock(inner: &Mutex<MonitorState>) -> MutexGuard<'_, MonitorState> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClusteringMonitor {
    pub fn new(bus: EventBus, shutdown: ShutdownSignal, config: &ResolvedConfig) -> Self {
        // The clustering section may carry its own stop-mode override.
        let stop_mode = config
            .measurement
            .clustering
            .stop_mode
            .unwrap_or(config.execution.stop_mode);
        Self {
            inner: Arc::new(Mutex::new(MonitorState {
                stop_mode,
                stop_policy: config.execution.stop_policy.clone(),
                novelty_threshold: config.measurement.novelty_threshold,
                k_min: config.execution.k_min,
                clustering: config.measurement.clustering.clone(),
                pending: HashMap::new(),
                priors: Vec::new(),
                clusters: Vec::new(),
                total_assigned: 0,
                forced_cumulative: 0,
                prev_distribution: None,
                consecutive_met: 0,
                k_attempted: 0,
                k_eligible: 0,
                batches_seen: 0,
                dimensions: None,
                last_record: None,
            })),
            bus,
            shutdown,
            subscriptions: Vec::new(),
        }
    }

    pub fn attach(&mut self) {
        let on_error = |bus: EventBus| {
            move |err: anyhow::Error| {
                tracing::warn!(target: "arbiter.monitor", "monitor handler failed: {err}");
                bus.emit(RunEvent::WarningRaised {
                    component: "monitor".to_string(),
                    message: err.to_string(),
                });
            }
        };

        let inner = self.inner.clone();
        self.subscriptions.push(self.bus.subscribe(
            Topic::TrialCompleted,
            move |event| {
                if let RunEvent::TrialCompleted(_) = event {
                    lock(&inner).k_attempted += 1;
                }
            },
        ));

        let inner = self.inner.clone();
        self.subscriptions.push(self.bus.subscribe_safe(
            Topic::EmbeddingRecorded,
            move |event| {
                let RunEvent::EmbeddingRecorded(record) = event else {
                    return Ok(());
                };
                if record.embedding_status != EmbeddingStatus::Success {
                    return Ok(());
                }
                let payload = record
                    .vector_b64
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("successful embedding lacks vector_b64"))?;
                let vector = decode_vector_f32le(payload)?;
                let mut state = lock(&inner);
                if let Some(dims) = state.dimensions {
                    if vector.len() != dims {
                        anyhow::bail!(
                            "embedding for trial {} has {} dimensions, run established {}",
                            record.trial_id,
                            vector.len(),
                            dims
                        );
                    }
                } else {
                    state.dimensions = Some(vector.len());
                }
                state.k_eligible += 1;
                state.pending.insert(record.trial_id, vector);
                Ok(())
            },
            on_error(self.bus.clone()),
        ));

        let inner = self.inner.clone();
        let bus = self.bus.clone();
        let shutdown = self.shutdown.clone();
        self.subscriptions.push(self.bus.subscribe(
            Topic::BatchCompleted,
            move |event| {
                let RunEvent::BatchCompleted {
                    batch_number,
                    trial_ids,
                } = event
                else {
                    return;
                };
                let (record, follow_ups, should_stop) =
                    process_batch(&mut lock(&inner), *batch_number, trial_ids);
                bus.emit(RunEvent::ConvergenceRecord(record));
                for follow_up in follow_ups {
                    bus.emit(follow_up);
                }
                if should_stop {
                    tracing::info!(
                        target: "arbiter.monitor",
                        batch = *batch_number,
                        "stop policy met under enforcer mode; tripping convergence"
                    );
                    shutdown.trip_converged();
                }
            },
        ));
    }

    /// Emit the final `aggregates.computed` record. The monitor is the
    /// canonical emitter; external emitters are additive and the writer keeps
    /// the last one.
    pub fn finalize(&self) {
        let aggregates = {
            let state = lock(&self.inner);
            let last = state.last_record.as_ref();
            Aggregates {
                batches: state.batches_seen,
                k_attempted: state.k_attempted,
                k_eligible: state.k_eligible,
                novelty_rate: last.and_then(|r| r.novelty_rate),
                mean_max_sim_to_prior: last.and_then(|r| r.mean_max_sim_to_prior),
                stop: last.map(|r| r.stop.clone()).unwrap_or(StopBlock {
                    mode: state.stop_mode,
                    would_stop: false,
                    should_stop: false,
                    stop_reason: None,
                }),
                cluster_metrics: last.and_then(|r| r.cluster_metrics.clone()),
                computed_at: Utc::now(),
            }
        };
        self.bus.emit(RunEvent::AggregatesComputed(aggregates));
    }
}

/// One batch pass: novelty against priors, leader clustering, stop decision.
/// Returns the monitoring record, follow-up events (assignments then state
/// snapshot), and whether the enforcer should halt the run.
fn process_batch(
    state: &mut MonitorState,
    batch_number: u32,
    trial_ids: &[u32],
) -> (MonitoringRecord, Vec<RunEvent>, bool) {
    let mut batch: Vec<(u32, Vec<f32>)> = trial_ids
        .iter()
        .filter_map(|id| state.pending.remove(id).map(|v| (*id, v)))
        .collect();
    batch.sort_by_key(|(id, _)| *id);
    let has_eligible_in_batch = !batch.is_empty();

    // Novelty is measured before this batch touches the priors or clusters.
    let (novelty_rate, mean_max_sim_to_prior) = if !has_eligible_in_batch || state.priors.is_empty()
    {
        (None, None)
    } else {
        let max_sims: Vec<f64> = batch
            .iter()
            .map(|(_, v)| {
                state
                    .priors
                    .iter()
                    .map(|p| cosine_similarity(v, p))
                    .fold(f64::NEG_INFINITY, f64::max)
            })
            .collect();
        let mean = max_sims.iter().sum::<f64>() / max_sims.len() as f64;
        let novel = max_sims
            .iter()
            .filter(|s| **s < state.novelty_threshold)
            .count();
        (
            Some(novel as f64 / max_sims.len() as f64),
            Some(mean),
        )
    };

    let mut follow_ups = Vec::new();
    let mut cluster_metrics = None;
    if state.clustering.enabled {
        let clusters_before = state.clusters.len();
        let mut forced_this_batch = 0u64;
        for (trial_id, vector) in &batch {
            let (cluster_id, forced) = assign_to_cluster(state, vector);
            if forced {
                forced_this_batch += 1;
                state.forced_cumulative += 1;
            }
            state.total_assigned += 1;
            follow_ups.push(RunEvent::ClusterAssigned(ClusterAssignment {
                trial_id: *trial_id,
                cluster_id,
                batch_number,
                forced,
            }));
        }

        let distribution: Vec<u64> = state.clusters.iter().map(|c| c.count).collect();
        let entropy = distribution_entropy(&distribution);
        let js_divergence = match &state.prev_distribution {
            Some(previous) => js_divergence_log2(previous, &distribution),
            None => None,
        };
        let largest = distribution.iter().copied().max().unwrap_or(0);
        cluster_metrics = Some(ClusterMetrics {
            cluster_count: state.clusters.len(),
            new_clusters_this_batch: state.clusters.len() - clusters_before,
            largest_cluster_share: if state.total_assigned > 0 {
                largest as f64 / state.total_assigned as f64
            } else {
                0.0
            },
            cluster_distribution: distribution.clone(),
            entropy,
            effective_cluster_count: entropy.exp(),
            singleton_count: distribution.iter().filter(|c| **c == 1).count(),
            js_divergence,
            cluster_limit_hit: state
                .clustering
                .cluster_limit
                .is_some_and(|limit| state.clusters.len() >= limit),
            forced_assignments_this_batch: forced_this_batch,
            forced_assignments_cumulative: state.forced_cumulative,
        });
        state.prev_distribution = Some(distribution);

        follow_ups.push(RunEvent::ClustersState(ClustersState {
            cluster_count: state.clusters.len(),
            member_counts: state.clusters.iter().map(|c| c.count).collect(),
            forced_cumulative: state.forced_cumulative,
            dimensions: state.dimensions,
            updated_at: Utc::now(),
        }));
    }

    for (_, vector) in batch {
        state.priors.push(vector);
    }

    // Stop decision: only advisor and enforcer modes evaluate the policy.
    let evaluating = matches!(state.stop_mode, StopMode::Advisor | StopMode::Enforcer);
    let met = evaluating
        && has_eligible_in_batch
        && state.k_eligible >= u64::from(state.k_min)
        && novelty_rate.is_some_and(|rate| rate <= state.stop_policy.novelty_epsilon)
        && mean_max_sim_to_prior.is_some_and(|sim| sim >= state.stop_policy.similarity_threshold);
    if evaluating {
        if met {
            state.consecutive_met += 1;
        } else {
            state.consecutive_met = 0;
        }
    }
    let would_stop = evaluating && state.consecutive_met >= state.stop_policy.patience;
    let should_stop = would_stop && state.stop_mode == StopMode::Enforcer;

    let record = MonitoringRecord {
        batch_number,
        k_attempted: state.k_attempted,
        k_eligible: state.k_eligible,
        has_eligible_in_batch,
        novelty_rate,
        mean_max_sim_to_prior,
        recorded_at: Utc::now(),
        stop: StopBlock {
            mode: state.stop_mode,
            would_stop,
            should_stop,
            stop_reason: should_stop.then(|| "converged".to_string()),
        },
        cluster_metrics,
    };
    state.batches_seen += 1;
    state.last_record = Some(record.clone());

    (record, follow_ups, should_stop)
}

/// Leader clustering step for one vector. Joins the nearest centroid at
/// similarity >= tau, forces the nearest when the cluster limit is reached,
/// and otherwise opens a new cluster.
fn assign_to_cluster(state: &mut MonitorState, vector: &[f32]) -> (usize, bool) {
    if state.clusters.is_empty() {
        state.clusters.push(Cluster {
            centroid: vector.to_vec(),
            count: 1,
        });
        return (0, false);
    }

    let (best, best_sim) = state
        .clusters
        .iter()
        .enumerate()
        .map(|(i, c)| (i, cosine_similarity(vector, &c.centroid)))
        .fold((0, f64::NEG_INFINITY), |acc, item| {
            if item.1 > acc.1 {
                item
            } else {
                acc
            }
        });

    if best_sim >= state.clustering.tau {
        update_centroid(state, best, vector);
        (best, false)
    } else if state
        .clustering
        .cluster_limit
        .is_some_and(|limit| state.clusters.len() >= limit)
    {
        update_centroid(state, best, vector);
        (best, true)
    } else {
        state.clusters.push(Cluster {
            centroid: vector.to_vec(),
            count: 1,
        });
        (state.clusters.len() - 1, false)
    }
}

fn update_centroid(state: &mut MonitorState, index: usize, vector: &[f32]) {
    let rule = state.clustering.centroid_update_rule.clone();
    let cluster = &mut state.clusters[index];
    cluster.count += 1;
    match rule {
        CentroidUpdateRule::RunningMean => {
            let n = cluster.count as f32;
            for (c, v) in cluster.centroid.iter_mut().zip(vector) {
                *c += (*v - *c) / n;
            }
        }
        CentroidUpdateRule::Ema { alpha } => {
            let alpha = alpha as f32;
            for (c, v) in cluster.centroid.iter_mut().zip(vector) {
                *c = (1.0 - alpha) * *c + alpha * *v;
            }
            let norm: f32 = cluster.centroid.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for c in &mut cluster.centroid {
                    *c /= norm;
                }
            }
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

/// Shannon entropy of a count distribution, natural log.
fn distribution_entropy(counts: &[u64]) -> f64 {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    -counts
        .iter()
        .filter(|c| **c > 0)
        .map(|c| {
            let p = *c as f64 / total as f64;
            p * p.ln()
        })
        .sum::<f64>()
}

/// Jensen-Shannon divergence between two count distributions, log base 2.
/// Shorter distributions are zero-padded; null when either total is zero.
fn js_divergence_log2(p_counts: &[u64], q_counts: &[u64]) -> Option<f64> {
    let total_p: u64 = p_counts.iter().sum();
    let total_q: u64 = q_counts.iter().sum();
    if total_p == 0 || total_q == 0 {
        return None;
    }
    let len = p_counts.len().max(q_counts.len());
    let p = |i: usize| *p_counts.get(i).unwrap_or(&0) as f64 / total_p as f64;
    let q = |i: usize| *q_counts.get(i).unwrap_or(&0) as f64 / total_q as f64;

    let mut divergence = 0.0;
    for i in 0..len {
        let (pi, qi) = (p(i), q(i));
        let mi = (pi + qi) / 2.0;
        if pi > 0.0 {
            divergence += 0.5 * pi * (pi / mi).log2();
        }
        if qi > 0.0 {
            divergence += 0.5 * qi * (qi / mi).log2();
        }
    }
    Some(divergence)
}

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::ResolvedConfig;
use crate::records::{
    Aggregates, ClusterAssignment, ClustersState, EmbeddingRecord, EmbeddingsProvenance,
    MonitoringRecord, ParsedOutput, PlanEntry, StopReason, TrialRecord,
};

/// Closed set of bus topics. Every `RunEvent` maps to exactly one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    RunStarted,
    TrialPlanned,
    TrialCompleted,
    ParsedOutput,
    EmbeddingRecorded,
    BatchStarted,
    BatchCompleted,
    ConvergenceRecord,
    ClusterAssigned,
    ClustersState,
    AggregatesComputed,
    EmbeddingsFinalized,
    ArtifactWritten,
    WarningRaised,
    RunCompleted,
    RunFailed,
}

impl Topic {
    pub const ALL: [Topic; 16] = [
        Topic::RunStarted,
        Topic::TrialPlanned,
        Topic::TrialCompleted,
        Topic::ParsedOutput,
        Topic::EmbeddingRecorded,
        Topic::BatchStarted,
        Topic::BatchCompleted,
        Topic::ConvergenceRecord,
        Topic::ClusterAssigned,
        Topic::ClustersState,
        Topic::AggregatesComputed,
        Topic::EmbeddingsFinalized,
        Topic::ArtifactWritten,
        Topic::WarningRaised,
        Topic::RunCompleted,
        Topic::RunFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::RunStarted => "run.started",
            Topic::TrialPlanned => "trial.planned",
            Topic::TrialCompleted => "trial.completed",
            Topic::ParsedOutput => "parsed.output",
            Topic::EmbeddingRecorded => "embedding.recorded",
            Topic::BatchStarted => "batch.started",
            Topic::BatchCompleted => "batch.completed",
            Topic::ConvergenceRecord => "convergence.record",
            Topic::ClusterAssigned => "cluster.assigned",
            Topic::ClustersState => "clusters.state",
            Topic::AggregatesComputed => "aggregates.computed",
            Topic::EmbeddingsFinalized => "embeddings.finalized",
            Topic::ArtifactWritten => "artifact.written",
            Topic::WarningRaised => "warning.raised",
            Topic::RunCompleted => "run.completed",
            Topic::RunFailed => "run.failed",
        }
    }

    /// Parse a topic name. `monitoring.record` is accepted as an alias for
    /// `convergence.record`.
    pub fn parse(name: &str) -> Option<Topic> {
        Topic::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == name)
            .or(match name {
                "monitoring.record" => Some(Topic::ConvergenceRecord),
                _ => None,
            })
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload broadcast through the run's event bus.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        started_at: DateTime<Utc>,
        k_planned: u32,
        plan_sha256: String,
        config_sha256: String,
        config: Arc<ResolvedConfig>,
    },
    TrialPlanned(PlanEntry),
    TrialCompleted(TrialRecord),
    ParsedOutput(ParsedOutput),
    EmbeddingRecorded(EmbeddingRecord),
    BatchStarted {
        batch_number: u32,
        trial_ids: Vec<u32>,
    },
    BatchCompleted {
        batch_number: u32,
        trial_ids: Vec<u32>,
    },
    ConvergenceRecord(MonitoringRecord),
    ClusterAssigned(ClusterAssignment),
    ClustersState(ClustersState),
    AggregatesComputed(Aggregates),
    EmbeddingsFinalized(EmbeddingsProvenance),
    ArtifactWritten {
        path: String,
    },
    WarningRaised {
        component: String,
        message: String,
    },
    RunCompleted {
        stop_reason: StopReason,
        completed_at: DateTime<Utc>,
    },
    RunFailed {
        error: String,
        completed_at: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn topic(&self) -> Topic {
        match self {
            RunEvent::RunStarted { .. } => Topic::RunStarted,
            RunEvent::TrialPlanned(_) => Topic::TrialPlanned,
            RunEvent::TrialCompleted(_) => Topic::TrialCompleted,
            RunEvent::ParsedOutput(_) => Topic::ParsedOutput,
            RunEvent::EmbeddingRecorded(_) => Topic::EmbeddingRecorded,
            RunEvent::BatchStarted { .. } => Topic::BatchStarted,
            RunEvent::BatchCompleted { .. } => Topic::BatchCompleted,
            RunEvent::ConvergenceRecord(_) => Topic::ConvergenceRecord,
            RunEvent::ClusterAssigned(_) => Topic::ClusterAssigned,
            RunEvent::ClustersState(_) => Topic::ClustersState,
            RunEvent::AggregatesComputed(_) => Topic::AggregatesComputed,
            RunEvent::EmbeddingsFinalized(_) => Topic::EmbeddingsFinalized,
            RunEvent::ArtifactWritten { .. } => Topic::ArtifactWritten,
            RunEvent::WarningRaised { .. } => Topic::WarningRaised,
            RunEvent::RunCompleted { .. } => Topic::RunCompleted,
            RunEvent::RunFailed { .. } => Topic::RunFailed,
        }
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};

use arbiter_backend::{Backend, MockBackend, OpenRouterBackend};
use arbiter_core::{build_plan, RunOrchestrator, ShutdownSignal};
use arbiter_schemas::{validate, SchemaError, SchemaKind};
use arbiter_types::{ResolvedConfig, StopReason};

#[derive(Parser, Debug)]
#[command(name = "arbiter")]
#[command(about = "Samples LLM backends under a fixed measurement procedure", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a run and write its artifact directory.
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, value_enum, default_value_t = Mode::Mock)]
        mode: Mode,
        /// Override output.runs_dir from the config.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        workers: Option<u32>,
        #[arg(long)]
        batch_size: Option<u32>,
        /// Cap the number of planned trials (overrides execution.k_max).
        #[arg(long)]
        max_trials: Option<u32>,
    },
    /// Materialize the deterministic plan without executing it.
    Plan {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        max_trials: Option<u32>,
    },
    /// Check a config against the schema and planner preflight.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Mock,
    Live,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            mode,
            out,
            workers,
            batch_size,
            max_trials,
        } => {
            let mut resolved = load_config(&config)?;
            apply_overrides(&mut resolved, out, workers, batch_size, max_trials);
            validate_or_exit(&resolved);
            run(resolved, mode).await
        }
        Command::Plan { config, max_trials } => {
            let mut resolved = load_config(&config)?;
            apply_overrides(&mut resolved, None, None, None, max_trials);
            validate_or_exit(&resolved);
            print_plan(&resolved)
        }
        Command::Validate { config } => {
            let resolved = load_config(&config)?;
            validate_or_exit(&resolved);
            // Exercise the weighted lists without materializing the full plan.
            let mut preview = resolved.clone();
            preview.execution.k_max = preview.execution.k_max.min(1);
            if let Err(err) = build_plan(&preview) {
                error!("planner preflight failed: {err}");
                std::process::exit(2);
            }
            println!("configuration is valid");
            Ok(())
        }
    }
}

fn init_logging() {
    let logs_dir = resolve_logs_dir();
    match arbiter_observability::init_logging(&logs_dir, 14) {
        Ok((guard, info)) => {
            // Keep the appender alive for the process lifetime.
            std::mem::forget(guard);
            tracing::debug!(target: "arbiter.cli", logs_dir = info.logs_dir.as_str(), "file logging on");
        }
        Err(err) => {
            eprintln!("file logging unavailable: {err:#}");
            arbiter_observability::init_console_logging();
        }
    }
}

/// `ARBITER_LOGS_DIR` wins; otherwise logs live under the state root
/// (`ARBITER_STATE_DIR`, defaulting to `.arbiter`).
fn resolve_logs_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ARBITER_LOGS_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    let state_root = std::env::var("ARBITER_STATE_DIR")
        .ok()
        .filter(|dir| !dir.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".arbiter"));
    arbiter_observability::default_logs_dir(&state_root)
}

fn load_config(path: &PathBuf) -> anyhow::Result<ResolvedConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    if let Err(err) = validate(SchemaKind::ResolvedConfig, &value) {
        report_schema_error(&err);
        std::process::exit(2);
    }
    let config: ResolvedConfig = serde_json::from_value(value)
        .with_context(|| format!("deserializing {}", path.display()))?;
    Ok(config)
}

fn apply_overrides(
    config: &mut ResolvedConfig,
    out: Option<PathBuf>,
    workers: Option<u32>,
    batch_size: Option<u32>,
    max_trials: Option<u32>,
) {
    if let Some(out) = out {
        config.output.runs_dir = out;
    }
    if let Some(workers) = workers {
        config.execution.workers = workers.max(1);
    }
    if let Some(batch_size) = batch_size {
        config.execution.batch_size = batch_size.max(1);
    }
    if let Some(max_trials) = max_trials {
        config.execution.k_max = max_trials;
    }
}

fn validate_or_exit(config: &ResolvedConfig) {
    let value = match serde_json::to_value(config) {
        Ok(value) => value,
        Err(err) => {
            error!("config serialization failed: {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = validate(SchemaKind::ResolvedConfig, &value) {
        report_schema_error(&err);
        std::process::exit(2);
    }
}

fn report_schema_error(err: &SchemaError) {
    match err {
        SchemaError::Invalid { violations, .. } => {
            error!("configuration is invalid:");
            for violation in violations {
                error!("  {violation}");
            }
        }
        other => error!("configuration validation failed: {other}"),
    }
}

async fn run(config: ResolvedConfig, mode: Mode) -> anyhow::Result<()> {
    let backend: Arc<dyn Backend> = match mode {
        Mode::Mock => Arc::new(MockBackend::new()),
        Mode::Live => Arc::new(OpenRouterBackend::from_env()?),
    };

    let shutdown = ShutdownSignal::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; draining inflight trials (press again to abort)");
            signal.request_user_interrupt();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("second interrupt; aborting immediately");
            std::process::exit(130);
        }
    });

    let orchestrator = RunOrchestrator::new(Arc::new(config), backend, shutdown);
    let outcome = orchestrator.execute().await?;

    info!(
        run_id = outcome.run_id.as_str(),
        stop_reason = outcome.stop_reason.as_str(),
        incomplete = outcome.incomplete,
        dir = %outcome.run_dir.display(),
        "run directory written"
    );
    println!("{}", outcome.run_dir.display());

    // Contract-policy `fail` (and orchestrator failures) surface as an error
    // stop; a user interrupt still exits cleanly.
    if outcome.stop_reason == StopReason::Error {
        std::process::exit(1);
    }
    Ok(())
}

fn print_plan(config: &ResolvedConfig) -> anyhow::Result<()> {
    let plan = build_plan(config)?;
    let mut stdout = std::io::stdout().lock();
    use std::io::Write;
    for entry in &plan.entries {
        serde_json::to_writer(&mut stdout, entry)?;
        writeln!(stdout)?;
    }
    writeln!(stdout, "plan_sha256: {}", plan.sha256)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::parse_from([
            "arbiter",
            "run",
            "--config",
            "config.json",
            "--mode",
            "mock",
            "--workers",
            "4",
            "--batch-size",
            "8",
            "--max-trials",
            "32",
        ]);
        match cli.command {
            Command::Run {
                mode,
                workers,
                batch_size,
                max_trials,
                ..
            } => {
                assert_eq!(mode, Mode::Mock);
                assert_eq!(workers, Some(4));
                assert_eq!(batch_size, Some(8));
                assert_eq!(max_trials, Some(32));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

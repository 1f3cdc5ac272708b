//! Stand-alone driver for one script step.
//!
//! Loads job properties (layered over the job type's system properties),
//! runs the step through the lifecycle controller with an in-memory host and
//! writes the generated properties as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{error, info};

use scriptjob::core::params::ParameterSet;
use scriptjob::core::types::{PreconditionVerdict, StepStatus};
use scriptjob::exit_codes;
use scriptjob::gate::PreconditionGate;
use scriptjob::io::command::CommandEngine;
use scriptjob::io::config::{JobTypeConfig, load_config, load_properties};
use scriptjob::io::engine::ScriptEngine;
use scriptjob::io::events::{FlowEvent, FlowEvents};
use scriptjob::io::expression::ExpressionEngine;
use scriptjob::io::host::InMemoryHost;
use scriptjob::io::output::{to_json_string, write_json};
use scriptjob::io::overlay::{AmbientProperties, OverlayGate};
use scriptjob::job::{JobLifecycleController, step_ref};
use scriptjob::logging;

#[derive(Parser)]
#[command(
    name = "scriptjob",
    version,
    about = "Run a script as one step of a workflow"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the step and write its generated properties.
    Run {
        #[command(flatten)]
        input: InputArgs,
        /// Where to write the generated properties (stdout when omitted).
        #[arg(short, long, env = "JOB_OUTPUT_PROP_FILE")]
        output: Option<PathBuf>,
        /// Script engine used to run `script.file`.
        #[arg(long, value_enum, default_value_t = EngineKind::Expr)]
        engine: EngineKind,
    },
    /// Evaluate `flow.skip` / `flow.noop` without running anything.
    Check {
        #[command(flatten)]
        input: InputArgs,
    },
}

#[derive(clap::Args)]
struct InputArgs {
    /// Job properties file (TOML).
    #[arg(short, long, env = "JOB_PROP_FILE")]
    props: PathBuf,
    /// Job type configuration file (TOML); defaults apply when missing.
    #[arg(short, long, default_value = "scriptjob.toml")]
    config: PathBuf,
    /// Step identifier.
    #[arg(short, long)]
    step: String,
    /// Flow scope the step belongs to.
    #[arg(long, default_value = "flow")]
    scope: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    /// Evaluate the script as a minijinja expression.
    Expr,
    /// Spawn the script as an executable.
    Command,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            input,
            output,
            engine,
        } => cmd_run(&input, output.as_deref(), engine),
        Command::Check { input } => cmd_check(&input),
    }
}

fn load_inputs(input: &InputArgs) -> Result<(JobTypeConfig, ParameterSet)> {
    let cfg = load_config(&input.config)?;
    let job = load_properties(&input.props).context("load job properties")?;
    let params = ParameterSet::with_parent(job, ParameterSet::from_map(cfg.system.clone()));
    Ok((cfg, params))
}

fn cmd_run(input: &InputArgs, output: Option<&Path>, engine: EngineKind) -> Result<i32> {
    let (cfg, params) = load_inputs(input)?;
    let step = step_ref(&input.step, &params)?;

    let host = Arc::new(InMemoryHost::new());
    host.register_step(&step, input.scope.clone());
    let events = Arc::new(FlowEvents::new(host.clone()));
    let ambient = Arc::new(AmbientProperties::new());
    let gate = Arc::new(OverlayGate::new(ambient.clone()));
    let engine: Arc<dyn ScriptEngine> = match engine {
        EngineKind::Expr => Arc::new(ExpressionEngine::with_ambient(ambient)),
        EngineKind::Command => Arc::new(CommandEngine::from_config(&cfg)),
    };

    let job = JobLifecycleController::new(step.clone(), params, host.clone(), engine, gate)
        .with_config(&cfg)
        .with_events(events.clone());

    let result = job.run();
    let status = match &result {
        Ok(outcome) if outcome.phase() == scriptjob::JobPhase::Skipped => StepStatus::Skipped,
        Ok(_) => StepStatus::Succeeded,
        Err(scriptjob::JobError::Cancelled) => StepStatus::Cancelled,
        Err(_) => StepStatus::Failed,
    };
    events.publish(&FlowEvent::ScopeFinished {
        exec_id: step.exec_id,
        scope_id: input.scope.clone(),
        status,
    });

    match result {
        Ok(outcome) => {
            info!(phase = ?outcome.phase(), "step finished");
            match output {
                Some(path) => write_json(path, outcome.output())?,
                None => print!("{}", to_json_string(outcome.output())?),
            }
            if !host.failed_scopes().is_empty() {
                error!(scope = %input.scope, "scope marked failed by a finish callback");
                return Ok(exit_codes::FAILED);
            }
            Ok(exit_codes::OK)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(exit_codes::for_error(&err))
        }
    }
}

fn cmd_check(input: &InputArgs) -> Result<i32> {
    let (_, params) = load_inputs(input)?;
    let params = params.resolve()?;
    let step = step_ref(&input.step, &params)?;
    let host = InMemoryHost::new();
    host.register_step(&step, input.scope.clone());

    let verdict = PreconditionGate::new(&host).evaluate(&step, &params)?;
    let report = match &verdict {
        PreconditionVerdict::Proceed => json!({ "verdict": "proceed" }),
        PreconditionVerdict::Skip(output) => json!({ "verdict": "skip", "output": output }),
        PreconditionVerdict::Noop(output) => json!({ "verdict": "noop", "output": output }),
    };
    print!("{}", to_json_string(&report)?);
    Ok(exit_codes::OK)
}

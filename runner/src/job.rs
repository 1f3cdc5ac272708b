//! Lifecycle of one script step invocation.
//!
//! ```text
//! Init -> PreconditionCheck -> Skipped | Noop
//!                           -> Running -> Completed | TimedOut | Failed | Cancelled
//! ```
//!
//! [`JobLifecycleController::run`] drives the whole pipeline on the calling
//! thread. [`JobLifecycleController::progress`] and
//! [`JobLifecycleController::cancel`] may be called from other threads while it
//! runs.

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::core::error::JobError;
use crate::core::keys;
use crate::core::params::ParameterSet;
use crate::core::reconcile::reconcile;
use crate::core::task::{CancelFlag, ProgressSlot, TaskOutcome};
use crate::core::types::{JobPhase, OutputPropertySet, PreconditionVerdict, StepRef};
use crate::executor::ScriptTaskExecutor;
use crate::gate::PreconditionGate;
use crate::io::config::JobTypeConfig;
use crate::io::engine::{Classpath, ScriptBinding, ScriptEngine, ScriptRequest};
use crate::io::events::{FinishHook, FlowEvents};
use crate::io::host::StepHost;
use crate::io::log_sink::ScriptLogger;
use crate::io::overlay::OverlayGate;

/// How a successful invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// `flow.skip` held; the host was told the step is skipped.
    Skipped(OutputPropertySet),
    /// `flow.noop` held; no script ran.
    Noop(OutputPropertySet),
    /// The script ran and its output was reconciled.
    Completed(OutputPropertySet),
}

impl JobOutcome {
    pub fn output(&self) -> &OutputPropertySet {
        match self {
            JobOutcome::Skipped(output) | JobOutcome::Noop(output) | JobOutcome::Completed(output) => {
                output
            }
        }
    }

    pub fn phase(&self) -> JobPhase {
        match self {
            JobOutcome::Skipped(_) => JobPhase::Skipped,
            JobOutcome::Noop(_) => JobPhase::Noop,
            JobOutcome::Completed(_) => JobPhase::Completed,
        }
    }
}

/// Step reference for `step_id`, taking the execution id from `host.flow.execid`.
pub fn step_ref(step_id: &str, params: &ParameterSet) -> Result<StepRef, JobError> {
    let exec_id = params.get_int(keys::FLOW_EXEC_ID, 0)?;
    Ok(StepRef::new(exec_id, step_id))
}

/// Script settings read once preconditions pass.
#[derive(Debug, Clone)]
struct ScriptSettings {
    request: ScriptRequest,
    timeout: Option<Duration>,
    timeout_secs: u64,
    forward: bool,
    check_output: bool,
}

impl ScriptSettings {
    fn read(params: &ParameterSet) -> Result<Self, JobError> {
        let script = params.get_required(keys::SCRIPT)?.to_string();
        let timeout_secs = params.get_int(keys::TIMEOUT, 0)?;
        let forward = params.get_bool(keys::FORWARD_PARAMETERS, false)?;
        let check_output = params.get_bool(keys::CHECK_OUTPUT, false)?;

        let workdir = match params.get(keys::WORKING_DIR) {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
            _ => env::current_dir().map_err(|err| {
                JobError::config(format!("cannot determine working directory: {err}"))
            })?,
        };
        let classpath = Classpath::resolve(params.get(keys::CLASSPATH), &workdir);

        let timeout_secs = u64::try_from(timeout_secs).unwrap_or(0);
        let timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));
        Ok(Self {
            request: ScriptRequest {
                script,
                classpath,
                workdir,
            },
            timeout,
            timeout_secs,
            forward,
            check_output,
        })
    }
}

/// Orchestrates gate, executor and reconciler for one step invocation.
pub struct JobLifecycleController {
    step: StepRef,
    params: ParameterSet,
    host: Arc<dyn StepHost>,
    engine: Arc<dyn ScriptEngine>,
    overlay: Arc<OverlayGate>,
    events: Option<Arc<FlowEvents>>,
    log_prefix: String,
    executor: ScriptTaskExecutor,
    started: AtomicBool,
    submitted: AtomicBool,
    phase: AtomicU8,
    generated: OnceLock<OutputPropertySet>,
}

impl std::fmt::Debug for JobLifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLifecycleController")
            .field("step", &self.step)
            .field("phase", &self.phase())
            .finish()
    }
}

impl JobLifecycleController {
    pub fn new(
        step: StepRef,
        params: ParameterSet,
        host: Arc<dyn StepHost>,
        engine: Arc<dyn ScriptEngine>,
        overlay: Arc<OverlayGate>,
    ) -> Self {
        let cfg = JobTypeConfig::default();
        Self {
            step,
            params,
            host,
            engine,
            executor: ScriptTaskExecutor::new(overlay.clone(), cfg.cancel_poll()),
            overlay,
            events: None,
            log_prefix: cfg.log_prefix,
            started: AtomicBool::new(false),
            submitted: AtomicBool::new(false),
            phase: AtomicU8::new(JobPhase::Init as u8),
            generated: OnceLock::new(),
        }
    }

    /// Apply log prefix and poll interval from the job type configuration.
    pub fn with_config(mut self, cfg: &JobTypeConfig) -> Self {
        self.log_prefix = cfg.log_prefix.clone();
        self.executor = ScriptTaskExecutor::new(self.overlay.clone(), cfg.cancel_poll());
        self
    }

    /// Let scripts subscribe to their enclosing scope finishing.
    pub fn with_events(mut self, events: Arc<FlowEvents>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn step(&self) -> &StepRef {
        &self.step
    }

    pub fn phase(&self) -> JobPhase {
        JobPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: JobPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn fail(&self, err: JobError) -> JobError {
        error!(step = %self.step, err = %err, "job failed");
        self.set_phase(JobPhase::Failed);
        err
    }

    /// Run the invocation to a terminal phase. Callable once.
    #[instrument(skip_all, fields(step = %self.step))]
    pub fn run(&self) -> Result<JobOutcome, JobError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(JobError::illegal_state("run may only be called once"));
        }

        let params = self.params.resolve().map_err(|err| self.fail(err))?;
        self.set_phase(JobPhase::PreconditionCheck);

        let verdict = PreconditionGate::new(self.host.as_ref())
            .evaluate(&self.step, &params)
            .map_err(|err| self.fail(err))?;
        match verdict {
            PreconditionVerdict::Skip(output) => return Ok(self.settle(JobOutcome::Skipped(output))),
            PreconditionVerdict::Noop(output) => return Ok(self.settle(JobOutcome::Noop(output))),
            PreconditionVerdict::Proceed => {}
        }

        let settings = ScriptSettings::read(&params).map_err(|err| self.fail(err))?;
        info!(
            script = %settings.request.script,
            timeout_secs = settings.timeout_secs,
            forward = settings.forward,
            check_output = settings.check_output,
            "preparing script"
        );
        self.engine
            .prepare(&settings.request)
            .map_err(|err| self.fail(JobError::setup(format!("{err:#}"))))?;

        let binding = self.binding(&params);
        let handle = self
            .executor
            .submit(self.engine.clone(), settings.request.clone(), binding)
            .map_err(|err| self.fail(err))?;
        self.set_phase(JobPhase::Running);
        self.submitted.store(true, Ordering::Release);

        let outcome = self.executor.wait(handle, settings.timeout);
        self.executor.shutdown();

        match outcome {
            TaskOutcome::Completed(value) => {
                let output = reconcile(
                    &params,
                    settings.forward,
                    settings.check_output,
                    value.as_ref(),
                )
                .map_err(|err| self.fail(err))?;
                Ok(self.settle(JobOutcome::Completed(output)))
            }
            TaskOutcome::TimedOut => {
                warn!(timeout_secs = settings.timeout_secs, "script timed out");
                self.set_phase(JobPhase::TimedOut);
                Err(JobError::Timeout {
                    secs: settings.timeout_secs,
                })
            }
            TaskOutcome::Failed(err) => Err(self.fail(err)),
            TaskOutcome::Cancelled => {
                info!("job cancelled");
                self.set_phase(JobPhase::Cancelled);
                Err(JobError::Cancelled)
            }
        }
    }

    fn settle(&self, outcome: JobOutcome) -> JobOutcome {
        let _ = self.generated.set(outcome.output().clone());
        self.set_phase(outcome.phase());
        info!(phase = ?outcome.phase(), entries = outcome.output().len(), "job finished");
        outcome
    }

    fn binding(&self, params: &ParameterSet) -> ScriptBinding {
        let on_finish = self.events.as_ref().and_then(|events| {
            let info = self.host.lookup_step(&self.step)?;
            Some(FinishHook::new(events.clone(), self.step.exec_id, info.scope_id))
        });
        ScriptBinding {
            config: params.flatten(),
            props: Arc::new(params.clone()),
            progress: ProgressSlot::new(),
            cancel: CancelFlag::new(),
            log: ScriptLogger::new(self.step.step_id.clone(), self.log_prefix.clone()),
            step: self.step.clone(),
            on_finish,
        }
    }

    /// Live progress while running, 1.0 once completed, otherwise 0.0.
    pub fn progress(&self) -> f64 {
        match self.phase() {
            JobPhase::Running => self.executor.progress(),
            JobPhase::Completed => 1.0,
            _ => 0.0,
        }
    }

    /// Ask a running script to stop.
    ///
    /// Fails with `IllegalState` before the script was started and with
    /// `CancelRejected` once it has already ended.
    pub fn cancel(&self) -> Result<(), JobError> {
        if !self.submitted.load(Ordering::Acquire) {
            return Err(JobError::illegal_state(format!(
                "cannot cancel a job in phase {:?}",
                self.phase()
            )));
        }
        info!(step = %self.step, "cancel requested");
        if self.executor.cancel()? {
            Ok(())
        } else {
            Err(JobError::CancelRejected)
        }
    }

    /// Output stored by a successful run.
    pub fn generated_properties(&self) -> Option<&OutputPropertySet> {
        self.generated.get()
    }
}

//! Skip / no-op / proceed decision for one step invocation.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{info, instrument};

use crate::core::condition::is_true;
use crate::core::error::JobError;
use crate::core::keys;
use crate::core::params::ParameterSet;
use crate::core::reconcile::forward_parameters;
use crate::core::types::{OutputPropertySet, PreconditionVerdict, StepRef, StepStatus};
use crate::io::host::StepHost;

/// Decides whether a step runs, based on `flow.skip` and `flow.noop`.
pub struct PreconditionGate<'a> {
    host: &'a dyn StepHost,
}

impl<'a> PreconditionGate<'a> {
    pub fn new(host: &'a dyn StepHost) -> Self {
        Self { host }
    }

    /// Produce exactly one verdict for `step`.
    ///
    /// A skip is reported to the host as [`StepStatus::Skipped`] before the
    /// verdict is returned. `params` should already be resolved.
    #[instrument(skip_all, fields(step = %step))]
    pub fn evaluate(
        &self,
        step: &StepRef,
        params: &ParameterSet,
    ) -> Result<PreconditionVerdict, JobError> {
        info!("Checking pre-conditions");
        let config = params.flatten();

        if condition_holds(params, keys::SKIP, &step.step_id, &config) {
            info!("Skip condition is true, skipping the step");
            self.host
                .report_status(step, StepStatus::Skipped, Utc::now())
                .map_err(|err| JobError::Host(format!("{err:#}")))?;
            let mut output = BTreeMap::new();
            output.insert(keys::SKIP.to_string(), "true".to_string());
            return Ok(PreconditionVerdict::Skip(OutputPropertySet::from_map(output)));
        }

        if condition_holds(params, keys::NOOP, &step.step_id, &config) {
            info!("No-op condition is true, completing without running the script");
            let output = if params.get_bool(keys::FORWARD_PARAMETERS, false)? {
                forward_parameters(params)
            } else {
                BTreeMap::new()
            };
            return Ok(PreconditionVerdict::Noop(OutputPropertySet::from_map(output)));
        }

        info!("Pre-conditions passed");
        Ok(PreconditionVerdict::Proceed)
    }
}

fn condition_holds(
    params: &ParameterSet,
    key: &str,
    step_id: &str,
    config: &BTreeMap<String, String>,
) -> bool {
    params
        .get(key)
        .is_some_and(|raw| is_true(raw, step_id, config))
}

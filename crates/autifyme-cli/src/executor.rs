//! Step executor that walks a workflow definition without doing real work.
//!
//! Each step completes immediately: the step's declared `output` is merged
//! into the workflow data and the definition's successor becomes the next
//! step. AI-costly steps report [`NOMINAL_UNITS`] against the provider the
//! engine resolved, so dry runs exercise routing and the cost ledger.

use async_trait::async_trait;

use autifyme_core::engine::{DefinitionRegistry, StepContext, StepExecutor, StepOutcome, StepResponse};

/// Usage reported for every AI-costly step.
pub const NOMINAL_UNITS: u64 = 1_000;

pub struct DefinitionWalker {
    definitions: DefinitionRegistry,
}

impl DefinitionWalker {
    pub fn new(definitions: DefinitionRegistry) -> Self {
        Self { definitions }
    }
}

#[async_trait]
impl StepExecutor for DefinitionWalker {
    async fn execute(&self, ctx: StepContext) -> Result<StepResponse, String> {
        let definition = self
            .definitions
            .get(&ctx.workflow_type)
            .ok_or_else(|| format!("no definition for workflow type '{}'", ctx.workflow_type))?;
        let step = definition.step(&ctx.step_name).ok_or_else(|| {
            format!("step '{}' is not part of '{}'", ctx.step_name, ctx.workflow_type)
        })?;

        let patch = step.output.clone();
        let outcome = match definition.successor(&step.name) {
            Some(next) => StepOutcome::next(next.name.clone(), patch),
            None => StepOutcome::finish(patch),
        };

        let mut response = StepResponse::new(outcome);
        if step.ai_costly {
            if let Some(ref provider) = ctx.provider {
                tracing::debug!(
                    "[Walker] '{}' charged {} units to {}",
                    step.name,
                    NOMINAL_UNITS,
                    provider.id()
                );
                response = response.with_usage(NOMINAL_UNITS);
            }
        }
        Ok(response)
    }
}
